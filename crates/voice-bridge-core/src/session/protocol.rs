//! Wire protocol for the realtime model session: JSON messages over the
//! WebSocket transport opened by [`super::SessionAdapter`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SessionParams;

/// A client-to-model control message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session at open: model, instructions, audio format, turn detection.
    #[serde(rename = "realtime")]
    Realtime {
        /// Requested model identifier.
        model: String,
        /// System instructions.
        instructions: String,
        /// Always `["audio"]`.
        output_modalities: Vec<&'static str>,
        /// Input/output audio format and turn-detection configuration.
        audio: SessionAudioConfig,
    },
    /// Append base64-encoded PCM16 audio to the server-side input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded little-endian PCM16 mono audio at the session rate.
        audio: String,
    },
    /// Discard any buffered (not yet committed) input audio.
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    /// Ask the model to start generating a response.
    #[serde(rename = "response.create")]
    ResponseCreate,
    /// Cancel the in-flight response, if any (used on barge-in).
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// The `audio` object carried by [`ClientEvent::Realtime`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionAudioConfig {
    /// Inbound caller audio format and turn detection.
    pub input: SessionAudioInput,
    /// Outbound synthesized audio format and voice.
    pub output: SessionAudioOutput,
}

/// `audio.input` — always PCM16 at 24 kHz, semantic VAD with auto-response and auto-interrupt.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAudioInput {
    /// Always `{type: "audio/pcm", rate: 24000}`.
    pub format: Value,
    /// Always `{type: "semantic_vad", create_response: true, interrupt_response: true}`.
    pub turn_detection: Value,
}

/// `audio.output` — always PCM16 at 24 kHz, with an optional requested voice.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAudioOutput {
    /// Always `{type: "audio/pcm", rate: 24000}`.
    pub format: Value,
    /// Requested voice, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl ClientEvent {
    /// Build the session-open `realtime` event from bridge-level [`SessionParams`].
    pub fn realtime_from_params(params: &SessionParams) -> Self {
        ClientEvent::Realtime {
            model: params.model.clone(),
            instructions: params.instructions.clone(),
            output_modalities: vec!["audio"],
            audio: SessionAudioConfig {
                input: SessionAudioInput {
                    format: serde_json::json!({ "type": "audio/pcm", "rate": 24_000 }),
                    turn_detection: serde_json::json!({
                        "type": "semantic_vad",
                        "create_response": true,
                        "interrupt_response": true,
                    }),
                },
                output: SessionAudioOutput {
                    format: serde_json::json!({ "type": "audio/pcm", "rate": 24_000 }),
                    voice: params.voice.clone(),
                },
            },
        }
    }
}

/// A model-to-client server event, with a typed fast path for the events the
/// bridge actually reacts to and a raw fallback for everything else.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Session accepted and configured.
    SessionUpdated,
    /// The model began generating a response (watchdog should start counting down).
    ResponseCreated,
    /// One chunk of synthesized speech, base64-decoded to raw PCM16 bytes.
    AudioDelta {
        /// Decoded little-endian PCM16 mono audio at the session rate.
        audio: Vec<u8>,
    },
    /// One chunk of incremental transcript text.
    TranscriptDelta {
        /// Who the transcript is attributed to.
        role: TranscriptDeltaRole,
        /// Incremental text.
        delta: String,
    },
    /// Server VAD detected the caller starting to speak (barge-in signal).
    SpeechStarted,
    /// Server VAD detected the caller stopping speaking.
    SpeechStopped,
    /// The model finished generating a response.
    ResponseDone,
    /// A tool/function call the model wants invoked.
    ToolCall {
        /// Tool/function name.
        name: String,
        /// JSON-encoded call arguments.
        arguments: String,
        /// Call id, echoed back in the tool result.
        call_id: String,
    },
    /// A protocol-level error reported by the model. Not all error codes are
    /// fatal — see [`crate::event_router`]'s benign-error ignore list.
    Error {
        /// The error's `code` field, if present (e.g. `"response_cancel_not_active"`).
        code: Option<String>,
        /// Human-readable error message.
        message: String,
    },
    /// Any event this bridge doesn't have a typed case for, kept verbatim so
    /// future model protocol revisions degrade gracefully instead of being dropped.
    Raw {
        /// The event's `type` discriminant.
        kind: String,
        /// The full decoded JSON payload.
        json: Value,
    },
}

/// Who a [`ServerEvent::TranscriptDelta`] is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptDeltaRole {
    /// Transcribed caller speech.
    User,
    /// Synthesized assistant speech transcript.
    Assistant,
}

#[derive(Deserialize)]
struct TaggedEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    rest: Value,
}

impl ServerEvent {
    /// Parse one server event from its raw JSON text.
    ///
    /// Only the "GA" event shape is recognized; the legacy "beta" dual-shape
    /// variants are intentionally not parsed. Anything unrecognized falls
    /// back to [`ServerEvent::Raw`] rather than being treated as a parse error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: TaggedEnvelope = serde_json::from_str(text)?;
        Ok(Self::from_envelope(envelope.kind, envelope.rest))
    }

    fn from_envelope(kind: String, json: Value) -> Self {
        match kind.as_str() {
            "session.updated" => ServerEvent::SessionUpdated,
            "response.created" => ServerEvent::ResponseCreated,
            "response.output_audio.delta" => {
                let b64 = json.get("delta").and_then(Value::as_str).unwrap_or_default();
                let audio = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
                    .unwrap_or_default();
                ServerEvent::AudioDelta { audio }
            }
            "response.transcript.delta" => {
                let role = match json.get("role").and_then(Value::as_str) {
                    Some("user") => TranscriptDeltaRole::User,
                    _ => TranscriptDeltaRole::Assistant,
                };
                ServerEvent::TranscriptDelta {
                    role,
                    delta: json.get("delta").and_then(Value::as_str).unwrap_or_default().to_string(),
                }
            }
            "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
            "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
            "response.completed" => ServerEvent::ResponseDone,
            "response.function_call_arguments.done" | "response.mcp_call.completed" => ServerEvent::ToolCall {
                name: json.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                arguments: json.get("arguments").and_then(Value::as_str).unwrap_or_default().to_string(),
                call_id: json.get("call_id").and_then(Value::as_str).unwrap_or_default().to_string(),
            },
            "error" => ServerEvent::Error {
                code: json.get("error").and_then(|e| e.get("code")).and_then(Value::as_str).map(str::to_string),
                message: json
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown model error")
                    .to_string(),
            },
            other => ServerEvent::Raw { kind: other.to_string(), json },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_updated_parses() {
        let evt = ServerEvent::parse(r#"{"type":"session.updated"}"#).unwrap();
        assert!(matches!(evt, ServerEvent::SessionUpdated));
    }

    #[test]
    fn audio_delta_decodes_base64() {
        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [1u8, 2, 3]);
        let text = format!(r#"{{"type":"response.output_audio.delta","delta":"{b64}"}}"#);
        let evt = ServerEvent::parse(&text).unwrap();
        match evt {
            ServerEvent::AudioDelta { audio } => assert_eq!(audio, vec![1, 2, 3]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_falls_back_to_raw() {
        let evt = ServerEvent::parse(r#"{"type":"some.future.event","foo":1}"#).unwrap();
        match evt {
            ServerEvent::Raw { kind, .. } => assert_eq!(kind, "some.future.event"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_event_extracts_message_and_code() {
        let evt =
            ServerEvent::parse(r#"{"type":"error","error":{"code":"bad_request","message":"bad request"}}"#).unwrap();
        match evt {
            ServerEvent::Error { code, message } => {
                assert_eq!(code.as_deref(), Some("bad_request"));
                assert_eq!(message, "bad request");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn client_event_realtime_serializes_with_nested_audio_shape() {
        let params = SessionParams {
            model: "test-model".to_string(),
            voice: Some("ember".to_string()),
            instructions: "be terse".to_string(),
            speak_first: false,
        };
        let event = ClientEvent::realtime_from_params(&params);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "realtime");
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["output_modalities"], serde_json::json!(["audio"]));
        assert_eq!(json["audio"]["input"]["format"]["rate"], 24_000);
        assert_eq!(json["audio"]["input"]["turn_detection"]["type"], "semantic_vad");
        assert_eq!(json["audio"]["input"]["turn_detection"]["create_response"], true);
        assert_eq!(json["audio"]["output"]["voice"], "ember");
    }
}
