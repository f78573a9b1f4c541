//! Event Router: the two cooperating tasks that move audio and control
//! events between the [`crate::rtp_producer::RtpStreamProducer`] /
//! [`crate::bridge::AudioBridge`] pair and the realtime model session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::AudioBridge;
use crate::config::EventRouterConfig;
use crate::error::Error;
use crate::rtp_producer::RtpStreamProducer;
use crate::session::protocol::{ServerEvent, TranscriptDeltaRole};
use crate::session::{SessionReader, SessionWriter};
use crate::types::{CallDiagnostics, DiagnosticPhase, TranscriptEntry, TranscriptRole, VoiceBridgeHooks};

/// Server-reported error codes that reflect an expected race rather than a
/// real protocol failure, and so must not tear the call down.
const BENIGN_ERROR_CODES: &[&str] = &["response_cancel_not_active", "conversation_already_has_active_response"];

/// Shared, lock-protected outcome of routing: accumulated transcript and the
/// last protocol-level error observed, if any.
#[derive(Default)]
pub struct EventRouterOutcome {
    /// Transcript lines in arrival order.
    pub transcripts: Mutex<Vec<TranscriptEntry>>,
    /// Set once a non-recoverable model protocol error is observed.
    pub fatal_error: Mutex<Option<String>>,
}

/// Runs the inbound (model → bridge/hooks) and outbound (port → model) loops.
pub struct EventRouter {
    config: EventRouterConfig,
    bridge: Arc<AudioBridge>,
    hooks: VoiceBridgeHooks,
    outcome: Arc<EventRouterOutcome>,
    barge_in: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
}

/// Control message the inbound loop sends the outbound loop, since the
/// WebSocket's write half lives on the outbound task.
enum ControlCommand {
    Cancel,
    ResponseCreate,
}

/// Handle to a running [`EventRouter`]; dropping it does not stop the router,
/// call [`RouterHandle::stop`] explicitly as part of call teardown.
pub struct RouterHandle {
    outbound_task: JoinHandle<()>,
    inbound_task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    outcome: Arc<EventRouterOutcome>,
    barge_in: Arc<AtomicBool>,
}

impl RouterHandle {
    /// Signal both loops to stop and wait for them to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.outbound_task.await;
        let _ = self.inbound_task.await;
    }

    /// Snapshot the transcript accumulated so far.
    pub fn transcripts(&self) -> Vec<TranscriptEntry> {
        self.outcome.transcripts.lock().clone()
    }

    /// The last fatal model protocol error observed, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.outcome.fatal_error.lock().clone()
    }

    /// True while the model's server VAD believes the caller is actively speaking.
    pub fn is_barge_in_active(&self) -> bool {
        self.barge_in.load(Ordering::Relaxed)
    }
}

impl EventRouter {
    /// Build a router over `bridge`, dispatching `hooks` as events arrive.
    pub fn new(config: EventRouterConfig, bridge: Arc<AudioBridge>, hooks: VoiceBridgeHooks) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            config,
            bridge,
            hooks,
            outcome: Arc::new(EventRouterOutcome::default()),
            barge_in: Arc::new(AtomicBool::new(false)),
            stop_tx,
        }
    }

    /// Spawn the inbound and outbound loops, returning a handle to stop them.
    ///
    /// `speak_first` suppresses the caller-speech-triggered `response.create`
    /// in favor of one sent eagerly by the call controller before this is called.
    /// `diagnostics`/`started_at` let the inbound loop record [`DiagnosticPhase::FirstTts`].
    /// `on_barge_in_started`/`on_barge_in_resolved` drive the call's state machine
    /// in and out of [`crate::call::CallState::Interrupting`] as barge-in is
    /// detected and the assistant resumes speaking.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        self,
        writer: SessionWriter,
        reader: SessionReader,
        rtp: RtpStreamProducer,
        speak_first: bool,
        diagnostics: Arc<Mutex<CallDiagnostics>>,
        started_at: Instant,
        on_barge_in_started: Arc<dyn Fn() + Send + Sync>,
        on_barge_in_resolved: Arc<dyn Fn() + Send + Sync>,
    ) -> RouterHandle {
        let stop_rx_outbound = self.stop_tx.subscribe();
        let stop_rx_inbound = self.stop_tx.subscribe();
        let (control_tx, control_rx) = tokio::sync::mpsc::channel(4);
        let barge_in = self.barge_in.clone();

        let outbound_task = tokio::spawn(Self::run_outbound(writer, rtp, control_rx, stop_rx_outbound));
        let inbound_task = tokio::spawn(Self::run_inbound(
            reader,
            self.bridge,
            self.hooks,
            self.outcome.clone(),
            self.barge_in,
            control_tx,
            self.config,
            stop_rx_inbound,
            speak_first,
            diagnostics,
            started_at,
            on_barge_in_started,
            on_barge_in_resolved,
        ));

        RouterHandle { outbound_task, inbound_task, stop_tx: self.stop_tx, outcome: self.outcome, barge_in }
    }

    async fn run_outbound(
        mut writer: SessionWriter,
        mut rtp: RtpStreamProducer,
        mut control_rx: tokio::sync::mpsc::Receiver<ControlCommand>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                cmd = control_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Cancel) => {
                            if let Err(e) = writer.response_cancel().await {
                                warn!(error = %e, "failed to send response.cancel");
                            }
                        }
                        Some(ControlCommand::ResponseCreate) => {
                            if let Err(e) = writer.response_create().await {
                                warn!(error = %e, "failed to send response.create");
                            }
                        }
                        None => {}
                    }
                }
                packet = rtp.next() => {
                    let Some(packet) = packet else { break };
                    if let Err(e) = writer.send_audio(&packet.payload).await {
                        warn!(error = %e, "failed to forward inbound audio to model session");
                        break;
                    }
                }
            }
        }
        let _ = writer.close().await;
        debug!("event router outbound loop exited");
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inbound(
        mut reader: SessionReader,
        bridge: Arc<AudioBridge>,
        hooks: VoiceBridgeHooks,
        outcome: Arc<EventRouterOutcome>,
        barge_in: Arc<AtomicBool>,
        control_tx: tokio::sync::mpsc::Sender<ControlCommand>,
        config: EventRouterConfig,
        mut stop_rx: watch::Receiver<bool>,
        speak_first: bool,
        diagnostics: Arc<Mutex<CallDiagnostics>>,
        started_at: Instant,
        on_barge_in_started: Arc<dyn Fn() + Send + Sync>,
        on_barge_in_resolved: Arc<dyn Fn() + Send + Sync>,
    ) {
        let hook_gate = Arc::new(Semaphore::new(config.max_pending_hooks));
        let mut awaiting_first_audio = speak_first;
        let mut dropping_stale_audio = false;
        // `speak_first` calls already primed the bridge before the session opened.
        let mut primed = speak_first;
        // True from the first un-stale audio delta of a response until `ResponseDone`.
        let mut assistant_speaking = false;
        // True between a barge-in purge and the assistant's next real audio delta.
        let mut was_interrupting = false;
        // True from `ResponseCreated` until the first audio delta of that response.
        let mut audio_seen_this_response = false;
        let watchdog = tokio::time::sleep(config.response_watchdog);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                () = &mut watchdog, if awaiting_first_audio => {
                    warn!("response watchdog elapsed without audio, re-forcing response.create");
                    awaiting_first_audio = false;
                    let _ = control_tx.send(ControlCommand::ResponseCreate).await;
                }
                event = reader.next_event() => {
                    let Some(event) = event else { break };
                    match event {
                        Ok(ServerEvent::AudioDelta { audio }) => {
                            awaiting_first_audio = false;
                            audio_seen_this_response = true;
                            if dropping_stale_audio {
                                continue;
                            }
                            if !primed {
                                bridge.send_prime_silence_direct(12);
                                bridge.enable_audio_output();
                                primed = true;
                                diagnostics.lock().mark(DiagnosticPhase::FirstTts, started_at.elapsed());
                            }
                            if was_interrupting {
                                was_interrupting = false;
                                on_barge_in_resolved();
                            }
                            assistant_speaking = true;
                            bridge.send_to_peer(&audio);
                            if let Some(cb) = hooks.on_audio_outbound.clone() {
                                dispatch_hook(&hook_gate, move || cb(bytes::Bytes::from(audio)));
                            }
                        }
                        Ok(ServerEvent::TranscriptDelta { role, delta }) => {
                            let role = match role {
                                TranscriptDeltaRole::User => TranscriptRole::User,
                                TranscriptDeltaRole::Assistant => TranscriptRole::Assistant,
                            };
                            let entry = TranscriptEntry { role, text: delta };
                            outcome.transcripts.lock().push(entry.clone());
                            if let Some(cb) = hooks.on_transcript.clone() {
                                dispatch_hook(&hook_gate, move || cb(entry));
                            }
                        }
                        Ok(ServerEvent::SpeechStarted) => {
                            barge_in.store(true, Ordering::Relaxed);
                            if assistant_speaking {
                                dropping_stale_audio = true;
                                assistant_speaking = false;
                                was_interrupting = true;
                                bridge.clear_audio_queue();
                                info!("caller speech detected, interrupting assistant playback");
                                let _ = control_tx.send(ControlCommand::Cancel).await;
                                on_barge_in_started();
                            }
                        }
                        Ok(ServerEvent::SpeechStopped) => {
                            barge_in.store(false, Ordering::Relaxed);
                        }
                        Ok(ServerEvent::ResponseDone) => {
                            debug!("model response complete");
                            dropping_stale_audio = false;
                            assistant_speaking = false;
                        }
                        Ok(ServerEvent::SessionUpdated) => {
                            debug!("model session configured");
                        }
                        Ok(ServerEvent::ResponseCreated) => {
                            debug!("model began generating a response");
                            audio_seen_this_response = false;
                            awaiting_first_audio = true;
                            watchdog.as_mut().reset(tokio::time::Instant::now() + config.response_watchdog);
                        }
                        Ok(ServerEvent::ToolCall { name, call_id, .. }) => {
                            warn!(tool = %name, call_id = %call_id, "tool call received, no tool executor configured");
                            if !audio_seen_this_response {
                                debug!("tool call arrived without an audio preamble, forcing response.create");
                                let _ = control_tx.send(ControlCommand::ResponseCreate).await;
                            }
                        }
                        Ok(ServerEvent::Error { code, message }) => {
                            if code.as_deref().is_some_and(|c| BENIGN_ERROR_CODES.contains(&c)) {
                                debug!(error = %message, code = ?code, "ignoring benign model error");
                            } else {
                                error!(error = %message, code = ?code, "model reported a protocol error");
                                *outcome.fatal_error.lock() = Some(message);
                            }
                        }
                        Ok(ServerEvent::Raw { kind, .. }) => {
                            debug!(kind = %kind, "unrecognized model event, ignoring");
                        }
                        Err(e) => {
                            warn!(error = %e, "transient model stream error");
                            if matches!(e, Error::TransientModelStreamError(_)) {
                                continue;
                            }
                            *outcome.fatal_error.lock() = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
        }
        debug!("event router inbound loop exited");
    }
}

fn dispatch_hook(gate: &Arc<Semaphore>, f: impl FnOnce() + Send + 'static) {
    let gate = gate.clone();
    tokio::spawn(async move {
        let Ok(_permit) = gate.try_acquire_owned() else {
            warn!("hook dispatch queue full, dropping hook invocation");
            return;
        };
        f();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InboundCodec;
    use crate::config::SessionParams;
    use crate::port::AudioPort;
    use crate::session::SessionAdapter;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    #[test]
    fn outcome_starts_empty() {
        let outcome = EventRouterOutcome::default();
        assert!(outcome.transcripts.lock().is_empty());
        assert!(outcome.fatal_error.lock().is_none());
    }

    #[test]
    fn benign_error_codes_are_recognized() {
        assert!(BENIGN_ERROR_CODES.contains(&"response_cancel_not_active"));
        assert!(BENIGN_ERROR_CODES.contains(&"conversation_already_has_active_response"));
        assert!(!BENIGN_ERROR_CODES.contains(&"invalid_request"));
    }

    /// A fake model endpoint: a loopback WebSocket server the router's real
    /// `SessionAdapter` connects to, so these tests drive the router through
    /// its actual transport rather than a mocked trait.
    struct FakeModel {
        ws: WebSocketStream<tokio::net::TcpStream>,
    }

    impl FakeModel {
        async fn send(&mut self, event: serde_json::Value) {
            self.ws.send(WsMessage::Text(event.to_string())).await.unwrap();
        }

        /// Next client-sent event's `type` discriminant, skipping non-text frames.
        async fn recv_type(&mut self) -> String {
            loop {
                match self.ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                        return json["type"].as_str().unwrap().to_string();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("fake model expected a client event, got {other:?}"),
                }
            }
        }
    }

    /// Open a real `SessionAdapter` against a freshly bound loopback server,
    /// returning the split halves and the fake model's end after it has
    /// consumed the initial `realtime` session-open event.
    async fn connect_fake_session() -> (SessionWriter, SessionReader, FakeModel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut model = FakeModel { ws };
            let opened = model.recv_type().await;
            assert_eq!(opened, "realtime");
            model
        });

        let params = SessionParams {
            model: "test-model".to_string(),
            voice: None,
            instructions: "be terse".to_string(),
            speak_first: false,
        };
        let adapter = SessionAdapter::open(&format!("ws://{addr}"), "test-key", &params).await.unwrap();
        let model = server.await.unwrap();
        let (writer, reader) = adapter.split();
        (writer, reader, model)
    }

    fn fake_rtp_producer() -> RtpStreamProducer {
        RtpStreamProducer::new(
            Arc::new(AudioPort::new()),
            InboundCodec::Pcm16,
            Arc::new(AtomicBool::new(false)),
            Arc::new(tokio::sync::Notify::new()),
        )
    }

    fn audio_delta_event() -> serde_json::Value {
        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 960]);
        serde_json::json!({ "type": "response.output_audio.delta", "delta": b64 })
    }

    /// S2: caller speech while the assistant is actually speaking purges and
    /// cancels, and calls `on_barge_in_started`; the assistant's next real
    /// audio delta resolves it via `on_barge_in_resolved`.
    #[tokio::test]
    async fn barge_in_purges_and_resolves_only_while_assistant_speaking() {
        let (writer, reader, mut model) = connect_fake_session().await;
        let bridge = Arc::new(AudioBridge::new(24_000));
        let router = EventRouter::new(EventRouterConfig::default(), bridge, VoiceBridgeHooks::default());

        let started = Arc::new(AtomicBool::new(false));
        let resolved = Arc::new(AtomicBool::new(false));
        let started_cb = started.clone();
        let resolved_cb = resolved.clone();

        let handle = router.spawn(
            writer,
            reader,
            fake_rtp_producer(),
            false,
            Arc::new(Mutex::new(CallDiagnostics::default())),
            Instant::now(),
            Arc::new(move || started_cb.store(true, Ordering::SeqCst)),
            Arc::new(move || resolved_cb.store(true, Ordering::SeqCst)),
        );

        // Speech while nothing is playing: no cancel should be sent, no callback fires.
        model.send(serde_json::json!({ "type": "input_audio_buffer.speech_started" })).await;
        model.send(serde_json::json!({ "type": "input_audio_buffer.speech_stopped" })).await;

        // Response starts and speaks, then the caller barges in.
        model.send(serde_json::json!({ "type": "response.created" })).await;
        model.send(audio_delta_event()).await;
        model.send(serde_json::json!({ "type": "input_audio_buffer.speech_started" })).await;

        assert_eq!(model.recv_type().await, "response.cancel");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.load(Ordering::SeqCst), "on_barge_in_started must fire once playback was interrupted");
        assert!(!resolved.load(Ordering::SeqCst));

        // Assistant's next real audio resolves the interruption.
        model.send(audio_delta_event()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(resolved.load(Ordering::SeqCst));

        handle.stop().await;
    }

    /// S4: the watchdog re-forces `response.create` if no audio arrives
    /// within `response_watchdog` of `response.created`, and re-arms on each
    /// new `response.created` rather than firing only once.
    #[tokio::test]
    async fn watchdog_reforces_response_create_and_rearms_per_response() {
        let (writer, reader, mut model) = connect_fake_session().await;
        let bridge = Arc::new(AudioBridge::new(24_000));
        let mut config = EventRouterConfig::default();
        config.response_watchdog = std::time::Duration::from_millis(30);
        let router = EventRouter::new(config, bridge, VoiceBridgeHooks::default());

        let handle = router.spawn(
            writer,
            reader,
            fake_rtp_producer(),
            false,
            Arc::new(Mutex::new(CallDiagnostics::default())),
            Instant::now(),
            Arc::new(|| {}),
            Arc::new(|| {}),
        );

        model.send(serde_json::json!({ "type": "response.created" })).await;
        assert_eq!(model.recv_type().await, "response.create");

        // Re-arm: a second response.created with no audio forces a second response.create.
        model.send(serde_json::json!({ "type": "response.created" })).await;
        assert_eq!(model.recv_type().await, "response.create");

        handle.stop().await;
    }

    /// S5: a tool call arriving with no audio preamble this response forces
    /// `response.create` so the model actually speaks the tool's result.
    #[tokio::test]
    async fn tool_call_without_audio_preamble_forces_response_create() {
        let (writer, reader, mut model) = connect_fake_session().await;
        let bridge = Arc::new(AudioBridge::new(24_000));
        let mut config = EventRouterConfig::default();
        config.response_watchdog = std::time::Duration::from_secs(5);
        let router = EventRouter::new(config, bridge, VoiceBridgeHooks::default());

        let handle = router.spawn(
            writer,
            reader,
            fake_rtp_producer(),
            false,
            Arc::new(Mutex::new(CallDiagnostics::default())),
            Instant::now(),
            Arc::new(|| {}),
            Arc::new(|| {}),
        );

        model.send(serde_json::json!({ "type": "response.created" })).await;
        model
            .send(serde_json::json!({
                "type": "response.function_call_arguments.done",
                "name": "lookup_order",
                "arguments": "{}",
                "call_id": "call_1",
            }))
            .await;

        assert_eq!(model.recv_type().await, "response.create");

        handle.stop().await;
    }
}
