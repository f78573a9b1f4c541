//! Session Adapter: the WebSocket client that carries the realtime model
//! protocol defined in [`protocol`].

pub mod protocol;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::SessionParams;
use crate::error::{Error, Result};
use protocol::{ClientEvent, ServerEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Open WebSocket connection to the realtime model, carrying the typed
/// client/server event protocol.
pub struct SessionAdapter {
    write: WsSink,
    read: WsSource,
}

impl SessionAdapter {
    /// Connect to `url`, authenticate with `api_key`, and send the initial
    /// `realtime` session-open event built from `params`.
    pub async fn open(url: &str, api_key: &str, params: &SessionParams) -> Result<Self> {
        let request = http::Request::builder()
            .uri(url)
            .header("Authorization", format!("Bearer {api_key}"))
            .body(())
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (write, read) = ws_stream.split();
        let mut adapter = Self { write, read };
        adapter.send_raw_event(&ClientEvent::realtime_from_params(params)).await?;
        Ok(adapter)
    }

    /// Append one chunk of little-endian PCM16 audio (at the session rate) to
    /// the model's input buffer.
    pub async fn send_audio(&mut self, pcm_session_rate: &[u8]) -> Result<()> {
        let audio = BASE64.encode(pcm_session_rate);
        self.send_raw_event(&ClientEvent::InputAudioBufferAppend { audio }).await
    }

    /// Discard any buffered-but-not-committed input audio.
    pub async fn clear_input_buffer(&mut self) -> Result<()> {
        self.send_raw_event(&ClientEvent::InputAudioBufferClear).await
    }

    /// Ask the model to start generating a response.
    pub async fn response_create(&mut self) -> Result<()> {
        self.send_raw_event(&ClientEvent::ResponseCreate).await
    }

    /// Cancel the in-flight response (barge-in).
    pub async fn response_cancel(&mut self) -> Result<()> {
        self.send_raw_event(&ClientEvent::ResponseCancel).await
    }

    /// Serialize and send one client event over the WebSocket.
    pub async fn send_raw_event(&mut self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event).map_err(|e| Error::ModelProtocolError(e.to_string()))?;
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Await the next server event, skipping non-text WebSocket frames.
    /// Returns `None` once the connection closes cleanly.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        loop {
            match self.read.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => {
                    return Some(ServerEvent::parse(&text).map_err(|e| Error::ModelProtocolError(e.to_string())));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "session adapter received close frame");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(Error::Transport(e.to_string()))),
            }
        }
    }

    /// Close the WebSocket connection.
    pub async fn close(&mut self) -> Result<()> {
        match self.write.close().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "session adapter close failed");
                Err(Error::Transport(e.to_string()))
            }
        }
    }

    /// Split into independently ownable halves so the writer and reader can
    /// live on separate tasks (the Event Router's inbound/outbound loops).
    pub fn split(self) -> (SessionWriter, SessionReader) {
        (SessionWriter { write: self.write }, SessionReader { read: self.read })
    }
}

/// The send half of a split [`SessionAdapter`].
pub struct SessionWriter {
    write: WsSink,
}

impl SessionWriter {
    /// Serialize and send one client event.
    pub async fn send_raw_event(&mut self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event).map_err(|e| Error::ModelProtocolError(e.to_string()))?;
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Append one chunk of little-endian PCM16 audio to the model's input buffer.
    pub async fn send_audio(&mut self, pcm_session_rate: &[u8]) -> Result<()> {
        let audio = BASE64.encode(pcm_session_rate);
        self.send_raw_event(&ClientEvent::InputAudioBufferAppend { audio }).await
    }

    /// Ask the model to start generating a response.
    pub async fn response_create(&mut self) -> Result<()> {
        self.send_raw_event(&ClientEvent::ResponseCreate).await
    }

    /// Cancel the in-flight response (barge-in).
    pub async fn response_cancel(&mut self) -> Result<()> {
        self.send_raw_event(&ClientEvent::ResponseCancel).await
    }

    /// Discard any buffered-but-not-committed input audio.
    pub async fn clear_input_buffer(&mut self) -> Result<()> {
        self.send_raw_event(&ClientEvent::InputAudioBufferClear).await
    }

    /// Close the WebSocket connection.
    pub async fn close(&mut self) -> Result<()> {
        self.write.close().await.map_err(|e| Error::Transport(e.to_string()))
    }
}

/// The receive half of a split [`SessionAdapter`].
pub struct SessionReader {
    read: WsSource,
}

impl SessionReader {
    /// Await the next server event, skipping non-text WebSocket frames.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        loop {
            match self.read.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => {
                    return Some(ServerEvent::parse(&text).map_err(|e| Error::ModelProtocolError(e.to_string())));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "session reader received close frame");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(Error::Transport(e.to_string()))),
            }
        }
    }
}
