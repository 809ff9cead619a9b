//! WebSocket transport to a realtime conversational endpoint
//!
//! 1. **Connect** with bearer auth and send `session.update`
//! 2. **Stream** microphone PCM16 up, receive transcript/audio deltas down
//! 3. **Close** when the call ends

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::events::{ClientEvent, RealtimeSignal, SessionSettings, parse_server_event};
use crate::voice::stt::is_secure_endpoint;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth; audio chunks beyond this are dropped
const OUTBOUND_CAPACITY: usize = 256;

/// Sending half of a realtime link
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Queue an event for the endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    async fn send(&self, event: ClientEvent) -> Result<()>;

    /// Queue an event without waiting; for the capture thread
    ///
    /// # Errors
    ///
    /// Returns error if the queue is full or the connection is gone
    fn try_send(&self, event: ClientEvent) -> Result<()>;

    /// Close the connection
    async fn close(&self);
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub session: SessionSettings,
}

enum Outbound {
    Event(ClientEvent),
    Close,
}

/// Realtime transport over a WebSocket
pub struct WebSocketTransport {
    outbound: mpsc::Sender<Outbound>,
    io_tasks: [AbortHandle; 2],
    session_id: String,
}

impl WebSocketTransport {
    /// Connect, configure the session and start the I/O loops
    ///
    /// Returns the transport and the receiver of demultiplexed server events.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is insecure or the handshake fails
    pub async fn connect(
        config: &RealtimeConfig,
    ) -> Result<(Self, mpsc::Receiver<RealtimeSignal>)> {
        if !is_secure_endpoint(&config.url) {
            return Err(Error::InsecureContext(format!(
                "refusing to stream audio to {}",
                config.url
            )));
        }
        if config.api_key.is_empty() {
            return Err(Error::Config("API key required for realtime".to_string()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}?model={}", config.url, config.model);
        tracing::info!(session_id = %session_id, model = %config.model, "connecting realtime session");

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Realtime(format!("invalid realtime request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|e| Error::Config(format!("invalid auth header: {e}")))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| Error::Config(format!("invalid header: {e}")))?,
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Realtime(format!("failed to connect: {e}")))?;
        let (mut sink, stream) = ws.split();

        let update = ClientEvent::SessionUpdate(config.session.clone()).to_json();
        sink.send(WsMessage::Text(update.to_string().into()))
            .await
            .map_err(|e| Error::Realtime(format!("failed to send session.update: {e}")))?;

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(outbound_loop(outbound_rx, sink, session_id.clone()));
        let reader = tokio::spawn(inbound_loop(stream, signal_tx, session_id.clone()));

        Ok((
            Self {
                outbound,
                io_tasks: [writer.abort_handle(), reader.abort_handle()],
                session_id,
            },
            signal_rx,
        ))
    }

    /// Session identifier used in logs
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn send(&self, event: ClientEvent) -> Result<()> {
        self.outbound
            .send(Outbound::Event(event))
            .await
            .map_err(|_| Error::Realtime("connection closed".to_string()))
    }

    fn try_send(&self, event: ClientEvent) -> Result<()> {
        self.outbound
            .try_send(Outbound::Event(event))
            .map_err(|e| Error::Realtime(format!("outbound queue: {e}")))
    }

    async fn close(&self) {
        // A full queue means the socket is stuck; drop it instead of waiting
        if let Err(e) = self.outbound.try_send(Outbound::Close) {
            tracing::warn!(session_id = %self.session_id, error = %e, "close not queued, aborting realtime I/O");
            for task in &self.io_tasks {
                task.abort();
            }
        }
    }
}

async fn outbound_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WsStream, WsMessage>,
    session_id: String,
) {
    let mut audio_chunks: u64 = 0;

    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Event(event) => {
                if matches!(event, ClientEvent::AppendAudio(_)) {
                    audio_chunks += 1;
                    if audio_chunks == 1 || audio_chunks.is_multiple_of(50) {
                        tracing::debug!(session_id = %session_id, chunk = audio_chunks, "streaming microphone audio");
                    }
                }
                let json = event.to_json().to_string();
                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    tracing::warn!(session_id = %session_id, "websocket send failed, closing outbound loop");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "realtime outbound loop terminated");
}

async fn inbound_loop(
    mut stream: SplitStream<WsStream>,
    signals: mpsc::Sender<RealtimeSignal>,
    session_id: String,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                for signal in parse_server_event(&text) {
                    if let RealtimeSignal::Error(message) = &signal {
                        tracing::error!(session_id = %session_id, error = %message, "realtime error");
                    }
                    if signals.send(signal).await.is_err() {
                        tracing::debug!(session_id = %session_id, "signal receiver dropped");
                        return;
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(session_id = %session_id, close_frame = ?frame, "realtime connection closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "realtime websocket error");
                let _ = signals
                    .send(RealtimeSignal::Error(format!("websocket error: {e}")))
                    .await;
                break;
            }
        }
    }

    let _ = signals.send(RealtimeSignal::Closed).await;
    tracing::debug!(session_id = %session_id, "realtime inbound loop terminated");
}
