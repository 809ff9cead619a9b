//! Realtime transport
//!
//! Duplex link to a conversational endpoint: microphone audio streams up,
//! transcripts and reply audio stream down. The coordinator sees the link
//! as a source of [`RealtimeSignal`]s.

pub mod events;
pub mod microphone;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

pub use events::{ClientEvent, RealtimeSignal, SessionSettings, parse_server_event};
pub use microphone::{INPUT_SAMPLE_RATE, RealtimeMicrophone};
pub use transport::{RealtimeConfig, RealtimeTransport, WebSocketTransport};

use crate::Result;
use crate::voice::PcmStreamPlayer;

/// How often queued reply audio is checked for completion
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Local sink for streamed reply audio
pub trait PcmOutput: Send + Sync {
    fn push_pcm16(&self, pcm: &[u8]);
    fn clear(&self);
    fn is_idle(&self) -> bool;
}

impl PcmOutput for PcmStreamPlayer {
    fn push_pcm16(&self, pcm: &[u8]) {
        Self::push_pcm16(self, pcm);
    }

    fn clear(&self) {
        Self::clear(self);
    }

    fn is_idle(&self) -> bool {
        Self::is_idle(self)
    }
}

/// Duplex AI channel
///
/// Reply audio is played locally; `ResponseDone` is held back until the
/// local queue has drained so the microphone never reopens over the reply.
pub struct RealtimeLink {
    transport: Arc<dyn RealtimeTransport>,
    signals: mpsc::Receiver<RealtimeSignal>,
    output: Option<Arc<dyn PcmOutput>>,
    audio_active: bool,
    awaiting_drain: bool,
    closed: bool,
}

impl RealtimeLink {
    #[must_use]
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        signals: mpsc::Receiver<RealtimeSignal>,
        output: Option<Arc<dyn PcmOutput>>,
    ) -> Self {
        Self {
            transport,
            signals,
            output,
            audio_active: false,
            awaiting_drain: false,
            closed: false,
        }
    }

    /// Transport handle, for the microphone engine
    #[must_use]
    pub fn transport(&self) -> Arc<dyn RealtimeTransport> {
        Arc::clone(&self.transport)
    }

    /// Send an event to the endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.transport.send(event).await
    }

    /// Next signal the coordinator should act on
    ///
    /// Audio chunks are consumed here; the first chunk of a reply surfaces
    /// as `AssistantSpeakingStarted`. Returns `None` once the link closed.
    pub async fn next_signal(&mut self) -> Option<RealtimeSignal> {
        loop {
            if self.closed {
                return None;
            }

            let awaiting_drain = self.awaiting_drain;
            let drain_tick = async move {
                if awaiting_drain {
                    tokio::time::sleep(DRAIN_POLL).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                () = drain_tick => {
                    if self.output_idle() {
                        self.awaiting_drain = false;
                        return Some(RealtimeSignal::ResponseDone);
                    }
                }
                signal = self.signals.recv() => match signal {
                    Some(RealtimeSignal::AssistantAudio(pcm)) => {
                        if let Some(output) = &self.output {
                            output.push_pcm16(&pcm);
                        }
                        if !self.audio_active {
                            self.audio_active = true;
                            return Some(RealtimeSignal::AssistantSpeakingStarted);
                        }
                    }
                    Some(RealtimeSignal::ResponseDone) => {
                        self.audio_active = false;
                        if self.output_idle() {
                            return Some(RealtimeSignal::ResponseDone);
                        }
                        self.awaiting_drain = true;
                    }
                    Some(RealtimeSignal::Closed) | None => {
                        self.closed = true;
                        return Some(RealtimeSignal::Closed);
                    }
                    Some(other) => return Some(other),
                }
            }
        }
    }

    /// Drop any reply audio still queued
    pub fn stop_audio(&mut self) {
        if let Some(output) = &self.output {
            output.clear();
        }
        self.audio_active = false;
        self.awaiting_drain = false;
    }

    /// Close the connection
    pub async fn close(&mut self) {
        self.stop_audio();
        self.transport.close().await;
    }

    fn output_idle(&self) -> bool {
        self.output.as_ref().is_none_or(|o| o.is_idle())
    }
}
