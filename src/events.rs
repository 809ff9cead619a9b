//! Typed call event subscription
//!
//! Every call publishes its observable state changes on a broadcast channel.
//! Observers (CLI, UI bridges, tests) subscribe instead of registering
//! callbacks; publishing never blocks and never fails the call.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::conversation::{SessionOutcome, TurnPhase};
use crate::transcript::Utterance;
use crate::voice::{ErrorClass, MicrophoneState};

/// Default subscriber buffer
const EVENT_CAPACITY: usize = 256;

/// How loudly a notice should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Transient user-facing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    pub message: String,
}

impl Notice {
    /// Informational notice
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            class: None,
            message: message.into(),
        }
    }

    /// Warning tied to an error class
    #[must_use]
    pub fn warning(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            class: Some(class),
            message: message.into(),
        }
    }

    /// Error tied to an error class
    #[must_use]
    pub fn error(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            class: Some(class),
            message: message.into(),
        }
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The user hung up
    Hangup,
    /// The call duration budget ran out
    TimeLimit,
    /// A fatal capture error (e.g. permission denied)
    Fatal,
    /// The realtime link closed
    ChannelClosed,
}

/// Observable call event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// Turn phase changed
    PhaseChanged { phase: TurnPhase, greeting: bool },
    /// Microphone gate state changed
    Microphone { state: MicrophoneState },
    /// Partial or final utterance update
    Transcript { utterance: Utterance },
    /// User-facing notice
    Notice { notice: Notice },
    /// Call finished
    Ended {
        reason: EndReason,
        outcome: SessionOutcome,
    },
}

/// Publishing half of the call event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<CallEvent>,
}

impl EventSink {
    /// Create a sink with the default buffer
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a notice
    pub fn notice(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => tracing::info!(text = %notice.message, "notice"),
            Severity::Warning => tracing::warn!(class = ?notice.class, text = %notice.message, "notice"),
            Severity::Error => tracing::error!(class = ?notice.class, text = %notice.message, "notice"),
        }
        self.publish(CallEvent::Notice { notice });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
