//! Ethos Voice - real-time voice calls with an AI ethics coach
//!
//! This library provides the call machinery behind the coach:
//! - Speech capture with restart and error policy
//! - A microphone gate that keeps the user and the coach from talking over each other
//! - Speech synthesis with an on-device fallback
//! - A turn coordinator driving request/response or realtime AI channels
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Call handle                        │
//! │   mute  │  restart mic  │  snapshot  │  end  │ events│
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                Turn coordinator                       │
//! │   Speech capture → Gate → AI channel → Speaker        │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                 Providers                             │
//! │   STT  │  Chat  │  TTS  │  Realtime WebSocket         │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod persona;
pub mod realtime;
pub mod transcript;
pub mod voice;

pub use config::Config;
pub use conversation::{
    AiChannel, CallHandle, CallSetup, CallSnapshot, ConversationSession, CoordinatorConfig,
    FeedbackSummary, SessionOutcome, TurnPhase, start_call,
};
pub use error::{Error, Result};
pub use events::{CallEvent, EndReason, EventSink, Notice, Severity};
pub use persona::Persona;
pub use transcript::{SpeakerRole, Transcript, Utterance};
