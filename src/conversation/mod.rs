//! Conversation orchestration
//!
//! A call is one [`coordinator`] actor owning its [`ConversationSession`],
//! the microphone gate and an [`AiChannel`].

pub mod channel;
pub mod coordinator;
pub mod feedback;
pub mod outcome;
pub mod phase;
pub mod session;

pub use channel::{
    AiChannel, ChatCompletionsGenerator, FallbackResponses, RequestChannel, ResponseGenerator,
};
pub use coordinator::{CallHandle, CallSetup, CallSnapshot, CoordinatorConfig, start_call};
pub use feedback::{
    ChatFeedbackGenerator, CollectLimits, FeedbackGenerator, FeedbackSummary, Level,
    collect_streamed_text,
};
pub use outcome::SessionOutcome;
pub use phase::TurnPhase;
pub use session::ConversationSession;
