//! Conversation session

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::outcome::SessionOutcome;
use crate::events::EndReason;
use crate::transcript::Transcript;

/// One call's state, owned by its coordinator and handed back at the end
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub id: Uuid,
    pub transcript: Transcript,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    /// Key for AI requests; replies carrying another token are ignored
    pub session_token: Uuid,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub outcome: Option<SessionOutcome>,
}

impl ConversationSession {
    /// Start a session
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            transcript: Transcript::new(),
            is_active: true,
            started_at: Utc::now(),
            session_token: Uuid::new_v4(),
            ended_at: None,
            end_reason: None,
            outcome: None,
        }
    }

    /// Mark the session finished; later calls are ignored
    pub fn finish(&mut self, reason: EndReason, outcome: SessionOutcome) {
        if !self.is_active {
            return;
        }
        self.is_active = false;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
        self.outcome = Some(outcome);
    }
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new()
    }
}
