//! Turn phases

use serde::Serialize;

/// Who holds the conversational initiative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    UserTurn,
    AiThinking,
    AiSpeaking,
    Ended,
}

impl TurnPhase {
    /// Whether the microphone must stay blocked in this phase
    #[must_use]
    pub const fn blocks_microphone(self) -> bool {
        matches!(self, Self::AiThinking | Self::AiSpeaking)
    }

    /// Whether the call is running
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::UserTurn => "user_turn",
            Self::AiThinking => "ai_thinking",
            Self::AiSpeaking => "ai_speaking",
            Self::Ended => "ended",
        })
    }
}
