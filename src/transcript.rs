//! Conversation transcript store
//!
//! Append-only log of finalized utterances. Partial utterances (interim
//! recognition results, streaming AI deltas) are held per speaker outside the
//! log and only enter it when finalized, so the log is ordered by
//! finalization rather than by first token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    User,
    Assistant,
    System,
}

impl SpeakerRole {
    /// Role name as used by chat completion APIs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::User => 0,
            Self::Assistant => 1,
            Self::System => 2,
        }
    }
}

impl std::fmt::Display for SpeakerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single spoken or written contribution to the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    /// Unique identifier
    pub id: Uuid,

    /// Speaker
    pub role: SpeakerRole,

    /// Current text
    pub text: String,

    /// When the first token arrived
    pub created_at: DateTime<Utc>,

    /// Still subject to revision
    pub is_partial: bool,

    /// Recognizer confidence, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Utterance {
    fn new(role: SpeakerRole, text: String, is_partial: bool, confidence: Option<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text,
            created_at: Utc::now(),
            is_partial,
            confidence,
        }
    }

    /// Number of whitespace separated words
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Ordered utterance log with one partial slot per speaker
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    finalized: Vec<Utterance>,
    partials: [Option<Utterance>; 3],
}

impl Transcript {
    /// Create an empty transcript
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or revise the partial utterance for `role`
    ///
    /// Returns the partial's id, which stays stable until finalization.
    pub fn update_partial(&mut self, role: SpeakerRole, text: &str, confidence: Option<f32>) -> Uuid {
        let slot = &mut self.partials[role.slot()];
        match slot {
            Some(partial) => {
                text.clone_into(&mut partial.text);
                if confidence.is_some() {
                    partial.confidence = confidence;
                }
                partial.id
            }
            None => {
                let utterance = Utterance::new(role, text.to_string(), true, confidence);
                let id = utterance.id;
                *slot = Some(utterance);
                id
            }
        }
    }

    /// Append text to the partial utterance for `role`, creating it if needed
    pub fn extend_partial(&mut self, role: SpeakerRole, delta: &str) -> Uuid {
        let current = self.partial(role).map(|p| p.text.clone()).unwrap_or_default();
        self.update_partial(role, &(current + delta), None)
    }

    /// Freeze the partial utterance for `role` and append it to the log
    ///
    /// `text` replaces the partial text when given. With no partial pending, a
    /// new final utterance is appended directly. Empty results are dropped.
    pub fn finalize(
        &mut self,
        role: SpeakerRole,
        text: Option<&str>,
        confidence: Option<f32>,
    ) -> Option<&Utterance> {
        let mut utterance = match self.partials[role.slot()].take() {
            Some(partial) => partial,
            None => Utterance::new(role, String::new(), true, None),
        };

        if let Some(text) = text {
            text.clone_into(&mut utterance.text);
        }
        if confidence.is_some() {
            utterance.confidence = confidence;
        }

        if utterance.text.trim().is_empty() {
            tracing::trace!(%role, "dropping empty utterance");
            return None;
        }

        utterance.is_partial = false;
        self.finalized.push(utterance);
        self.finalized.last()
    }

    /// Append an already complete utterance
    pub fn append_final(&mut self, role: SpeakerRole, text: &str) -> Option<&Utterance> {
        self.discard_partial(role);
        self.finalize(role, Some(text), None)
    }

    /// Drop the partial utterance for `role`, if any
    pub fn discard_partial(&mut self, role: SpeakerRole) -> Option<Utterance> {
        self.partials[role.slot()].take()
    }

    /// Current partial utterance for `role`
    #[must_use]
    pub fn partial(&self, role: SpeakerRole) -> Option<&Utterance> {
        self.partials[role.slot()].as_ref()
    }

    /// Finalized utterances in finalization order
    #[must_use]
    pub fn utterances(&self) -> &[Utterance] {
        &self.finalized
    }

    /// Finalized utterances followed by pending partials (oldest first)
    #[must_use]
    pub fn snapshot(&self) -> Vec<Utterance> {
        let mut partials: Vec<&Utterance> = self.partials.iter().flatten().collect();
        partials.sort_by_key(|p| p.created_at);
        self.finalized
            .iter()
            .cloned()
            .chain(partials.into_iter().cloned())
            .collect()
    }

    /// Most recent finalized utterance from `role`
    #[must_use]
    pub fn last_from(&self, role: SpeakerRole) -> Option<&Utterance> {
        self.finalized.iter().rev().find(|u| u.role == role)
    }

    /// Number of finalized utterances
    #[must_use]
    pub fn len(&self) -> usize {
        self.finalized.len()
    }

    /// Whether no utterance has been finalized
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty()
    }
}
