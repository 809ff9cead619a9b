//! Post-call feedback
//!
//! Turns the finished transcript into a structured summary. Streamed
//! replies are collected with a per-chunk and an overall time bound.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::channel::ChatCompletionsGenerator;
use crate::transcript::{SpeakerRole, Utterance};
use crate::{Error, Result};

const FEEDBACK_PROMPT: &str = "You review practice conversations between a learner and an ethics coach. \
Reply with a single JSON object and nothing else, with the keys \
\"strengths\", \"areas_for_improvement\" and \"suggestions\" (arrays of short strings) and \
\"engagement_level\" and \"comprehension_level\" (each one of \"low\", \"medium\", \"high\"). \
Write the strings in the language the learner used.";

/// Coarse rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

/// Structured feedback for a finished call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub areas_for_improvement: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub engagement_level: Level,
    pub comprehension_level: Level,
}

impl FeedbackSummary {
    /// Parse a model reply, tolerating a Markdown code fence around the JSON
    ///
    /// # Errors
    ///
    /// Returns error if no JSON object with the expected fields is present
    pub fn parse(reply: &str) -> Result<Self> {
        let start = reply.find('{');
        let end = reply.rfind('}');
        match (start, end) {
            (Some(start), Some(end)) if start < end => {
                Ok(serde_json::from_str(&reply[start..=end])?)
            }
            _ => Err(Error::Agent("feedback reply contained no JSON object".to_string())),
        }
    }
}

/// Feedback collaborator
#[async_trait]
pub trait FeedbackGenerator: Send + Sync {
    async fn summarize(&self, utterances: &[Utterance]) -> Result<FeedbackSummary>;
}

/// Bounds on waiting for streamed text
#[derive(Debug, Clone, Copy)]
pub struct CollectLimits {
    /// Longest gap allowed between chunks
    pub per_chunk: Duration,
    /// Longest total wait
    pub overall: Duration,
}

impl Default for CollectLimits {
    fn default() -> Self {
        Self {
            per_chunk: Duration::from_secs(5),
            overall: Duration::from_secs(30),
        }
    }
}

/// Concatenate a stream of text chunks within the given time bounds
///
/// # Errors
///
/// Returns the first stream error, or [`Error::Timeout`] when a chunk or
/// the whole stream takes too long
pub async fn collect_streamed_text<S>(mut chunks: S, limits: CollectLimits) -> Result<String>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + limits.overall;
    let mut text = String::new();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout("streamed text exceeded the overall limit".to_string()));
        }

        match tokio::time::timeout(limits.per_chunk.min(remaining), chunks.next()).await {
            Ok(Some(Ok(chunk))) => text.push_str(&chunk),
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Ok(text),
            Err(_) => {
                tracing::warn!(received = text.len(), "streamed text stalled");
                return Err(Error::Timeout("no streamed text within the chunk limit".to_string()));
            }
        }
    }
}

/// Render utterances as a plain dialogue for the reviewer model
#[must_use]
pub fn format_dialogue(utterances: &[Utterance]) -> String {
    utterances
        .iter()
        .filter(|u| u.role != SpeakerRole::System)
        .map(|u| {
            let who = match u.role {
                SpeakerRole::User => "Learner",
                _ => "Coach",
            };
            format!("{who}: {}", u.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Feedback from an OpenAI-compatible chat endpoint, streamed
pub struct ChatFeedbackGenerator {
    chat: ChatCompletionsGenerator,
    limits: CollectLimits,
}

impl ChatFeedbackGenerator {
    /// Create a feedback generator
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let chat = ChatCompletionsGenerator::new(api_key, model, FEEDBACK_PROMPT.to_string())?
            .with_max_tokens(800);
        Ok(Self {
            chat,
            limits: CollectLimits::default(),
        })
    }

    /// Override the API base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.chat = self.chat.with_base_url(base_url);
        self
    }

    /// Override the streaming bounds
    #[must_use]
    pub const fn with_limits(mut self, limits: CollectLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[async_trait]
impl FeedbackGenerator for ChatFeedbackGenerator {
    async fn summarize(&self, utterances: &[Utterance]) -> Result<FeedbackSummary> {
        if !utterances.iter().any(|u| u.role == SpeakerRole::User) {
            return Err(Error::Agent("no learner speech to review".to_string()));
        }

        let dialogue = format_dialogue(utterances);
        let deltas = self.chat.complete_stream(self.chat.messages(&[], &dialogue)).await?;
        let reply = collect_streamed_text(deltas, self.limits).await?;
        tracing::debug!(chars = reply.len(), "feedback received");
        FeedbackSummary::parse(&reply)
    }
}
