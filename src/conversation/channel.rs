//! AI channels
//!
//! The coordinator talks to the coach either request/response (generate
//! text, then speak it locally) or through a duplex realtime link that
//! streams both transcripts and audio.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::realtime::RealtimeLink;
use crate::transcript::{SpeakerRole, Utterance};
use crate::voice::{Speaker, SpeakerEvent};
use crate::{Error, Result};

/// Lines used when no persona provides its own
const BUILTIN_FALLBACKS: &[&str] = &[
    "Entiendo. ¿Puedes contarme un poco más sobre por qué lo ves así?",
    "Es una perspectiva interesante. ¿Qué harías si estuvieras en su lugar?",
    "Vamos a pensarlo juntos. ¿Qué consecuencias crees que tendría esa decisión?",
];

/// AI response collaborator
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce the coach's reply to `user_message` given the prior history
    async fn generate(&self, history: &[Utterance], user_message: &str) -> Result<String>;
}

/// Canned replies used when the generator fails
#[derive(Debug, Clone)]
pub struct FallbackResponses {
    lines: Vec<String>,
}

impl FallbackResponses {
    /// Use `lines`, or the built-in set when none are usable
    #[must_use]
    pub fn new(lines: Vec<String>) -> Self {
        let lines: Vec<String> = lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            Self::default()
        } else {
            Self { lines }
        }
    }

    /// Pick one line at random
    #[must_use]
    pub fn pick(&self) -> &str {
        self.lines
            .choose(&mut rand::thread_rng())
            .map_or(BUILTIN_FALLBACKS[0], String::as_str)
    }

    /// Whether `text` is one of the canned lines
    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.lines.iter().any(|l| l == text)
    }
}

impl Default for FallbackResponses {
    fn default() -> Self {
        Self {
            lines: BUILTIN_FALLBACKS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// OpenAI-compatible `/chat/completions` generator
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub(crate) role: &'a str,
    pub(crate) content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatCompletionsGenerator {
    /// Create a generator
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(api_key: String, model: String, system_prompt: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "API key required for response generation".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key,
            model,
            system_prompt,
            max_tokens: 300,
        })
    }

    /// Override the API base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Cap reply length
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn post(&self, messages: Vec<ChatMessage<'_>>, stream: bool) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("chat API error {status}: {body}")));
        }
        Ok(response)
    }

    /// Send a prepared message list, returning the first choice's text
    pub(crate) async fn complete(&self, messages: Vec<ChatMessage<'_>>) -> Result<String> {
        let response = self.post(messages, false).await?;
        let result: ChatResponse = response.json().await?;
        let text = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(Error::Agent("chat API returned an empty reply".to_string()));
        }
        Ok(text)
    }

    /// Send a prepared message list, streaming the reply's text deltas
    pub(crate) async fn complete_stream(
        &self,
        messages: Vec<ChatMessage<'_>>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.post(messages, true).await?;
        Ok(sse_deltas(response.bytes_stream()).boxed())
    }

    pub(crate) fn messages<'a>(&'a self, history: &'a [Utterance], user_message: &'a str) -> Vec<ChatMessage<'a>> {
        std::iter::once(ChatMessage {
            role: SpeakerRole::System.as_str(),
            content: &self.system_prompt,
        })
        .chain(history.iter().map(|u| ChatMessage {
            role: u.role.as_str(),
            content: &u.text,
        }))
        .chain(std::iter::once(ChatMessage {
            role: SpeakerRole::User.as_str(),
            content: user_message,
        }))
        .collect()
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionsGenerator {
    async fn generate(&self, history: &[Utterance], user_message: &str) -> Result<String> {
        tracing::debug!(history = history.len(), model = %self.model, "requesting coach reply");
        self.complete(self.messages(history, user_message)).await
    }
}

enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|event| {
            event["choices"][0]["delta"]["content"]
                .as_str()
                .filter(|d| !d.is_empty())
                .map(str::to_string)
        })
        .map_or(SseLine::Skip, SseLine::Delta)
}

/// Text deltas from an OpenAI-style server-sent event body
fn sse_deltas<S, B>(bytes: S) -> impl futures::Stream<Item = Result<String>> + Send + 'static
where
    S: futures::Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]>,
{
    stream::unfold(
        (Box::pin(bytes), Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(String::from_utf8_lossy(&line).trim()) {
                        SseLine::Delta(delta) => return Some((Ok(delta), (bytes, buffer, false))),
                        SseLine::Done => return None,
                        SseLine::Skip => continue,
                    }
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => return Some((Err(Error::Http(e)), (bytes, buffer, true))),
                    None => return None,
                }
            }
        },
    )
}

/// Request/response channel: generated text spoken by the local speaker
pub struct RequestChannel {
    pub generator: Arc<dyn ResponseGenerator>,
    pub speaker: Speaker,
    pub speaker_events: mpsc::UnboundedReceiver<SpeakerEvent>,
}

impl RequestChannel {
    #[must_use]
    pub fn new(
        generator: Arc<dyn ResponseGenerator>,
        speaker: Speaker,
        speaker_events: mpsc::UnboundedReceiver<SpeakerEvent>,
    ) -> Self {
        Self {
            generator,
            speaker,
            speaker_events,
        }
    }
}

/// How the coordinator reaches the coach
pub enum AiChannel {
    Request(RequestChannel),
    Duplex(RealtimeLink),
}
