//! Text-to-speech (TTS) backends
//!
//! Remote synthesis returning MP3 audio. Failures surface as errors so the
//! speaker can fall back to on-device synthesis.

use async_trait::async_trait;

use crate::{Error, Result};

/// Remote speech synthesis collaborator
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` to encoded audio (MP3)
    ///
    /// `voice` overrides the backend's configured voice when set.
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug)]
enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

/// Synthesizes speech over HTTP
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    base_url: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a TTS client for `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, voice: String, speed: f32, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            provider: TtsProvider::OpenAI,
        })
    }

    /// Create a TTS client for ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: String, voice_id: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0,
            model,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            provider: TtsProvider::ElevenLabs,
        })
    }

    /// Override the API base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{}/text-to-speech/{voice}", self.base_url);
        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        let voice = voice.unwrap_or(&self.voice);
        tracing::debug!(chars = text.len(), voice, provider = ?self.provider, "synthesizing speech");

        let audio = match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text, voice).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice).await?,
        };

        if audio.is_empty() {
            return Err(Error::Tts("synthesis returned no audio".to_string()));
        }
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_required() {
        assert!(
            TextToSpeech::new_openai(String::new(), "alloy".into(), 1.0, "tts-1".into()).is_err()
        );
        assert!(
            TextToSpeech::new_elevenlabs(String::new(), "voice".into(), "eleven_multilingual_v2".into())
                .is_err()
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error() {
        let tts = TextToSpeech::new_openai("sk-test".into(), "alloy".into(), 1.0, "tts-1".into())
            .unwrap()
            .with_base_url("http://127.0.0.1:9/v1");
        assert!(tts.synthesize("Hola", None).await.is_err());
    }
}
