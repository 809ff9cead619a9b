//! Coach persona
//!
//! A persona file describes who the coach is on a call: display identity,
//! voice settings, system prompt and the scripted lines used for the
//! greeting and for fallback replies. The crate only carries this data.

use serde::{Deserialize, Serialize};

/// A coaching persona
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Schema URL (optional, for validation)
    #[serde(rename = "$schema")]
    pub schema: Option<String>,

    /// Semantic version of this persona file
    pub version: String,

    /// Core identity (required)
    pub identity: Identity,

    /// Voice and audio configuration
    pub voice: Option<Voice>,

    /// Behavior and communication style
    pub personality: Option<Personality>,

    /// Scripted call lines
    #[serde(default)]
    pub call: CallScript,
}

/// Core identity of the coach
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Short descriptive phrase
    pub tagline: Option<String>,
}

/// Voice and audio configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Voice {
    /// Text-to-speech configuration
    pub tts: Option<TtsConfig>,

    /// Speech-to-text configuration
    pub stt: Option<SttConfig>,

    /// Voice used by the realtime endpoint
    pub realtime_voice: Option<String>,
}

/// TTS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsConfig {
    /// TTS provider ("openai" or "elevenlabs")
    pub provider: Option<String>,

    /// Voice identifier
    pub voice: Option<String>,

    /// Speech rate multiplier
    #[serde(default = "default_tts_speed")]
    pub speed: f32,
}

/// STT configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SttConfig {
    /// Model identifier
    pub model: Option<String>,

    /// Primary language (BCP 47 code)
    pub language: Option<String>,
}

/// Behavior and communication style
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    /// Base system prompt
    pub system_prompt: Option<String>,

    /// Default communication tone
    pub tone: Option<String>,
}

/// Lines spoken without asking the AI
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallScript {
    /// Opening line
    pub greeting: Option<String>,

    /// Replies used when the AI cannot answer
    #[serde(default)]
    pub fallback_responses: Vec<String>,
}

const fn default_tts_speed() -> f32 {
    1.0
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            schema: None,
            version: "1.0.0".to_string(),
            identity: Identity {
                id: "coach".to_string(),
                name: "Coach".to_string(),
                tagline: None,
            },
            voice: None,
            personality: None,
            call: CallScript::default(),
        }
    }
}

impl Persona {
    /// Get the unique identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Get the display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Get the system prompt
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.personality.as_ref()?.system_prompt.as_deref()
    }

    /// Get the TTS provider
    #[must_use]
    pub fn tts_provider(&self) -> Option<&str> {
        self.voice.as_ref()?.tts.as_ref()?.provider.as_deref()
    }

    /// Get the TTS voice identifier
    #[must_use]
    pub fn tts_voice(&self) -> Option<&str> {
        self.voice.as_ref()?.tts.as_ref()?.voice.as_deref()
    }

    /// Get the TTS speech rate
    #[must_use]
    pub fn tts_speed(&self) -> f32 {
        self.voice
            .as_ref()
            .and_then(|v| v.tts.as_ref())
            .map_or(1.0, |tts| tts.speed)
    }

    /// Get the STT model
    #[must_use]
    pub fn stt_model(&self) -> Option<&str> {
        self.voice.as_ref()?.stt.as_ref()?.model.as_deref()
    }

    /// Get the spoken language
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.voice.as_ref()?.stt.as_ref()?.language.as_deref()
    }

    /// Get the realtime endpoint voice
    #[must_use]
    pub fn realtime_voice(&self) -> Option<&str> {
        self.voice.as_ref()?.realtime_voice.as_deref()
    }

    /// Get the greeting line
    #[must_use]
    pub fn greeting(&self) -> Option<&str> {
        self.call.greeting.as_deref().filter(|g| !g.trim().is_empty())
    }

    /// Get the fallback replies
    #[must_use]
    pub fn fallback_responses(&self) -> &[String] {
        &self.call.fallback_responses
    }
}
