//! Configuration management for Ethos voice calls
//!
//! Values are layered: environment > TOML file > persona > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use file::EthosConfigFile;

use crate::conversation::{CoordinatorConfig, FallbackResponses};
use crate::realtime::{RealtimeConfig, SessionSettings};
use crate::voice::{
    DEFAULT_WORDS_PER_MINUTE, FilterConfig, GateConfig, RestartPolicy, SpeakerConfig,
};
use crate::{Error, Persona, Result};

/// Persona used when none is named
pub const DEFAULT_PERSONA: &str = "coach";

/// Ethos voice configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active persona
    pub persona: Persona,

    /// Chat model configuration
    pub llm: LlmConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Call timing
    pub call: CallConfig,

    /// Realtime endpoint
    pub realtime: RealtimeSettings,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Chat model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub feedback_model: String,
}

/// Voice configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub stt_provider: String,
    pub stt_model: String,
    pub tts_provider: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_speed: f32,
    pub language: Option<String>,
    pub local_fallback: bool,
}

impl VoiceConfig {
    /// On-device voice rate matching `tts_speed`
    #[must_use]
    pub fn local_words_per_minute(&self) -> u32 {
        let speed = self.tts_speed.clamp(0.25, 4.0);
        (DEFAULT_WORDS_PER_MINUTE as f32 * speed).round() as u32
    }
}

/// Call timing and microphone behavior
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub think_delay: Duration,
    pub response_timeout: Duration,
    pub call_limit: Duration,
    pub resume_delay: Duration,
    pub retry_delay: Duration,
    pub network_error_budget: u32,
    pub min_transcript_chars: usize,
    pub echo_suppression: bool,
}

/// Realtime endpoint configuration
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub url: String,
    pub model: String,
    pub voice: String,
    pub transcription_model: String,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

impl Config {
    /// Load configuration for a persona
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be found
    pub fn load(persona_id: Option<&str>) -> Result<Self> {
        let fc = file::load_config_file();
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let persona_id = persona_id
            .map(str::to_string)
            .or_else(|| env("ETHOS_PERSONA"))
            .or_else(|| fc.persona.clone())
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
        let persona = Self::load_persona_with_priority(&persona_id, env("ETHOS_PERSONAS_DIR"))?;

        Ok(Self::resolve(persona, fc, env))
    }

    /// Merge the layers for an already loaded persona
    pub fn resolve(
        persona: Persona,
        fc: EthosConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let parse_u64 = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
        };

        let llm = LlmConfig {
            model: env("ETHOS_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: env("ETHOS_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            feedback_model: env("ETHOS_FEEDBACK_MODEL")
                .or(fc.llm.feedback_model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        };

        // Voice config (env > toml > persona > default)
        let tts_provider = fc
            .voice
            .tts_provider
            .or_else(|| persona.tts_provider().map(str::to_string))
            .unwrap_or_else(|| "openai".to_string());
        let default_tts_model = if tts_provider == "elevenlabs" {
            "eleven_multilingual_v2"
        } else {
            "tts-1"
        };
        let voice = VoiceConfig {
            stt_provider: fc.voice.stt_provider.unwrap_or_else(|| "whisper".to_string()),
            stt_model: env("ETHOS_STT_MODEL")
                .or(fc.voice.stt_model)
                .or_else(|| persona.stt_model().map(str::to_string))
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_model: env("ETHOS_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| default_tts_model.to_string()),
            tts_provider,
            tts_voice: env("ETHOS_TTS_VOICE")
                .or(fc.voice.tts_voice)
                .or_else(|| persona.tts_voice().map(str::to_string))
                .unwrap_or_else(|| "alloy".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or_else(|| persona.tts_speed()),
            language: env("ETHOS_LANGUAGE")
                .or(fc.voice.language)
                .or_else(|| persona.language().map(str::to_string)),
            local_fallback: fc.voice.local_fallback.unwrap_or(true),
        };

        let defaults = CoordinatorConfig::default();
        let gate = GateConfig::default();
        let policy = RestartPolicy::default();
        let filter = FilterConfig::default();
        let call = CallConfig {
            think_delay: fc
                .call
                .think_delay_ms
                .map_or(defaults.think_delay, Duration::from_millis),
            response_timeout: parse_u64("ETHOS_RESPONSE_TIMEOUT_SECS")
                .or(fc.call.response_timeout_secs)
                .map_or(defaults.response_timeout, Duration::from_secs),
            call_limit: parse_u64("ETHOS_CALL_LIMIT_SECS")
                .or(fc.call.call_limit_secs)
                .map_or(defaults.call_limit, Duration::from_secs),
            resume_delay: fc
                .call
                .resume_delay_ms
                .map_or(gate.resume_delay, Duration::from_millis),
            retry_delay: fc
                .call
                .retry_delay_ms
                .map_or(gate.retry_delay, Duration::from_millis),
            network_error_budget: fc
                .call
                .network_error_budget
                .unwrap_or(policy.network_error_budget)
                .max(1),
            min_transcript_chars: fc.call.min_transcript_chars.unwrap_or(filter.min_chars),
            echo_suppression: fc.call.echo_suppression.unwrap_or(filter.echo_suppression),
        };

        let realtime = RealtimeSettings {
            url: env("ETHOS_REALTIME_URL")
                .or(fc.realtime.url)
                .unwrap_or_else(|| "wss://api.openai.com/v1/realtime".to_string()),
            model: env("ETHOS_REALTIME_MODEL")
                .or(fc.realtime.model)
                .unwrap_or_else(|| "gpt-4o-realtime-preview".to_string()),
            voice: fc
                .realtime
                .voice
                .or_else(|| persona.realtime_voice().map(str::to_string))
                .unwrap_or_else(|| "alloy".to_string()),
            transcription_model: fc
                .realtime
                .transcription_model
                .unwrap_or_else(|| "whisper-1".to_string()),
        };

        Self {
            persona,
            llm,
            voice,
            call,
            realtime,
            api_keys,
        }
    }

    /// System prompt for the chat model
    #[must_use]
    pub fn system_prompt(&self) -> String {
        self.persona.system_prompt().map_or_else(
            || format!("You are {}, a voice coach. Keep replies short.", self.persona.name()),
            str::to_string,
        )
    }

    /// Coordinator timing and greeting
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            think_delay: self.call.think_delay,
            response_timeout: self.call.response_timeout,
            call_limit: self.call.call_limit,
            greeting: self.persona.greeting().map(str::to_string),
            ..CoordinatorConfig::default()
        }
    }

    /// Microphone gate timing
    #[must_use]
    pub const fn gate(&self) -> GateConfig {
        GateConfig {
            resume_delay: self.call.resume_delay,
            retry_delay: self.call.retry_delay,
        }
    }

    /// Transcript acceptance filter
    #[must_use]
    pub fn filter(&self) -> FilterConfig {
        FilterConfig {
            min_chars: self.call.min_transcript_chars,
            echo_suppression: self.call.echo_suppression,
            ..FilterConfig::default()
        }
    }

    /// Recognition restart policy
    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            network_error_budget: self.call.network_error_budget,
            ..RestartPolicy::default()
        }
    }

    /// Speaker settings
    #[must_use]
    pub fn speaker(&self) -> SpeakerConfig {
        SpeakerConfig {
            voice: Some(self.voice.tts_voice.clone()),
            locale: self.voice.language.clone(),
            ..SpeakerConfig::default()
        }
    }

    /// Fallback replies from the persona
    #[must_use]
    pub fn fallbacks(&self) -> FallbackResponses {
        FallbackResponses::new(self.persona.fallback_responses().to_vec())
    }

    /// Realtime connection parameters
    ///
    /// # Errors
    ///
    /// Returns error if no `OpenAI` API key is configured
    pub fn realtime_connection(&self) -> Result<RealtimeConfig> {
        let api_key = self
            .api_keys
            .openai
            .clone()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY required for realtime calls".to_string()))?;

        Ok(RealtimeConfig {
            url: self.realtime.url.clone(),
            model: self.realtime.model.clone(),
            api_key,
            session: SessionSettings {
                instructions: self.system_prompt(),
                voice: self.realtime.voice.clone(),
                transcription_model: self.realtime.transcription_model.clone(),
                language: self.voice.language.clone(),
            },
        })
    }

    /// Load a persona with priority: directory override, embedded
    ///
    /// # Errors
    ///
    /// Returns error if persona cannot be loaded from any source
    fn load_persona_with_priority(persona_id: &str, dir_override: Option<String>) -> Result<Persona> {
        // 1. ETHOS_PERSONAS_DIR env var (dev override)
        if let Some(dir) = dir_override {
            let path = PathBuf::from(&dir);
            if path.exists() {
                match Self::load_persona(&path, persona_id) {
                    Ok(persona) => {
                        tracing::info!(
                            persona_id,
                            path = %path.display(),
                            "loaded persona from ETHOS_PERSONAS_DIR"
                        );
                        return Ok(persona);
                    }
                    Err(e) => {
                        tracing::warn!(
                            persona_id,
                            error = %e,
                            "ETHOS_PERSONAS_DIR set but persona not loadable, continuing"
                        );
                    }
                }
            } else {
                tracing::warn!(path = %dir, "ETHOS_PERSONAS_DIR set but directory does not exist");
            }
        }

        // 2. Embedded fallback
        Self::load_embedded_persona(persona_id)
    }

    /// Load a persona JSON file from a directory
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or malformed
    pub fn load_persona(personas_dir: &Path, persona_id: &str) -> Result<Persona> {
        let json_path = personas_dir.join(format!("{persona_id}.json"));
        if !json_path.exists() {
            return Err(Error::PersonaNotFound(persona_id.to_string()));
        }

        let content = std::fs::read_to_string(&json_path)?;
        let persona: Persona = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {persona_id}.json: {e}")))?;
        tracing::debug!(path = %json_path.display(), "loaded persona from JSON");
        Ok(persona)
    }

    /// Embedded persona data for when no local files are available
    const EMBEDDED_PERSONAS: &[(&str, &str)] = &[("coach", include_str!("../../personas/coach.json"))];

    /// Load an embedded persona compiled into the binary
    ///
    /// # Errors
    ///
    /// Returns error if persona ID is not found in embedded data
    pub fn load_embedded_persona(persona_id: &str) -> Result<Persona> {
        let (_, json) = Self::EMBEDDED_PERSONAS
            .iter()
            .find(|(id, _)| *id == persona_id)
            .ok_or_else(|| Error::PersonaNotFound(persona_id.to_string()))?;
        let persona: Persona = serde_json::from_str(json)?;
        tracing::info!(persona_id, "loaded persona from embedded data");
        Ok(persona)
    }
}
