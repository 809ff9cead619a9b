//! TOML configuration file loading
//!
//! Supports `~/.config/ethos/voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct EthosConfigFile {
    /// Persona identifier (e.g. "coach")
    #[serde(default)]
    pub persona: Option<String>,

    /// Chat model configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Call timing and microphone behavior
    #[serde(default)]
    pub call: CallFileConfig,

    /// Realtime endpoint configuration
    #[serde(default)]
    pub realtime: RealtimeFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Chat model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// OpenAI-compatible base URL
    pub base_url: Option<String>,

    /// Model used for post-call feedback
    pub feedback_model: Option<String>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "nova")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,

    /// Spoken language (ISO 639-1)
    pub language: Option<String>,

    /// Allow on-device synthesis when the remote voice fails
    pub local_fallback: Option<bool>,
}

/// Call timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct CallFileConfig {
    pub think_delay_ms: Option<u64>,
    pub response_timeout_secs: Option<u64>,
    pub call_limit_secs: Option<u64>,
    pub resume_delay_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub network_error_budget: Option<u32>,
    pub min_transcript_chars: Option<usize>,
    pub echo_suppression: Option<bool>,
}

/// Realtime endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub transcription_model: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `EthosConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> EthosConfigFile {
    config_file_path().map_or_else(EthosConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> EthosConfigFile {
    if !path.exists() {
        return EthosConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                EthosConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            EthosConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/ethos/voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("ethos")
            .join("voice")
            .join("config.toml")
    })
}
