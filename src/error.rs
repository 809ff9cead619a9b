//! Error types for the Ethos voice orchestrator

use thiserror::Error;

/// Result type alias for Ethos operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a coaching call
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Persona not found
    #[error("persona not found: {0}")]
    PersonaNotFound(String),

    /// Audio device or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// AI response generation error
    #[error("agent error: {0}")]
    Agent(String),

    /// Realtime transport error
    #[error("realtime error: {0}")]
    Realtime(String),

    /// Microphone permission was denied
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Capture device missing or busy
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Speech recognition is not available on this platform
    #[error("speech recognition unsupported: {0}")]
    UnsupportedPlatform(String),

    /// Required transport security is missing
    #[error("insecure context: {0}")]
    InsecureContext(String),

    /// Operation on a call that already ended
    #[error("call already ended")]
    CallEnded,

    /// Operation exceeded its time budget
    #[error("timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error came from the network rather than the request itself
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Timeout(_) | Self::Realtime(_) => true,
            _ => false,
        }
    }
}
