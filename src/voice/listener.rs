//! Speech capture service
//!
//! Wraps a recognition engine with result filtering and the error policy:
//! which failures restart automatically, which reach the user, and when
//! auto-restart gives up.

use std::time::{Duration, Instant};

use super::backoff::{NetworkErrorState, RestartPolicy};
use super::filter::{FilterConfig, ResultFilter};
use super::recognizer::{RecognitionErrorKind, RecognizerEvent, SpeechRecognizer, StartError};

/// Error taxonomy surfaced to the user and the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// User must grant microphone access; no retry
    PermissionDenied,
    /// Capture device missing or busy
    DeviceUnavailable,
    /// Recoverable network failure
    TransientNetwork,
    /// Nothing was heard
    NoInputDetected,
    /// AI generation or synthesis failed; fallback content used
    ProviderFailure,
    /// No speech recognition on this platform
    UnsupportedPlatform,
}

/// What the capture service made of one engine event
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureSignal {
    /// Accepted interim transcript
    Interim(String),
    /// Accepted final transcript
    Final {
        text: String,
        confidence: Option<f32>,
    },
    /// Input level for meters
    Level(f32),
    /// Engine is running
    Started,
    /// Engine stopped; restart after the delay if the gate allows it
    Ended { restart_after: Option<Duration> },
    /// User-facing problem that does not end the call
    Problem { class: ErrorClass, message: String },
    /// Problem that ends the call
    Fatal { class: ErrorClass, message: String },
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new run began
    Started,
    /// A run was already in progress, which counts as success
    AlreadyRunning,
}

/// Filtered, policy-aware wrapper around a recognition engine
pub struct SpeechCapture<R> {
    recognizer: R,
    filter: ResultFilter,
    policy: RestartPolicy,
    network: NetworkErrorState,
    // restart delay decided by the last error of the current run
    pending_restart: Option<Option<Duration>>,
    fatal: bool,
}

impl<R: SpeechRecognizer> SpeechCapture<R> {
    /// Wrap an engine
    #[must_use]
    pub fn new(recognizer: R, filter: FilterConfig, policy: RestartPolicy) -> Self {
        Self {
            recognizer,
            filter: ResultFilter::new(filter),
            policy,
            network: NetworkErrorState::default(),
            pending_restart: None,
            fatal: false,
        }
    }

    /// Probe platform support
    ///
    /// # Errors
    ///
    /// Returns why recognition cannot run here
    pub fn check_support(&self) -> Result<(), StartError> {
        self.recognizer.check_support()
    }

    /// Start the engine; "already started" is a success
    ///
    /// # Errors
    ///
    /// Returns any other start failure
    pub fn start(&mut self) -> Result<StartOutcome, StartError> {
        match self.recognizer.start() {
            Ok(()) => {
                self.pending_restart = None;
                Ok(StartOutcome::Started)
            }
            Err(StartError::AlreadyStarted) => {
                tracing::debug!("recognizer already started");
                Ok(StartOutcome::AlreadyRunning)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the engine
    pub fn stop(&mut self) {
        self.recognizer.stop();
    }

    /// Release the engine's hardware
    pub fn release(&mut self) {
        self.recognizer.release();
    }

    /// Clear the failure budget and fatal state after a user action
    pub fn reset_errors(&mut self) {
        self.network.reset();
        self.fatal = false;
        self.pending_restart = None;
    }

    /// Whether auto-restart has been suspended by repeated network failures
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.network.is_suspended()
    }

    /// Whether a fatal error occurred
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Consecutive network failures so far
    #[must_use]
    pub const fn network_failures(&self) -> u32 {
        self.network.consecutive()
    }

    /// Interpret one engine event
    pub fn on_event(&mut self, event: RecognizerEvent, now: Instant) -> Option<CaptureSignal> {
        match event {
            RecognizerEvent::Started => Some(CaptureSignal::Started),
            RecognizerEvent::AudioLevel(level) => Some(CaptureSignal::Level(level.clamp(0.0, 1.0))),
            RecognizerEvent::Interim(text) => match self.filter.check_interim(&text) {
                Ok(()) => Some(CaptureSignal::Interim(text)),
                Err(reason) => {
                    tracing::trace!(?reason, "interim result dropped");
                    None
                }
            },
            RecognizerEvent::Final { text, confidence } => {
                match self.filter.check_final(&text, now) {
                    Ok(()) => {
                        self.network.record_success();
                        Some(CaptureSignal::Final { text, confidence })
                    }
                    Err(reason) => {
                        tracing::debug!(?reason, text, "final result dropped");
                        None
                    }
                }
            }
            RecognizerEvent::Error(kind) => self.on_error(kind),
            RecognizerEvent::Ended => {
                let decided = self.pending_restart.take();
                let restart_after = if self.fatal || self.network.is_suspended() {
                    None
                } else {
                    decided.unwrap_or(Some(self.policy.quiet_restart_delay))
                };
                Some(CaptureSignal::Ended { restart_after })
            }
        }
    }

    fn on_error(&mut self, kind: RecognitionErrorKind) -> Option<CaptureSignal> {
        match kind {
            RecognitionErrorKind::NoSpeech => {
                tracing::debug!("no speech detected");
                self.pending_restart = Some(Some(self.policy.quiet_restart_delay));
                None
            }
            RecognitionErrorKind::Aborted => {
                tracing::debug!("recognition aborted");
                None
            }
            RecognitionErrorKind::Network => {
                if let Some(delay) = self.network.record_failure(&self.policy) {
                    tracing::warn!(
                        failures = self.network.consecutive(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "speech recognition network error, backing off"
                    );
                    self.pending_restart = Some(Some(delay));
                    Some(CaptureSignal::Problem {
                        class: ErrorClass::TransientNetwork,
                        message: "Connection problem with speech recognition, retrying"
                            .to_string(),
                    })
                } else {
                    tracing::error!(
                        failures = self.network.consecutive(),
                        "speech recognition network budget exhausted, auto-restart suspended"
                    );
                    self.pending_restart = Some(None);
                    Some(CaptureSignal::Problem {
                        class: ErrorClass::TransientNetwork,
                        message: "Speech recognition keeps failing. Restart the microphone to try again"
                            .to_string(),
                    })
                }
            }
            RecognitionErrorKind::NotAllowed => {
                tracing::error!("microphone permission denied");
                self.fatal = true;
                self.pending_restart = Some(None);
                Some(CaptureSignal::Fatal {
                    class: ErrorClass::PermissionDenied,
                    message: "Microphone access was denied. Grant permission to continue"
                        .to_string(),
                })
            }
            RecognitionErrorKind::AudioCapture => {
                tracing::error!("audio capture device unavailable");
                self.pending_restart = Some(None);
                Some(CaptureSignal::Problem {
                    class: ErrorClass::DeviceUnavailable,
                    message: "No microphone available. Check that it is connected and not in use"
                        .to_string(),
                })
            }
            RecognitionErrorKind::Other(reason) => {
                tracing::warn!(reason, "speech recognition error");
                self.pending_restart = Some(None);
                Some(CaptureSignal::Problem {
                    class: ErrorClass::ProviderFailure,
                    message: format!("Speech recognition error: {reason}"),
                })
            }
        }
    }
}
