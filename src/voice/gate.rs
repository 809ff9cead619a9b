//! Microphone gate
//!
//! Single authority over whether the capture engine may run. Two independent
//! block sources are reconciled here: the user's mute switch and the block
//! held while the coach is thinking or speaking. Deferred actions (delayed
//! resume, start retry, auto-restart) carry a generation token and re-check
//! the live state when they fire.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use super::listener::{CaptureSignal, ErrorClass, SpeechCapture};
use super::recognizer::{RecognizerEvent, SpeechRecognizer, StartError};
use crate::events::{CallEvent, EventSink, Notice};

/// Microphone state; `is_capturing` implies neither muted nor blocked
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicrophoneState {
    pub is_user_muted: bool,
    pub is_blocked_by_ai: bool,
    pub is_capturing: bool,
    pub audio_level: f32,
}

/// Gate timing
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Wait after the coach stops speaking before listening again
    pub resume_delay: Duration,
    /// Wait before the single retry of a failed start
    pub retry_delay: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            resume_delay: Duration::from_millis(1200),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Deferred gate action, tagged with the generation it was scheduled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTimer {
    /// Resume after the coach finished speaking
    Resume(u64),
    /// Second attempt after a failed start
    RetryStart(u64),
    /// Restart after the engine ended on its own
    Restart(u64),
}

impl GateTimer {
    const fn generation(self) -> u64 {
        match self {
            Self::Resume(g) | Self::RetryStart(g) | Self::Restart(g) => g,
        }
    }
}

/// Runs deferred gate actions
pub trait Scheduler: Send {
    /// Deliver `timer` back to the gate after `delay`
    fn schedule(&self, delay: Duration, timer: GateTimer);
}

/// Scheduler delivering timers over a channel from tokio sleep tasks
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<GateTimer>,
}

impl TokioScheduler {
    /// Create a scheduler and the receiver its timers arrive on
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GateTimer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, timer: GateTimer) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        });
    }
}

/// Scheduler that records requests; useful for driving the gate by hand
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    pending: Arc<Mutex<Vec<(Duration, GateTimer)>>>,
}

impl ManualScheduler {
    /// Take every timer scheduled so far
    #[must_use]
    pub fn drain(&self) -> Vec<(Duration, GateTimer)> {
        self.pending
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, timer: GateTimer) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((delay, timer));
        }
    }
}

/// Speech the gate lets through to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Heard {
    Interim(String),
    Final {
        text: String,
        confidence: Option<f32>,
    },
    /// Capture failed in a way that ends the call
    Fatal { class: ErrorClass, message: String },
}

/// Exclusive-access controller for the capture engine
pub struct MicrophoneGate<R: SpeechRecognizer> {
    capture: SpeechCapture<R>,
    config: GateConfig,
    state: MicrophoneState,
    scheduler: Box<dyn Scheduler>,
    events: EventSink,
    generation: u64,
    manual_only: bool,
    released: bool,
}

impl<R: SpeechRecognizer> MicrophoneGate<R> {
    /// Create a gate; capture stays off until something unblocks it
    #[must_use]
    pub fn new(
        capture: SpeechCapture<R>,
        config: GateConfig,
        scheduler: Box<dyn Scheduler>,
        events: EventSink,
    ) -> Self {
        Self {
            capture,
            config,
            state: MicrophoneState::default(),
            scheduler,
            events,
            generation: 0,
            manual_only: false,
            released: false,
        }
    }

    /// Current state snapshot
    #[must_use]
    pub const fn state(&self) -> MicrophoneState {
        self.state
    }

    /// Whether auto-resume is disabled until the user acts
    #[must_use]
    pub const fn is_manual_only(&self) -> bool {
        self.manual_only
    }

    /// Whether automatic restarts are suspended by repeated network failures
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.capture.is_suspended()
    }

    /// Probe recognition support before a call starts
    ///
    /// # Errors
    ///
    /// Returns why capture cannot run on this platform
    pub fn check_support(&self) -> Result<(), StartError> {
        self.capture.check_support()
    }

    /// Apply the user's mute switch
    pub fn set_manual_mute(&mut self, muted: bool) {
        if self.released {
            return;
        }
        self.state.is_user_muted = muted;
        self.generation += 1;

        if muted {
            self.stop_capture("muted by user");
        } else {
            self.manual_only = false;
            if !self.state.is_blocked_by_ai {
                self.start_capture(true);
            }
        }
        self.publish();
    }

    /// Block capture while the coach thinks or speaks
    pub fn block_for_ai(&mut self) {
        if self.released {
            return;
        }
        if self.state.is_blocked_by_ai && !self.state.is_capturing {
            return;
        }
        self.state.is_blocked_by_ai = true;
        self.generation += 1;
        if self.state.is_capturing {
            tracing::info!("microphone paused for AI");
            self.stop_capture("paused for AI");
        }
        self.publish();
    }

    /// Lift the AI block and schedule the delayed resume
    pub fn unblock_after_ai(&mut self) {
        if self.released {
            return;
        }
        self.state.is_blocked_by_ai = false;
        self.generation += 1;
        self.scheduler
            .schedule(self.config.resume_delay, GateTimer::Resume(self.generation));
        tracing::debug!(
            delay_ms = u64::try_from(self.config.resume_delay.as_millis()).unwrap_or(u64::MAX),
            "microphone resume scheduled"
        );
        self.publish();
    }

    /// User-requested restart: clears the error budget and manual-only mode
    pub fn manual_restart(&mut self) {
        if self.released {
            return;
        }
        self.capture.reset_errors();
        self.manual_only = false;
        self.generation += 1;
        if !self.state.is_user_muted && !self.state.is_blocked_by_ai {
            self.start_capture(true);
        }
        self.publish();
    }

    /// Handle a deferred action
    pub fn on_timer(&mut self, timer: GateTimer) {
        if timer.generation() != self.generation {
            tracing::trace!(?timer, current = self.generation, "stale gate timer ignored");
            return;
        }
        if !self.can_auto_start() {
            tracing::debug!(?timer, state = ?self.state, "deferred start skipped");
            return;
        }

        match timer {
            GateTimer::Resume(_) | GateTimer::Restart(_) => self.start_capture(true),
            GateTimer::RetryStart(_) => self.start_capture(false),
        }
        self.publish();
    }

    /// Route an engine event through the capture service
    pub fn on_engine_event(&mut self, event: RecognizerEvent) -> Option<Heard> {
        // Paused test clocks drive the rate limiter too
        let now = tokio::time::Instant::now().into_std();
        let signal = self.capture.on_event(event, now)?;
        match signal {
            CaptureSignal::Started => {
                tracing::debug!("speech recognition running");
                None
            }
            CaptureSignal::Level(level) => {
                self.state.audio_level = if self.state.is_capturing { level } else { 0.0 };
                None
            }
            CaptureSignal::Interim(text) => self.accepting().then_some(Heard::Interim(text)),
            CaptureSignal::Final { text, confidence } => {
                if self.accepting() {
                    Some(Heard::Final { text, confidence })
                } else {
                    tracing::debug!(text, "discarding speech heard while blocked");
                    None
                }
            }
            CaptureSignal::Ended { restart_after } => {
                self.state.is_capturing = false;
                self.state.audio_level = 0.0;
                if let Some(delay) = restart_after {
                    if self.can_auto_start() {
                        self.scheduler
                            .schedule(delay, GateTimer::Restart(self.generation));
                    }
                }
                self.publish();
                None
            }
            CaptureSignal::Problem { class, message } => {
                // Engines may keep running after a network error; the backoff
                // restart hangs off the `Ended` that stopping produces
                if class == ErrorClass::TransientNetwork && self.state.is_capturing {
                    self.stop_capture("network error");
                    self.publish();
                }
                self.events.notice(Notice::warning(class, message));
                None
            }
            CaptureSignal::Fatal { class, message } => {
                self.stop_capture("fatal capture error");
                self.publish();
                self.events.notice(Notice::error(class, message.clone()));
                Some(Heard::Fatal { class, message })
            }
        }
    }

    /// Stop capture for good and release the hardware
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.generation += 1;
        self.capture.stop();
        self.capture.release();
        self.state.is_capturing = false;
        self.state.audio_level = 0.0;
        tracing::debug!("microphone released");
        self.publish();
    }

    fn accepting(&self) -> bool {
        !self.released && !self.state.is_user_muted && !self.state.is_blocked_by_ai
    }

    fn can_auto_start(&self) -> bool {
        self.accepting()
            && !self.state.is_capturing
            && !self.manual_only
            && !self.capture.is_suspended()
            && !self.capture.is_fatal()
    }

    fn start_capture(&mut self, retry_on_failure: bool) {
        if self.state.is_capturing {
            return;
        }

        match self.capture.start() {
            Ok(outcome) => {
                self.state.is_capturing = true;
                tracing::debug!(?outcome, "microphone capturing");
            }
            Err(StartError::AlreadyStarted) => {
                self.state.is_capturing = true;
            }
            Err(e @ (StartError::Unsupported(_) | StartError::InsecureContext(_))) => {
                self.manual_only = true;
                self.events.notice(Notice::error(
                    ErrorClass::UnsupportedPlatform,
                    format!("Speech recognition is not available: {e}"),
                ));
            }
            Err(e) if retry_on_failure => {
                tracing::warn!(error = %e, "microphone start failed, retrying once");
                self.scheduler
                    .schedule(self.config.retry_delay, GateTimer::RetryStart(self.generation));
            }
            Err(e) => {
                self.manual_only = true;
                self.events.notice(Notice::error(
                    ErrorClass::DeviceUnavailable,
                    format!("Could not start the microphone ({e}). Unmute or restart it to try again"),
                ));
            }
        }
    }

    fn stop_capture(&mut self, reason: &str) {
        if self.state.is_capturing {
            self.capture.stop();
            tracing::debug!(reason, "microphone capture stopped");
        }
        self.state.is_capturing = false;
        self.state.audio_level = 0.0;
    }

    fn publish(&self) {
        self.events.publish(CallEvent::Microphone { state: self.state });
    }
}

impl<R: SpeechRecognizer> Drop for MicrophoneGate<R> {
    fn drop(&mut self) {
        self.release();
    }
}
