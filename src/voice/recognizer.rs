//! Speech recognition engines
//!
//! A [`SpeechRecognizer`] is the raw engine behind the capture service: it
//! starts and stops on command and reports what it hears through a
//! [`RecognizerEvent`] channel handed out at construction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::capture::{AudioCapture, SAMPLE_RATE, input_available, meter_level, samples_to_wav};
use super::segmenter::{SegmenterConfig, SpeechSegmenter};
use super::stt::{Transcriber, is_secure_endpoint};

/// Raw engine error kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Nothing was said before the engine gave up
    NoSpeech,
    /// Microphone permission denied
    NotAllowed,
    /// Capture device missing or failed
    AudioCapture,
    /// Recognition backend unreachable
    Network,
    /// Stopped on request
    Aborted,
    /// Anything else
    Other(String),
}

/// Events reported by a recognition engine
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    Started,
    Interim(String),
    Final {
        text: String,
        confidence: Option<f32>,
    },
    Error(RecognitionErrorKind),
    AudioLevel(f32),
    Ended,
}

/// Why an engine refused to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// A recognition run is already in progress
    AlreadyStarted,
    /// No recognition capability on this platform
    Unsupported(String),
    /// Audio would leave over an unencrypted transport
    InsecureContext(String),
    /// Any other start failure
    Failed(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => f.write_str("recognizer already started"),
            Self::Unsupported(reason) => write!(f, "unsupported: {reason}"),
            Self::InsecureContext(reason) => write!(f, "insecure context: {reason}"),
            Self::Failed(reason) => write!(f, "start failed: {reason}"),
        }
    }
}

/// Sender half for engine events
pub type RecognizerEvents = mpsc::UnboundedSender<RecognizerEvent>;

/// Create the event channel an engine reports through
#[must_use]
pub fn recognizer_channel() -> (RecognizerEvents, mpsc::UnboundedReceiver<RecognizerEvent>) {
    mpsc::unbounded_channel()
}

/// A start/stop speech recognition engine
pub trait SpeechRecognizer: Send {
    /// Probe for recognition capability without acquiring the device
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Unsupported`] or [`StartError::InsecureContext`]
    fn check_support(&self) -> Result<(), StartError> {
        Ok(())
    }

    /// Begin a recognition run; events follow on the engine's channel
    ///
    /// # Errors
    ///
    /// Returns why the run could not start
    fn start(&mut self) -> Result<(), StartError>;

    /// End the current run; an `Ended` event follows
    fn stop(&mut self);

    /// Release the capture hardware for good
    fn release(&mut self) {
        self.stop();
    }
}

/// Tunables for [`SegmentingRecognizer`]
#[derive(Debug, Clone)]
pub struct SegmentingConfig {
    /// Speech segmentation thresholds
    pub segmenter: SegmenterConfig,
    /// How often the capture buffer is drained
    pub poll_interval: Duration,
    /// Silence after which the run ends with `NoSpeech`
    pub no_speech_timeout: Duration,
}

impl Default for SegmentingConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::for_sample_rate(SAMPLE_RATE),
            poll_interval: Duration::from_millis(100),
            no_speech_timeout: Duration::from_secs(8),
        }
    }
}

/// Microphone + energy segmentation + batch STT
///
/// Each run owns a capture thread that holds the device. Completed segments
/// are transcribed on the tokio runtime and reported as final results.
pub struct SegmentingRecognizer {
    transcriber: Arc<dyn Transcriber>,
    events: RecognizerEvents,
    config: SegmentingConfig,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SegmentingRecognizer {
    /// Create a recognizer reporting on `events`
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        events: RecognizerEvents,
        config: SegmentingConfig,
    ) -> Self {
        Self {
            transcriber,
            events,
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl SpeechRecognizer for SegmentingRecognizer {
    fn check_support(&self) -> Result<(), StartError> {
        if !input_available() {
            return Err(StartError::Unsupported("no audio input device".to_string()));
        }
        if let Some(endpoint) = self.transcriber.endpoint() {
            if !is_secure_endpoint(endpoint) {
                return Err(StartError::InsecureContext(format!(
                    "refusing to stream audio to {endpoint}"
                )));
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), StartError> {
        if self.worker_alive() {
            return Err(StartError::AlreadyStarted);
        }
        self.check_support()?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StartError::Failed(format!("no async runtime: {e}")))?;

        // Each run gets its own flag so a late stop cannot leak into the next run
        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Arc::clone(&stop_flag);

        let run = CaptureRun {
            transcriber: Arc::clone(&self.transcriber),
            events: self.events.clone(),
            config: self.config.clone(),
            stop_flag,
            runtime,
        };

        let worker = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run.run())
            .map_err(|e| StartError::Failed(e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            // The worker sees the flag within one poll interval
            reap_worker(worker, "mic-capture");
        }
    }
}

/// Collect a stopped capture thread without blocking the caller
///
/// Inside a runtime the join runs on the blocking pool so a panic is still
/// logged; elsewhere the thread is detached.
pub(crate) fn reap_worker(worker: JoinHandle<()>, name: &'static str) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || {
                if worker.join().is_err() {
                    tracing::warn!(thread = name, "capture thread panicked");
                }
            });
        }
        Err(_) => tracing::debug!(thread = name, "detaching capture thread"),
    }
}

impl Drop for SegmentingRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the capture thread for one run
struct CaptureRun {
    transcriber: Arc<dyn Transcriber>,
    events: RecognizerEvents,
    config: SegmentingConfig,
    stop_flag: Arc<AtomicBool>,
    runtime: tokio::runtime::Handle,
}

impl CaptureRun {
    fn run(self) {
        let mut capture = match AudioCapture::new().and_then(|mut c| c.start().map(|()| c)) {
            Ok(capture) => capture,
            Err(e) => {
                tracing::error!(error = %e, "failed to open microphone");
                let kind = match e {
                    crate::Error::PermissionDenied => RecognitionErrorKind::NotAllowed,
                    _ => RecognitionErrorKind::AudioCapture,
                };
                let _ = self.events.send(RecognizerEvent::Error(kind));
                let _ = self.events.send(RecognizerEvent::Ended);
                return;
            }
        };

        let _ = self.events.send(RecognizerEvent::Started);
        let mut segmenter = SpeechSegmenter::new(self.config.segmenter.clone());
        let mut last_speech = Instant::now();

        while !self.stop_flag.load(Ordering::SeqCst) {
            std::thread::sleep(self.config.poll_interval);

            let samples = capture.take_buffer();
            if samples.is_empty() {
                continue;
            }
            let _ = self
                .events
                .send(RecognizerEvent::AudioLevel(meter_level(&samples)));

            if segmenter.buffered() > 0 {
                last_speech = Instant::now();
            }
            if let Some(segment) = segmenter.push(&samples) {
                last_speech = Instant::now();
                self.transcribe(&segment, capture.sample_rate());
            } else if segmenter.buffered() == 0
                && last_speech.elapsed() >= self.config.no_speech_timeout
            {
                tracing::debug!("no speech detected, ending run");
                let _ = self
                    .events
                    .send(RecognizerEvent::Error(RecognitionErrorKind::NoSpeech));
                break;
            }
        }

        capture.stop();
        let _ = self.events.send(RecognizerEvent::Ended);
    }

    fn transcribe(&self, segment: &[f32], sample_rate: u32) {
        let wav = match samples_to_wav(segment, sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode speech segment");
                return;
            }
        };

        let transcriber = Arc::clone(&self.transcriber);
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let event = match transcriber.transcribe(&wav).await {
                Ok(text) => RecognizerEvent::Final {
                    text: text.trim().to_string(),
                    confidence: None,
                },
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "transcription request failed");
                    RecognizerEvent::Error(RecognitionErrorKind::Network)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transcription failed");
                    RecognizerEvent::Error(RecognitionErrorKind::Other(e.to_string()))
                }
            };
            let _ = events.send(event);
        });
    }
}
