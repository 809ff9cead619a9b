//! Shared test utilities
//!
//! Scripted stand-ins for the recognizer, AI generator, synthesizers, audio
//! output and realtime transport, so calls run without hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc};

use ethos_voice::conversation::{FallbackResponses, RequestChannel, ResponseGenerator};
use ethos_voice::realtime::{ClientEvent, RealtimeLink, RealtimeSignal, RealtimeTransport};
use ethos_voice::voice::{
    AudioOutput, FilterConfig, GateConfig, LocalSpeechEvent, LocalSynthesizer,
    RecognitionErrorKind, RecognizerEvent, RecognizerEvents, RestartPolicy, Speaker,
    SpeakerConfig, SpeechRecognizer, SpeechSynthesizer, StartError, recognizer_channel,
};
use ethos_voice::{
    AiChannel, CallEvent, CallSetup, CoordinatorConfig, Error, EventSink, Result, TurnPhase,
    Utterance,
};

pub const FALLBACK_LINE: &str = "Cuéntame un poco más, por favor.";

#[derive(Debug, Default)]
struct RecognizerLog {
    starts: usize,
    stops: usize,
    releases: usize,
    running: bool,
    unsupported: Option<String>,
    failing_starts: usize,
}

/// Recognizer driven by the test through a [`RecognizerProbe`]
pub struct ScriptedRecognizer {
    log: Arc<Mutex<RecognizerLog>>,
    events: RecognizerEvents,
}

/// Test-side handle of a [`ScriptedRecognizer`]
#[derive(Clone)]
pub struct RecognizerProbe {
    log: Arc<Mutex<RecognizerLog>>,
    events: RecognizerEvents,
}

/// A scripted recognizer, its probe and the event receiver for the call
pub fn scripted_recognizer() -> (
    ScriptedRecognizer,
    RecognizerProbe,
    mpsc::UnboundedReceiver<RecognizerEvent>,
) {
    let (events, rx) = recognizer_channel();
    let log = Arc::new(Mutex::new(RecognizerLog::default()));
    let recognizer = ScriptedRecognizer {
        log: Arc::clone(&log),
        events: events.clone(),
    };
    (recognizer, RecognizerProbe { log, events }, rx)
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn check_support(&self) -> std::result::Result<(), StartError> {
        match &self.log.lock().unwrap().unsupported {
            Some(reason) => Err(StartError::Unsupported(reason.clone())),
            None => Ok(()),
        }
    }

    fn start(&mut self) -> std::result::Result<(), StartError> {
        let mut log = self.log.lock().unwrap();
        if log.running {
            return Err(StartError::AlreadyStarted);
        }
        log.starts += 1;
        if log.failing_starts > 0 {
            log.failing_starts -= 1;
            return Err(StartError::Failed("device busy".to_string()));
        }
        log.running = true;
        let _ = self.events.send(RecognizerEvent::Started);
        Ok(())
    }

    fn stop(&mut self) {
        let mut log = self.log.lock().unwrap();
        log.stops += 1;
        if log.running {
            log.running = false;
            let _ = self.events.send(RecognizerEvent::Ended);
        }
    }

    fn release(&mut self) {
        self.stop();
        self.log.lock().unwrap().releases += 1;
    }
}

impl RecognizerProbe {
    /// Report a final transcript
    pub fn say(&self, text: &str) {
        let _ = self.events.send(RecognizerEvent::Final {
            text: text.to_string(),
            confidence: Some(0.9),
        });
    }

    /// Report an interim transcript
    pub fn hear_partial(&self, text: &str) {
        let _ = self.events.send(RecognizerEvent::Interim(text.to_string()));
    }

    /// Fail the current run with `kind`; the run ends
    pub fn fail(&self, kind: RecognitionErrorKind) {
        let _ = self.events.send(RecognizerEvent::Error(kind));
        self.log.lock().unwrap().running = false;
        let _ = self.events.send(RecognizerEvent::Ended);
    }

    /// Report an error while the run carries on
    pub fn report_error(&self, kind: RecognitionErrorKind) {
        let _ = self.events.send(RecognizerEvent::Error(kind));
    }

    /// Refuse support checks with `reason`
    pub fn make_unsupported(&self, reason: &str) {
        self.log.lock().unwrap().unsupported = Some(reason.to_string());
    }

    /// Fail the next `count` start attempts
    pub fn fail_next_starts(&self, count: usize) {
        self.log.lock().unwrap().failing_starts = count;
    }

    pub fn starts(&self) -> usize {
        self.log.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.log.lock().unwrap().stops
    }

    pub fn releases(&self) -> usize {
        self.log.lock().unwrap().releases
    }

    pub fn is_running(&self) -> bool {
        self.log.lock().unwrap().running
    }

    /// Wait (on the test clock) until at least `count` starts happened
    pub async fn wait_for_starts(&self, count: usize) {
        for _ in 0..10_000 {
            if self.starts() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recognizer reached only {} starts, wanted {count}", self.starts());
    }
}

/// Scripted AI reply
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail,
    Delayed(Duration, String),
    Hang,
}

/// Generator answering from a script, recording each request
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(usize, String)>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// `(history length, user message)` of every request
    pub fn requests(&self) -> Vec<(usize, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, history: &[Utterance], user_message: &str) -> Result<String> {
        self.requests
            .lock()
            .unwrap()
            .push((history.len(), user_message.to_string()));
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Fail);
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail => Err(Error::Agent("connection reset".to_string())),
            Reply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Remote synthesizer that "encodes" text as its UTF-8 bytes
pub struct EchoSynthesizer {
    pub fail: bool,
}

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
        if self.fail {
            return Err(Error::Tts("503 Service Unavailable".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Audio output taking a fixed time per clip
pub struct FakeOutput {
    duration: Duration,
    played: Mutex<Vec<String>>,
    completed: AtomicUsize,
    interrupted: Arc<AtomicUsize>,
}

impl FakeOutput {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            played: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            interrupted: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Texts whose audio started playing
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Clips cut off before finishing
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }
}

struct PlayGuard {
    done: bool,
    interrupted: Arc<AtomicUsize>,
}

impl Drop for PlayGuard {
    fn drop(&mut self) {
        if !self.done {
            self.interrupted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn play_mp3(&self, mp3: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()> {
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&mp3).into_owned());
        let mut guard = PlayGuard {
            done: false,
            interrupted: Arc::clone(&self.interrupted),
        };

        let deadline = tokio::time::Instant::now() + self.duration;
        while tokio::time::Instant::now() < deadline {
            if cancel.load(Ordering::Acquire) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        guard.done = true;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// On-device synthesizer that finishes after a fixed time
pub struct FakeLocalVoice {
    pub duration: Duration,
    pub spoken: Arc<Mutex<Vec<String>>>,
}

impl LocalSynthesizer for FakeLocalVoice {
    fn speak(&self, text: &str, _locale: Option<&str>) -> BoxStream<'static, LocalSpeechEvent> {
        self.spoken.lock().unwrap().push(text.to_string());
        let duration = self.duration;
        stream::once(async { LocalSpeechEvent::Started })
            .chain(stream::once(async move {
                tokio::time::sleep(duration).await;
                LocalSpeechEvent::Finished
            }))
            .boxed()
    }
}

/// Realtime transport recording what the coordinator sends
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<ClientEvent>>,
    closed: AtomicBool,
    hang_on_close: AtomicBool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make `close` never return, like a socket whose peer went away
    pub fn hang_on_close(&self) {
        self.hang_on_close.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RealtimeTransport for RecordingTransport {
    async fn send(&self, event: ClientEvent) -> Result<()> {
        self.try_send(event)
    }

    fn try_send(&self, event: ClientEvent) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Realtime("connection closed".to_string()));
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

/// Timing used by most call tests
pub fn coordinator(greeting: Option<&str>) -> CoordinatorConfig {
    CoordinatorConfig {
        greeting: greeting.map(str::to_string),
        ..CoordinatorConfig::default()
    }
}

/// Everything a request/response call test needs
pub struct RequestRig {
    pub setup: CallSetup<ScriptedRecognizer>,
    pub probe: RecognizerProbe,
    pub generator: Arc<ScriptedGenerator>,
    pub output: Arc<FakeOutput>,
    pub events: broadcast::Receiver<CallEvent>,
}

/// Request/response call with an echo synthesizer and fixed-length playback
pub fn request_rig(
    replies: Vec<Reply>,
    config: CoordinatorConfig,
    speech_duration: Duration,
) -> RequestRig {
    let sink = EventSink::new();
    let events = sink.subscribe();
    let (recognizer, probe, recognizer_events) = scripted_recognizer();
    let generator = ScriptedGenerator::new(replies);
    let output = FakeOutput::new(speech_duration);

    let (speaker, speaker_events) = Speaker::new(
        Some(Arc::new(EchoSynthesizer { fail: false })),
        None,
        Arc::clone(&output) as Arc<dyn AudioOutput>,
        sink.clone(),
        SpeakerConfig::default(),
    );

    let setup = CallSetup {
        recognizer,
        recognizer_events,
        channel: AiChannel::Request(RequestChannel::new(
            Arc::clone(&generator) as Arc<dyn ResponseGenerator>,
            speaker,
            speaker_events,
        )),
        fallbacks: FallbackResponses::new(vec![FALLBACK_LINE.to_string()]),
        config,
        gate: GateConfig::default(),
        filter: FilterConfig::default(),
        restart: RestartPolicy::default(),
        events: sink,
    };

    RequestRig {
        setup,
        probe,
        generator,
        output,
        events,
    }
}

/// Everything a realtime call test needs
pub struct DuplexRig {
    pub setup: CallSetup<ScriptedRecognizer>,
    pub probe: RecognizerProbe,
    pub transport: Arc<RecordingTransport>,
    pub signals: mpsc::Sender<RealtimeSignal>,
    pub events: broadcast::Receiver<CallEvent>,
}

/// Realtime call over a recording transport, without local audio
pub fn duplex_rig(config: CoordinatorConfig) -> DuplexRig {
    let sink = EventSink::new();
    let events = sink.subscribe();
    let (recognizer, probe, recognizer_events) = scripted_recognizer();
    let transport = Arc::new(RecordingTransport::default());
    let (signals, rx) = mpsc::channel(64);
    let link = RealtimeLink::new(
        Arc::clone(&transport) as Arc<dyn RealtimeTransport>,
        rx,
        None,
    );

    let setup = CallSetup {
        recognizer,
        recognizer_events,
        channel: AiChannel::Duplex(link),
        fallbacks: FallbackResponses::default(),
        config,
        gate: GateConfig::default(),
        filter: FilterConfig::default(),
        restart: RestartPolicy::default(),
        events: sink,
    };

    DuplexRig {
        setup,
        probe,
        transport,
        signals,
        events,
    }
}

/// Receive events until one matches, returning everything seen including it
pub async fn collect_until(
    events: &mut broadcast::Receiver<CallEvent>,
    mut done: impl FnMut(&CallEvent) -> bool,
) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    loop {
        let received = tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .expect("timed out waiting for call event");
        let event = match received {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        };
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Drop every event received so far
pub fn drain(events: &mut broadcast::Receiver<CallEvent>) {
    loop {
        match events.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return,
        }
    }
}

/// Wait for the call to reach `phase`
pub async fn wait_for_phase(events: &mut broadcast::Receiver<CallEvent>, phase: TurnPhase) -> Vec<CallEvent> {
    collect_until(events, |e| matches!(e, CallEvent::PhaseChanged { phase: p, .. } if *p == phase)).await
}

/// Wait for the microphone to start capturing
pub async fn wait_for_capture(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    collect_until(events, |e| matches!(e, CallEvent::Microphone { state } if state.is_capturing)).await
}

/// Phases in the order they were entered
pub fn phases(events: &[CallEvent]) -> Vec<TurnPhase> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::PhaseChanged { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect()
}
