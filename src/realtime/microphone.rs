//! Microphone engine that streams to the realtime endpoint
//!
//! Transcripts come back from the remote side as [`RealtimeSignal`]s; this
//! engine only moves audio upstream while it is started.
//!
//! [`RealtimeSignal`]: super::RealtimeSignal

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::events::ClientEvent;
use super::transport::RealtimeTransport;
use crate::voice::recognizer::{
    RecognitionErrorKind, RecognizerEvent, RecognizerEvents, SpeechRecognizer, StartError,
    reap_worker,
};
use crate::voice::{AudioCapture, input_available, meter_level, samples_to_pcm16};

/// PCM16 mono rate the realtime endpoint expects
pub const INPUT_SAMPLE_RATE: u32 = 24000;

const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

/// Streams microphone audio over a realtime transport while started
pub struct RealtimeMicrophone {
    transport: Arc<dyn RealtimeTransport>,
    events: RecognizerEvents,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RealtimeMicrophone {
    #[must_use]
    pub fn new(transport: Arc<dyn RealtimeTransport>, events: RecognizerEvents) -> Self {
        Self {
            transport,
            events,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl SpeechRecognizer for RealtimeMicrophone {
    fn check_support(&self) -> Result<(), StartError> {
        if input_available() {
            Ok(())
        } else {
            Err(StartError::Unsupported("no audio input device".to_string()))
        }
    }

    fn start(&mut self) -> Result<(), StartError> {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return Err(StartError::AlreadyStarted);
        }
        self.check_support()?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Arc::clone(&stop_flag);
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();

        let worker = std::thread::Builder::new()
            .name("realtime-mic".to_string())
            .spawn(move || stream_microphone(&*transport, &events, &stop_flag))
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
            reap_worker(worker, "realtime-mic");
        }
    }
}

impl Drop for RealtimeMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stream_microphone(
    transport: &dyn RealtimeTransport,
    events: &RecognizerEvents,
    stop_flag: &AtomicBool,
) {
    let mut capture =
        match AudioCapture::with_sample_rate(INPUT_SAMPLE_RATE).and_then(|mut c| c.start().map(|()| c)) {
            Ok(capture) => capture,
            Err(e) => {
                tracing::error!(error = %e, "failed to open microphone");
                let kind = match e {
                    crate::Error::PermissionDenied => RecognitionErrorKind::NotAllowed,
                    _ => RecognitionErrorKind::AudioCapture,
                };
                let _ = events.send(RecognizerEvent::Error(kind));
                let _ = events.send(RecognizerEvent::Ended);
                return;
            }
        };

    let _ = events.send(RecognizerEvent::Started);
    let mut dropped = 0u64;

    while !stop_flag.load(Ordering::SeqCst) {
        std::thread::sleep(CHUNK_INTERVAL);
        let samples = capture.take_buffer();
        if samples.is_empty() {
            continue;
        }
        let _ = events.send(RecognizerEvent::AudioLevel(meter_level(&samples)));

        if let Err(e) = transport.try_send(ClientEvent::AppendAudio(samples_to_pcm16(&samples))) {
            dropped += 1;
            if dropped == 1 || dropped.is_multiple_of(50) {
                tracing::warn!(error = %e, dropped, "dropping microphone audio");
            }
        }
    }

    capture.stop();
    let _ = transport.try_send(ClientEvent::ClearAudio);
    let _ = events.send(RecognizerEvent::Ended);
}
