//! Text-to-speech player
//!
//! Turns text into audible speech through the remote synthesizer, falling
//! back to on-device synthesis. Every speech reports `Started` and then
//! exactly one `Ended`, whatever way it finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::local_tts::{LocalSpeechEvent, LocalSynthesizer};
use super::playback::AudioOutput;
use super::tts::SpeechSynthesizer;
use crate::events::{EventSink, Notice};
use crate::{Error, Result};

/// Identifier of one `speak` request
pub type SpeechId = u64;

/// How a speech finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechEndReason {
    Completed,
    Failed,
    TimedOut,
    Superseded,
    Stopped,
}

/// Speaking lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerEvent {
    Started { id: SpeechId },
    Ended { id: SpeechId, reason: SpeechEndReason },
}

/// Speaker tunables
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    /// Voice passed to the remote synthesizer
    pub voice: Option<String>,
    /// Locale for on-device synthesis
    pub locale: Option<String>,
    /// Longest wait for remote audio before switching to the on-device voice
    pub synthesis_timeout: Duration,
    /// Lower bound of the per-speech safety timeout
    pub min_timeout: Duration,
    /// Timeout budget per character of text
    pub per_char: Duration,
    /// Upper bound of the per-speech safety timeout
    pub max_timeout: Duration,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            voice: None,
            locale: None,
            synthesis_timeout: Duration::from_secs(6),
            min_timeout: Duration::from_secs(8),
            per_char: Duration::from_millis(90),
            max_timeout: Duration::from_secs(60),
        }
    }
}

impl SpeakerConfig {
    /// Playback budget for a speech of `text`
    #[must_use]
    pub fn timeout_for(&self, text: &str) -> Duration {
        let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        self.per_char
            .saturating_mul(chars)
            .max(self.min_timeout)
            .min(self.max_timeout)
    }
}

// First recorded reason wins
type ReasonSlot = Arc<Mutex<Option<SpeechEndReason>>>;

fn settle(slot: &ReasonSlot, reason: SpeechEndReason) {
    if let Ok(mut slot) = slot.lock() {
        slot.get_or_insert(reason);
    }
}

/// Sends `Ended` when the speech task finishes or is dropped mid-flight
struct EndGuard {
    id: SpeechId,
    reason: ReasonSlot,
    events: mpsc::UnboundedSender<SpeakerEvent>,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or(SpeechEndReason::Stopped);
        tracing::debug!(id = self.id, ?reason, "speech ended");
        let _ = self.events.send(SpeakerEvent::Ended {
            id: self.id,
            reason,
        });
    }
}

struct CurrentSpeech {
    id: SpeechId,
    cancel: Arc<AtomicBool>,
    reason: ReasonSlot,
    task: JoinHandle<()>,
}

impl CurrentSpeech {
    fn end(self, reason: SpeechEndReason) {
        settle(&self.reason, reason);
        self.cancel.store(true, Ordering::Release);
        self.task.abort();
    }
}

#[derive(Clone)]
struct Backends {
    remote: Option<Arc<dyn SpeechSynthesizer>>,
    local: Option<Arc<dyn LocalSynthesizer>>,
    output: Arc<dyn AudioOutput>,
    notices: EventSink,
}

/// Plays one speech at a time
pub struct Speaker {
    backends: Backends,
    config: SpeakerConfig,
    events: mpsc::UnboundedSender<SpeakerEvent>,
    next_id: SpeechId,
    current: Option<CurrentSpeech>,
}

impl Speaker {
    /// Create a speaker and the receiver its lifecycle events arrive on
    #[must_use]
    pub fn new(
        remote: Option<Arc<dyn SpeechSynthesizer>>,
        local: Option<Arc<dyn LocalSynthesizer>>,
        output: Arc<dyn AudioOutput>,
        notices: EventSink,
        config: SpeakerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SpeakerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let speaker = Self {
            backends: Backends {
                remote,
                local,
                output,
                notices,
            },
            config,
            events,
            next_id: 0,
            current: None,
        };
        (speaker, rx)
    }

    /// Speak `text`, superseding any speech in flight
    pub fn speak(&mut self, text: &str) -> SpeechId {
        if let Some(previous) = self.current.take() {
            tracing::debug!(id = previous.id, "superseding speech");
            previous.end(SpeechEndReason::Superseded);
        }

        self.next_id += 1;
        let id = self.next_id;
        let cancel = Arc::new(AtomicBool::new(false));
        let reason: ReasonSlot = Arc::new(Mutex::new(None));
        // Synthesis is bounded on its own so a stalled backend still leaves
        // the whole playback budget to the fallback voice
        let synthesis_timeout = self.config.synthesis_timeout;
        let limit = synthesis_timeout + self.config.timeout_for(text);

        let guard = EndGuard {
            id,
            reason: Arc::clone(&reason),
            events: self.events.clone(),
        };
        let _ = self.events.send(SpeakerEvent::Started { id });

        let backends = self.backends.clone();
        let voice = self.config.voice.clone();
        let locale = self.config.locale.clone();
        let text = text.to_string();
        let task_cancel = Arc::clone(&cancel);
        let task_reason = Arc::clone(&reason);

        let task = tokio::spawn(async move {
            let _guard = guard;
            let spoken = tokio::time::timeout(
                limit,
                perform(
                    &backends,
                    &text,
                    voice.as_deref(),
                    locale.as_deref(),
                    synthesis_timeout,
                    &task_cancel,
                ),
            )
            .await;

            let outcome = match spoken {
                Ok(Ok(())) => SpeechEndReason::Completed,
                Ok(Err(e)) => {
                    tracing::warn!(id, error = %e, "speech failed");
                    SpeechEndReason::Failed
                }
                Err(_) => {
                    tracing::warn!(id, limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX), "speech timed out");
                    task_cancel.store(true, Ordering::Release);
                    SpeechEndReason::TimedOut
                }
            };
            settle(&task_reason, outcome);
        });

        self.current = Some(CurrentSpeech {
            id,
            cancel,
            reason,
            task,
        });
        id
    }

    /// End the speech in flight, if any
    pub fn stop(&mut self) {
        if let Some(current) = self.current.take() {
            tracing::debug!(id = current.id, "stopping speech");
            current.end(SpeechEndReason::Stopped);
        }
    }

    /// Whether a speech is in flight
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.current.as_ref().is_some_and(|c| !c.task.is_finished())
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn perform(
    backends: &Backends,
    text: &str,
    voice: Option<&str>,
    locale: Option<&str>,
    synthesis_timeout: Duration,
    cancel: &Arc<AtomicBool>,
) -> Result<()> {
    if let Some(remote) = &backends.remote {
        let synthesized = tokio::time::timeout(synthesis_timeout, remote.synthesize(text, voice))
            .await
            .unwrap_or_else(|_| Err(Error::Timeout("remote synthesis".to_string())));
        match synthesized {
            Ok(audio) => return backends.output.play_mp3(audio, Arc::clone(cancel)).await,
            Err(e) => {
                tracing::info!(error = %e, "remote synthesis unavailable, using on-device voice");
                backends
                    .notices
                    .notice(Notice::info("Using the on-device voice"));
            }
        }
    }

    let Some(local) = &backends.local else {
        return Err(Error::Tts("no speech synthesis available".to_string()));
    };

    let mut progress = local.speak(text, locale);
    while let Some(event) = progress.next().await {
        match event {
            LocalSpeechEvent::Started => tracing::debug!("on-device speech started"),
            LocalSpeechEvent::Finished => return Ok(()),
            LocalSpeechEvent::Failed(reason) => return Err(Error::Tts(reason)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    use super::*;

    struct FailingRemote;

    #[async_trait]
    impl SpeechSynthesizer for FailingRemote {
        async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
            Err(Error::Tts("503".to_string()))
        }
    }

    struct StalledRemote;

    #[async_trait]
    impl SpeechSynthesizer for StalledRemote {
        async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    struct InstantRemote;

    #[async_trait]
    impl SpeechSynthesizer for InstantRemote {
        async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
            Ok(vec![0xff; 16])
        }
    }

    /// Plays for a fixed time unless cancelled
    struct TimedOutput(Duration);

    #[async_trait]
    impl AudioOutput for TimedOutput {
        async fn play_mp3(&self, _mp3: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()> {
            let deadline = tokio::time::Instant::now() + self.0;
            while tokio::time::Instant::now() < deadline {
                if cancel.load(Ordering::Acquire) {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        }
    }

    /// On-device voice that records what it said and takes a while
    #[derive(Default)]
    struct RecordingLocal {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl LocalSynthesizer for RecordingLocal {
        fn speak(&self, text: &str, _locale: Option<&str>) -> BoxStream<'static, LocalSpeechEvent> {
            if let Ok(mut spoken) = self.spoken.lock() {
                spoken.push(text.to_string());
            }
            stream::once(async { LocalSpeechEvent::Started })
                .chain(stream::once(async {
                    tokio::time::sleep(Duration::from_secs(7)).await;
                    LocalSpeechEvent::Finished
                }))
                .boxed()
        }
    }

    struct QuickLocal;

    impl LocalSynthesizer for QuickLocal {
        fn speak(&self, _text: &str, _locale: Option<&str>) -> BoxStream<'static, LocalSpeechEvent> {
            stream::iter([LocalSpeechEvent::Started, LocalSpeechEvent::Finished]).boxed()
        }
    }

    fn speaker(
        remote: Option<Arc<dyn SpeechSynthesizer>>,
        local: Option<Arc<dyn LocalSynthesizer>>,
        play_for: Duration,
    ) -> (Speaker, mpsc::UnboundedReceiver<SpeakerEvent>, EventSink) {
        let sink = EventSink::new();
        let (speaker, rx) = Speaker::new(
            remote,
            local,
            Arc::new(TimedOutput(play_for)),
            sink.clone(),
            SpeakerConfig::default(),
        );
        (speaker, rx, sink)
    }

    #[test]
    fn timeout_scales_with_text_within_bounds() {
        let config = SpeakerConfig::default();
        assert_eq!(config.timeout_for("Hola"), Duration::from_secs(8));
        assert_eq!(config.timeout_for(&"a".repeat(200)), Duration::from_millis(18_000));
        assert_eq!(config.timeout_for(&"a".repeat(5000)), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_speech_ends_once() {
        let (mut speaker, mut rx, _sink) =
            speaker(Some(Arc::new(InstantRemote)), None, Duration::from_secs(1));
        let id = speaker.speak("Buenos días");

        assert_eq!(rx.recv().await, Some(SpeakerEvent::Started { id }));
        assert_eq!(
            rx.recv().await,
            Some(SpeakerEvent::Ended {
                id,
                reason: SpeechEndReason::Completed
            })
        );
        assert!(!speaker.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_falls_back_with_info_notice() {
        let (mut speaker, mut rx, sink) = speaker(
            Some(Arc::new(FailingRemote)),
            Some(Arc::new(QuickLocal)),
            Duration::from_secs(1),
        );
        let mut notices = sink.subscribe();
        let id = speaker.speak("Hola");

        assert_eq!(rx.recv().await, Some(SpeakerEvent::Started { id }));
        assert_eq!(
            rx.recv().await,
            Some(SpeakerEvent::Ended {
                id,
                reason: SpeechEndReason::Completed
            })
        );
        let Ok(crate::events::CallEvent::Notice { notice }) = notices.recv().await else {
            panic!("expected a notice");
        };
        assert_eq!(notice.severity, crate::events::Severity::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_remote_falls_back_to_on_device_voice() {
        let local = RecordingLocal::default();
        let spoken = Arc::clone(&local.spoken);
        let (mut speaker, mut rx, _sink) = speaker(
            Some(Arc::new(StalledRemote)),
            Some(Arc::new(local)),
            Duration::from_secs(1),
        );
        let started = tokio::time::Instant::now();
        let id = speaker.speak("Hola");

        assert_eq!(rx.recv().await, Some(SpeakerEvent::Started { id }));
        assert_eq!(
            rx.recv().await,
            Some(SpeakerEvent::Ended {
                id,
                reason: SpeechEndReason::Completed
            })
        );
        assert_eq!(*spoken.lock().unwrap(), ["Hola"]);
        // synthesis timeout plus the on-device speech
        assert!(started.elapsed() >= Duration::from_secs(13));
        assert!(started.elapsed() < Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn no_backend_fails() {
        let (mut speaker, mut rx, _sink) = speaker(Some(Arc::new(FailingRemote)), None, Duration::ZERO);
        let id = speaker.speak("Hola");
        rx.recv().await;
        assert_eq!(
            rx.recv().await,
            Some(SpeakerEvent::Ended {
                id,
                reason: SpeechEndReason::Failed
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_speech_supersedes_previous() {
        let (mut speaker, mut rx, _sink) =
            speaker(Some(Arc::new(InstantRemote)), None, Duration::from_secs(5));
        let first = speaker.speak("Primera frase");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = speaker.speak("Segunda frase");

        let mut events = Vec::new();
        while events.len() < 4 {
            events.push(rx.recv().await.unwrap());
        }
        assert!(events.contains(&SpeakerEvent::Ended {
            id: first,
            reason: SpeechEndReason::Superseded
        }));
        assert!(events.contains(&SpeakerEvent::Ended {
            id: second,
            reason: SpeechEndReason::Completed
        }));
        let first_ends = events
            .iter()
            .filter(|e| matches!(e, SpeakerEvent::Ended { id, .. } if *id == first))
            .count();
        assert_eq!(first_ends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_playback_times_out() {
        let (mut speaker, mut rx, _sink) =
            speaker(Some(Arc::new(InstantRemote)), None, Duration::from_secs(600));
        let id = speaker.speak("Hola");
        rx.recv().await;
        assert_eq!(
            rx.recv().await,
            Some(SpeakerEvent::Ended {
                id,
                reason: SpeechEndReason::TimedOut
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_immediately() {
        let (mut speaker, mut rx, _sink) =
            speaker(Some(Arc::new(InstantRemote)), None, Duration::from_secs(30));
        let id = speaker.speak("Hola");
        speaker.stop();
        assert_eq!(rx.recv().await, Some(SpeakerEvent::Started { id }));
        assert_eq!(
            rx.recv().await,
            Some(SpeakerEvent::Ended {
                id,
                reason: SpeechEndReason::Stopped
            })
        );
    }
}
