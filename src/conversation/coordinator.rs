//! Turn coordinator
//!
//! One actor task per call. Every input (user commands, recognizer events,
//! gate timers, AI replies, speaker lifecycle, realtime signals, the call
//! deadline) lands in a single `select!` loop and is handled to completion
//! before the next one, so phase transitions never interleave.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::channel::{AiChannel, FallbackResponses, ResponseGenerator};
use super::outcome::SessionOutcome;
use super::phase::TurnPhase;
use super::session::ConversationSession;
use crate::events::{CallEvent, EndReason, EventSink, Notice};
use crate::realtime::{ClientEvent, RealtimeSignal};
use crate::transcript::{SpeakerRole, Utterance};
use crate::voice::{
    ErrorClass, FilterConfig, GateConfig, GateTimer, Heard, MicrophoneGate, MicrophoneState,
    RecognizerEvent, RestartPolicy, SpeakerEvent, SpeechCapture, SpeechId, SpeechRecognizer,
    StartError, TokioScheduler,
};
use crate::{Error, Result};

/// Longest wait for the realtime link to close once the call is over
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Call timing and opening line
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Minimum pause between the user's final words and the AI request
    pub think_delay: Duration,
    /// Longest wait for an AI reply before falling back
    pub response_timeout: Duration,
    /// Longest a remote reply may keep the turn once it started speaking
    pub speaking_timeout: Duration,
    /// Total call budget
    pub call_limit: Duration,
    /// Opening line spoken by the coach
    pub greeting: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            think_delay: Duration::from_millis(1500),
            response_timeout: Duration::from_secs(20),
            speaking_timeout: Duration::from_secs(60),
            call_limit: Duration::from_secs(300),
            greeting: None,
        }
    }
}

/// Everything one call needs; services are passed in, never global
pub struct CallSetup<R: SpeechRecognizer> {
    pub recognizer: R,
    pub recognizer_events: mpsc::UnboundedReceiver<RecognizerEvent>,
    pub channel: AiChannel,
    pub fallbacks: FallbackResponses,
    pub config: CoordinatorConfig,
    pub gate: GateConfig,
    pub filter: FilterConfig,
    pub restart: RestartPolicy,
    pub events: EventSink,
}

/// Point-in-time view of a running call
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub phase: TurnPhase,
    pub greeting: bool,
    pub microphone: MicrophoneState,
    pub microphone_suspended: bool,
    pub transcript: Vec<Utterance>,
}

enum Command {
    SetMute(bool),
    RestartMicrophone,
    Snapshot(oneshot::Sender<CallSnapshot>),
    End,
}

/// Control surface of a running call
pub struct CallHandle {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    events: EventSink,
    task: JoinHandle<ConversationSession>,
}

impl CallHandle {
    /// Session identifier
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Flip the user's mute switch
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallEnded`] if the call is over
    pub fn set_mute(&self, muted: bool) -> Result<()> {
        self.send(Command::SetMute(muted))
    }

    /// Restart the microphone after errors suspended it
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallEnded`] if the call is over
    pub fn restart_microphone(&self) -> Result<()> {
        self.send(Command::RestartMicrophone)
    }

    /// Current call state
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallEnded`] if the call is over
    pub async fn snapshot(&self) -> Result<CallSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| Error::CallEnded)
    }

    /// Whether the call has finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Hang up and collect the finished session
    ///
    /// # Errors
    ///
    /// Returns error if the call task panicked
    pub async fn end(self) -> Result<ConversationSession> {
        let _ = self.commands.send(Command::End);
        self.wait().await
    }

    /// Wait for the call to end on its own (time limit, fatal error)
    ///
    /// # Errors
    ///
    /// Returns error if the call task panicked
    pub async fn wait(self) -> Result<ConversationSession> {
        self.task
            .await
            .map_err(|e| Error::Agent(format!("call task failed: {e}")))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::CallEnded)
    }
}

/// Start a call
///
/// # Errors
///
/// Returns [`Error::UnsupportedPlatform`] or [`Error::InsecureContext`] when
/// speech capture cannot run here; the call is not started
pub fn start_call<R>(setup: CallSetup<R>) -> Result<CallHandle>
where
    R: SpeechRecognizer + 'static,
{
    let CallSetup {
        recognizer,
        recognizer_events,
        channel,
        fallbacks,
        config,
        gate,
        filter,
        restart,
        events,
    } = setup;

    let (scheduler, timers) = TokioScheduler::channel();
    let capture = SpeechCapture::new(recognizer, filter, restart);
    let gate = MicrophoneGate::new(capture, gate, Box::new(scheduler), events.clone());

    if let Err(e) = gate.check_support() {
        events.notice(Notice::error(
            ErrorClass::UnsupportedPlatform,
            format!("Speech recognition is not available: {e}"),
        ));
        return Err(match e {
            StartError::InsecureContext(reason) => Error::InsecureContext(reason),
            other => Error::UnsupportedPlatform(other.to_string()),
        });
    }

    let session = ConversationSession::new();
    let session_id = session.id;
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (replies_tx, replies) = mpsc::unbounded_channel();

    let call = Call {
        session,
        phase: TurnPhase::Idle,
        greeting: false,
        gate,
        channel,
        fallbacks,
        config,
        events: events.clone(),
        commands,
        recognizer_events,
        timers,
        replies_tx,
        replies,
        next_request: 0,
        pending: None,
        current_speech: None,
        remote_speaking: false,
        fallback_replies: 0,
        started: Instant::now(),
    };

    tracing::info!(session_id = %session_id, "starting call");
    let task = tokio::spawn(call.run());

    Ok(CallHandle {
        session_id,
        commands: commands_tx,
        events,
        task,
    })
}

struct AiReply {
    token: Uuid,
    request_id: u64,
    result: Result<String>,
}

struct PendingRequest {
    id: u64,
    task: JoinHandle<()>,
}

enum ChannelEvent {
    Speaker(SpeakerEvent),
    Realtime(RealtimeSignal),
}

async fn next_channel_event(channel: &mut AiChannel) -> ChannelEvent {
    match channel {
        AiChannel::Request(request) => match request.speaker_events.recv().await {
            Some(event) => ChannelEvent::Speaker(event),
            None => std::future::pending().await,
        },
        AiChannel::Duplex(link) => match link.next_signal().await {
            Some(signal) => ChannelEvent::Realtime(signal),
            None => std::future::pending().await,
        },
    }
}

struct Call<R: SpeechRecognizer> {
    session: ConversationSession,
    phase: TurnPhase,
    greeting: bool,
    gate: MicrophoneGate<R>,
    channel: AiChannel,
    fallbacks: FallbackResponses,
    config: CoordinatorConfig,
    events: EventSink,
    commands: mpsc::UnboundedReceiver<Command>,
    recognizer_events: mpsc::UnboundedReceiver<RecognizerEvent>,
    timers: mpsc::UnboundedReceiver<GateTimer>,
    replies_tx: mpsc::UnboundedSender<AiReply>,
    replies: mpsc::UnboundedReceiver<AiReply>,
    next_request: u64,
    pending: Option<PendingRequest>,
    current_speech: Option<SpeechId>,
    remote_speaking: bool,
    fallback_replies: u32,
    started: Instant,
}

impl<R: SpeechRecognizer> Call<R> {
    async fn run(mut self) -> ConversationSession {
        let deadline = tokio::time::sleep(self.config.call_limit);
        tokio::pin!(deadline);

        self.open().await;

        while self.phase != TurnPhase::Ended {
            tokio::select! {
                biased;

                () = &mut deadline => {
                    tracing::info!(phase = %self.phase, "call time limit reached");
                    self.end(EndReason::TimeLimit).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::SetMute(muted)) => self.gate.set_manual_mute(muted),
                    Some(Command::RestartMicrophone) => self.gate.manual_restart(),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::End) | None => self.end(EndReason::Hangup).await,
                },
                Some(timer) = self.timers.recv() => self.gate.on_timer(timer),
                Some(reply) = self.replies.recv() => self.on_reply(reply).await,
                Some(event) = self.recognizer_events.recv() => self.on_recognizer(event).await,
                event = next_channel_event(&mut self.channel) => match event {
                    ChannelEvent::Speaker(event) => self.on_speaker(event),
                    ChannelEvent::Realtime(signal) => self.on_realtime(signal).await,
                },
            }
        }

        tracing::info!(
            session_id = %self.session.id,
            utterances = self.session.transcript.len(),
            score = self.session.outcome.as_ref().map_or(0, |o| o.score),
            "call ended"
        );
        self.session
    }

    /// Opening greeting; the microphone stays blocked until it ends
    async fn open(&mut self) {
        let greeting = self
            .config
            .greeting
            .clone()
            .filter(|g| !g.trim().is_empty());

        let Some(greeting) = greeting else {
            self.set_phase(TurnPhase::UserTurn);
            self.gate.unblock_after_ai();
            return;
        };

        self.gate.block_for_ai();
        self.greeting = true;
        self.set_phase(TurnPhase::AiSpeaking);

        match &mut self.channel {
            AiChannel::Request(request) => {
                self.current_speech = Some(request.speaker.speak(&greeting));
                self.append(SpeakerRole::Assistant, &greeting);
            }
            AiChannel::Duplex(link) => {
                let instructions = format!("Greet the learner by saying exactly: {greeting}");
                let sent = link
                    .send(ClientEvent::CreateResponse {
                        instructions: Some(instructions),
                    })
                    .await;
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "could not request greeting");
                    self.finish_ai_turn();
                } else {
                    self.arm_watchdog(self.config.response_timeout);
                }
            }
        }
    }

    async fn on_recognizer(&mut self, event: RecognizerEvent) {
        let Some(heard) = self.gate.on_engine_event(event) else {
            return;
        };

        match heard {
            Heard::Interim(text) => {
                if self.phase == TurnPhase::UserTurn {
                    self.session
                        .transcript
                        .update_partial(SpeakerRole::User, &text, None);
                    self.publish_partial(SpeakerRole::User);
                }
            }
            Heard::Final { text, confidence } => {
                if self.phase == TurnPhase::UserTurn {
                    self.on_user_final(&text, confidence);
                } else {
                    tracing::debug!(phase = %self.phase, "final transcript outside the user turn ignored");
                }
            }
            Heard::Fatal { class, message } => {
                tracing::error!(?class, reason = %message, "fatal capture error, ending call");
                self.end(EndReason::Fatal).await;
            }
        }
    }

    fn on_user_final(&mut self, text: &str, confidence: Option<f32>) {
        let Some(utterance) = self
            .session
            .transcript
            .finalize(SpeakerRole::User, Some(text), confidence)
            .cloned()
        else {
            return;
        };
        self.events.publish(CallEvent::Transcript { utterance });

        self.gate.block_for_ai();
        self.set_phase(TurnPhase::AiThinking);

        let AiChannel::Request(request) = &self.channel else {
            // The remote side answers on its own; only watch for silence
            self.arm_watchdog(self.config.response_timeout);
            return;
        };

        self.next_request += 1;
        let request_id = self.next_request;
        let token = self.session.session_token;
        let replies = self.replies_tx.clone();
        let timeout = self.config.response_timeout;
        let generator = Arc::clone(&request.generator);
        let utterances = self.session.transcript.utterances();
        let history = utterances[..utterances.len().saturating_sub(1)].to_vec();
        let message = text.to_string();
        let think = self.config.think_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(think).await;
            let result = request_reply(&*generator, &history, &message, timeout).await;
            let _ = replies.send(AiReply {
                token,
                request_id,
                result,
            });
        });
        self.replace_pending(request_id, task);
    }

    /// Give the remote coach `after` to make progress before its response is cancelled
    fn arm_watchdog(&mut self, after: Duration) {
        self.next_request += 1;
        let request_id = self.next_request;
        let token = self.session.session_token;
        let replies = self.replies_tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = replies.send(AiReply {
                token,
                request_id,
                result: Err(Error::Timeout("no realtime progress".to_string())),
            });
        });
        self.replace_pending(request_id, task);
    }

    fn replace_pending(&mut self, id: u64, task: JoinHandle<()>) {
        if let Some(previous) = self.pending.replace(PendingRequest { id, task }) {
            previous.task.abort();
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }

    async fn on_reply(&mut self, reply: AiReply) {
        let current = self.pending.as_ref().map(|p| p.id);
        if reply.token != self.session.session_token
            || current != Some(reply.request_id)
            || !self.phase.blocks_microphone()
        {
            tracing::debug!(request_id = reply.request_id, "ignoring stale AI reply");
            return;
        }
        self.pending = None;

        match &mut self.channel {
            AiChannel::Request(request) => {
                let text = match reply.result {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "AI reply failed, using fallback");
                        self.fallback_replies += 1;
                        self.events.notice(Notice::warning(
                            ErrorClass::ProviderFailure,
                            "The coach had trouble answering",
                        ));
                        self.fallbacks.pick().to_string()
                    }
                };

                self.current_speech = Some(request.speaker.speak(&text));
                self.append(SpeakerRole::Assistant, &text);
                self.set_phase(TurnPhase::AiSpeaking);
            }
            AiChannel::Duplex(link) => {
                tracing::warn!(phase = %self.phase, "realtime response stalled, cancelling");
                link.stop_audio();
                let _ = link.send(ClientEvent::CancelResponse).await;
                self.finalize_assistant();
                self.events.notice(Notice::warning(
                    ErrorClass::ProviderFailure,
                    "The coach did not answer, go ahead and try again",
                ));
                self.finish_ai_turn();
            }
        }
    }

    fn on_speaker(&mut self, event: SpeakerEvent) {
        match event {
            SpeakerEvent::Started { id } => tracing::debug!(id, "coach speaking"),
            SpeakerEvent::Ended { id, reason } => {
                if self.current_speech != Some(id) {
                    tracing::trace!(id, ?reason, "end of an earlier speech ignored");
                    return;
                }
                tracing::debug!(id, ?reason, "coach finished speaking");
                self.current_speech = None;
                if self.phase == TurnPhase::AiSpeaking {
                    self.finish_ai_turn();
                }
            }
        }
    }

    async fn on_realtime(&mut self, signal: RealtimeSignal) {
        match signal {
            RealtimeSignal::SessionReady => tracing::debug!("realtime session ready"),
            RealtimeSignal::UserSpeechStarted | RealtimeSignal::UserSpeechStopped => {
                tracing::trace!(?signal, "remote voice activity");
            }
            RealtimeSignal::UserTranscriptDelta(delta) => {
                if self.phase == TurnPhase::UserTurn && self.gate.state().is_capturing {
                    self.session
                        .transcript
                        .extend_partial(SpeakerRole::User, &delta);
                    self.publish_partial(SpeakerRole::User);
                }
            }
            RealtimeSignal::UserTranscript(text) => {
                if self.phase != TurnPhase::UserTurn {
                    // The reply overtook the transcription of the words it answers
                    if self.session.transcript.partial(SpeakerRole::User).is_some() {
                        let finalized = self
                            .session
                            .transcript
                            .finalize(SpeakerRole::User, Some(&text), None)
                            .cloned();
                        if let Some(utterance) = finalized {
                            self.events.publish(CallEvent::Transcript { utterance });
                        }
                    }
                    return;
                }

                let heard = self.gate.on_engine_event(RecognizerEvent::Final {
                    text,
                    confidence: None,
                });
                if let Some(Heard::Final { text, confidence }) = heard {
                    self.on_user_final(&text, confidence);
                } else {
                    self.session.transcript.discard_partial(SpeakerRole::User);
                }
            }
            RealtimeSignal::AssistantTranscriptDelta(delta) => {
                self.begin_remote_speech();
                self.session
                    .transcript
                    .extend_partial(SpeakerRole::Assistant, &delta);
                self.publish_partial(SpeakerRole::Assistant);
            }
            RealtimeSignal::AssistantSpeakingStarted => self.begin_remote_speech(),
            RealtimeSignal::AssistantAudio(_) | RealtimeSignal::AssistantSpeakingStopped => {}
            RealtimeSignal::ResponseDone => {
                self.finalize_assistant();
                if self.phase.blocks_microphone() {
                    self.cancel_pending();
                    self.finish_ai_turn();
                }
            }
            RealtimeSignal::Error(message) => {
                self.events.notice(Notice::warning(
                    ErrorClass::ProviderFailure,
                    format!("Realtime service error: {message}"),
                ));
            }
            RealtimeSignal::Closed => {
                tracing::warn!("realtime link closed");
                self.end(EndReason::ChannelClosed).await;
            }
        }
    }

    /// The remote coach started answering
    fn begin_remote_speech(&mut self) {
        if self.remote_speaking {
            return;
        }
        self.remote_speaking = true;
        self.arm_watchdog(self.config.speaking_timeout);
        if self.phase != TurnPhase::AiSpeaking {
            self.gate.block_for_ai();
            self.set_phase(TurnPhase::AiSpeaking);
        }
    }

    fn finalize_assistant(&mut self) {
        if let Some(utterance) = self
            .session
            .transcript
            .finalize(SpeakerRole::Assistant, None, None)
            .cloned()
        {
            self.events.publish(CallEvent::Transcript { utterance });
        }
    }

    /// Hand the turn back to the user
    fn finish_ai_turn(&mut self) {
        self.remote_speaking = false;
        self.greeting = false;
        self.set_phase(TurnPhase::UserTurn);
        self.gate.unblock_after_ai();
    }

    async fn end(&mut self, reason: EndReason) {
        if self.phase == TurnPhase::Ended {
            return;
        }

        self.cancel_pending();
        // Hardware first; closing the link may stall on a dead socket
        self.gate.release();
        match &mut self.channel {
            AiChannel::Request(request) => request.speaker.stop(),
            AiChannel::Duplex(link) => {
                if tokio::time::timeout(LINK_CLOSE_TIMEOUT, link.close())
                    .await
                    .is_err()
                {
                    tracing::warn!("realtime link did not close in time");
                }
            }
        }
        self.current_speech = None;

        let transcript = &mut self.session.transcript;
        transcript.discard_partial(SpeakerRole::User);
        transcript.discard_partial(SpeakerRole::Assistant);

        let outcome =
            SessionOutcome::compute(transcript, self.fallback_replies, self.started.elapsed());
        self.session.finish(reason, outcome.clone());
        self.greeting = false;
        self.set_phase(TurnPhase::Ended);
        self.events.publish(CallEvent::Ended { reason, outcome });
    }

    fn append(&mut self, role: SpeakerRole, text: &str) {
        if let Some(utterance) = self.session.transcript.append_final(role, text).cloned() {
            self.events.publish(CallEvent::Transcript { utterance });
        }
    }

    fn publish_partial(&self, role: SpeakerRole) {
        if let Some(utterance) = self.session.transcript.partial(role) {
            self.events.publish(CallEvent::Transcript {
                utterance: utterance.clone(),
            });
        }
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        if self.phase == phase {
            return;
        }
        tracing::info!(from = %self.phase, to = %phase, greeting = self.greeting, "turn phase");
        self.phase = phase;
        self.events.publish(CallEvent::PhaseChanged {
            phase,
            greeting: self.greeting,
        });
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase,
            greeting: self.greeting,
            microphone: self.gate.state(),
            microphone_suspended: self.gate.is_suspended(),
            transcript: self.session.transcript.snapshot(),
        }
    }
}

async fn request_reply(
    generator: &dyn ResponseGenerator,
    history: &[Utterance],
    message: &str,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, generator.generate(history, message)).await {
        Ok(Ok(text)) if !text.trim().is_empty() => Ok(text),
        Ok(Ok(_)) => Err(Error::Agent("empty reply".to_string())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout("AI reply".to_string())),
    }
}
