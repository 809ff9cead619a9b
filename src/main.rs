use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use ethos_voice::conversation::{
    ChatCompletionsGenerator, ChatFeedbackGenerator, FeedbackGenerator, RequestChannel,
};
use ethos_voice::realtime::{
    PcmOutput, RealtimeLink, RealtimeMicrophone, RealtimeTransport, WebSocketTransport,
};
use ethos_voice::voice::{
    AudioCapture, AudioOutput, AudioPlayback, CommandSynthesizer, LocalSynthesizer,
    PcmStreamPlayer, SegmentingConfig, SegmentingRecognizer, Speaker, SpeechSynthesizer,
    SpeechToText, TextToSpeech, Transcriber, meter_level, recognizer_channel, rms,
};
use ethos_voice::{
    AiChannel, CallEvent, CallHandle, CallSetup, Config, ConversationSession, EventSink,
    SpeakerRole, start_call,
};

/// Ethos - voice practice calls with an AI ethics coach
#[derive(Parser)]
#[command(name = "ethos", version, about)]
struct Cli {
    /// Persona to use (e.g., "coach")
    #[arg(short, long, env = "ETHOS_PERSONA")]
    persona: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice call (default)
    Call {
        /// Ask for written feedback after the call
        #[arg(long)]
        feedback: bool,
    },
    /// Start a voice call over the realtime endpoint
    Realtime {
        /// Ask for written feedback after the call
        #[arg(long)]
        feedback: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hola, esto es una prueba de la voz del coach.")]
        text: String,
    },
    /// Transcribe a WAV file
    Transcribe {
        /// Path to a WAV file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,ethos_voice=info",
        1 => "info,ethos_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let persona = cli.persona.as_deref();

    match cli.command.unwrap_or(Command::Call { feedback: false }) {
        Command::Call { feedback } => call(persona, feedback).await,
        Command::Realtime { feedback } => realtime_call(persona, feedback).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(persona, &text).await,
        Command::Transcribe { path } => transcribe(persona, &path).await,
    }
}

fn openai_key(config: &Config) -> anyhow::Result<String> {
    config
        .api_keys
        .openai
        .clone()
        .context("OPENAI_API_KEY is not set (env or config file)")
}

fn build_transcriber(config: &Config) -> anyhow::Result<Arc<dyn Transcriber>> {
    let language = config.voice.language.clone();
    let stt = if config.voice.stt_provider == "deepgram" {
        let key = config
            .api_keys
            .deepgram
            .clone()
            .context("DEEPGRAM_API_KEY is not set")?;
        SpeechToText::new_deepgram(key, config.voice.stt_model.clone())?
    } else {
        SpeechToText::new_whisper(openai_key(config)?, config.voice.stt_model.clone())?
    };
    Ok(Arc::new(stt.with_language(language)))
}

fn build_synthesizer(config: &Config) -> anyhow::Result<Option<Arc<dyn SpeechSynthesizer>>> {
    let voice = &config.voice;
    let tts = if voice.tts_provider == "elevenlabs" {
        config
            .api_keys
            .elevenlabs
            .clone()
            .map(|key| TextToSpeech::new_elevenlabs(key, voice.tts_voice.clone(), voice.tts_model.clone()))
            .transpose()?
    } else {
        config
            .api_keys
            .openai
            .clone()
            .map(|key| {
                TextToSpeech::new_openai(key, voice.tts_voice.clone(), voice.tts_speed, voice.tts_model.clone())
            })
            .transpose()?
    };
    Ok(tts.map(|t| Arc::new(t) as Arc<dyn SpeechSynthesizer>))
}

async fn call(persona: Option<&str>, feedback: bool) -> anyhow::Result<()> {
    let config = Config::load(persona)?;
    let events = EventSink::new();

    let remote = build_synthesizer(&config)?;
    let local = if config.voice.local_fallback {
        CommandSynthesizer::detect().map(|s| {
            Arc::new(s.with_rate(config.voice.local_words_per_minute())) as Arc<dyn LocalSynthesizer>
        })
    } else {
        None
    };
    if remote.is_none() && local.is_none() {
        anyhow::bail!("no speech synthesizer available: set an API key or install espeak-ng");
    }
    let output: Arc<dyn AudioOutput> = Arc::new(AudioPlayback::new()?);
    let (speaker, speaker_events) =
        Speaker::new(remote, local, output, events.clone(), config.speaker());

    let generator = ChatCompletionsGenerator::new(
        openai_key(&config)?,
        config.llm.model.clone(),
        config.system_prompt(),
    )?
    .with_base_url(&config.llm.base_url);

    let (recognizer_tx, recognizer_events) = recognizer_channel();
    let recognizer = SegmentingRecognizer::new(
        build_transcriber(&config)?,
        recognizer_tx,
        SegmentingConfig::default(),
    );

    let handle = start_call(CallSetup {
        recognizer,
        recognizer_events,
        channel: AiChannel::Request(RequestChannel::new(
            Arc::new(generator),
            speaker,
            speaker_events,
        )),
        fallbacks: config.fallbacks(),
        config: config.coordinator(),
        gate: config.gate(),
        filter: config.filter(),
        restart: config.restart_policy(),
        events,
    })?;

    println!("Calling {}...", config.persona.name());
    let session = drive_call(handle).await?;
    report(&config, &session, feedback).await
}

async fn realtime_call(persona: Option<&str>, feedback: bool) -> anyhow::Result<()> {
    let config = Config::load(persona)?;
    let connection = config.realtime_connection()?;

    let (transport, signals) = WebSocketTransport::connect(&connection).await?;
    tracing::info!(session_id = transport.session_id(), "realtime session open");
    let transport: Arc<dyn RealtimeTransport> = Arc::new(transport);

    let player = match PcmStreamPlayer::start() {
        Ok(player) => Some(Arc::new(player) as Arc<dyn PcmOutput>),
        Err(e) => {
            tracing::warn!(error = %e, "no audio output, continuing with transcripts only");
            None
        }
    };
    let link = RealtimeLink::new(Arc::clone(&transport), signals, player);

    let (recognizer_tx, recognizer_events) = recognizer_channel();
    let recognizer = RealtimeMicrophone::new(transport, recognizer_tx);

    let handle = start_call(CallSetup {
        recognizer,
        recognizer_events,
        channel: AiChannel::Duplex(link),
        fallbacks: config.fallbacks(),
        config: config.coordinator(),
        gate: config.gate(),
        filter: config.filter(),
        restart: config.restart_policy(),
        events: EventSink::new(),
    })?;

    println!("Calling {} (realtime)...", config.persona.name());
    let session = drive_call(handle).await?;
    report(&config, &session, feedback).await
}

/// Relay keyboard commands and print call events until the call ends
async fn drive_call(handle: CallHandle) -> anyhow::Result<ConversationSession> {
    println!("Commands: m = mute/unmute, r = restart microphone, s = status, q = hang up\n");

    let mut events = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut muted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(CallEvent::Ended { .. }) | Err(RecvError::Closed) => break,
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                }
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match line.trim() {
                    "m" => {
                        muted = !muted;
                        handle.set_mute(muted)?;
                        println!("{}", if muted { "Microphone muted" } else { "Microphone on" });
                    }
                    "r" => handle.restart_microphone()?,
                    "s" => {
                        let snapshot = handle.snapshot().await?;
                        println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    }
                    "q" => break,
                    _ => {}
                },
                None => stdin_open = false,
            },
        }
    }

    Ok(handle.end().await?)
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::Transcript { utterance } if !utterance.is_partial => {
            let who = match utterance.role {
                SpeakerRole::User => "You",
                _ => "Coach",
            };
            println!("{who}: {}", utterance.text);
        }
        CallEvent::Notice { notice } => eprintln!("[{:?}] {}", notice.severity, notice.message),
        CallEvent::PhaseChanged { phase, greeting } => {
            tracing::debug!(%phase, greeting, "phase");
        }
        _ => {}
    }
}

async fn report(config: &Config, session: &ConversationSession, feedback: bool) -> anyhow::Result<()> {
    if let Some(outcome) = &session.outcome {
        println!(
            "\nCall ended ({:?}) after {}s: {} turns, score {}/100",
            session.end_reason,
            outcome.duration_secs,
            outcome.user_turns,
            outcome.score
        );
    }

    if !feedback {
        return Ok(());
    }

    let generator = ChatFeedbackGenerator::new(openai_key(config)?, config.llm.feedback_model.clone())?
        .with_base_url(&config.llm.base_url);
    match generator.summarize(session.transcript.utterances()).await {
        Ok(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        Err(e) => eprintln!("Feedback unavailable: {e}"),
    }
    Ok(())
}

async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let level = meter_level(&samples);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 50.0) as usize;
        let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len.min(50));

        println!("[{:2}s] RMS: {:.4} | [{}]", i + 1, rms(&samples), meter);
    }

    capture.stop();

    println!("\n---");
    println!("If the meter moved, your microphone works.");
    println!("If it stayed empty, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::new()?;

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    tokio::task::spawn_blocking(move || playback.play_blocking(samples, &AtomicBool::new(false)))
        .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers work.");
    println!("If not, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

async fn test_tts(persona: Option<&str>, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(persona)?;
    let synthesizer =
        build_synthesizer(&config)?.context("no remote voice configured (set an API key)")?;

    println!("Synthesizing speech...");
    let mp3 = synthesizer
        .synthesize(text, Some(&config.voice.tts_voice))
        .await?;
    println!("Got {} bytes of audio data", mp3.len());

    println!("Playing audio...");
    AudioPlayback::new()?
        .play_mp3(mp3, Arc::new(AtomicBool::new(false)))
        .await?;

    println!("\n---");
    println!("If you heard the speech, TTS works.");

    Ok(())
}

async fn transcribe(persona: Option<&str>, path: &std::path::Path) -> anyhow::Result<()> {
    let config = Config::load(persona)?;
    let audio = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let text = build_transcriber(&config)?.transcribe(&audio).await?;
    println!("{text}");
    Ok(())
}
