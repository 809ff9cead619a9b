//! On-device speech synthesis fallback

use std::path::PathBuf;
use std::process::Stdio;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::process::{Child, Command};

/// Progress of one on-device utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSpeechEvent {
    Started,
    Finished,
    Failed(String),
}

/// On-device synthesis collaborator
///
/// Dropping the returned stream cancels the utterance.
pub trait LocalSynthesizer: Send + Sync {
    fn speak(&self, text: &str, locale: Option<&str>) -> BoxStream<'static, LocalSpeechEvent>;
}

/// Speaking rate of the system voices at 1.0x
pub const DEFAULT_WORDS_PER_MINUTE: u32 = 165;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    EspeakNg,
    Espeak,
    Say,
}

/// Speaks through a system TTS command (`espeak-ng`, `espeak` or `say`)
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: PathBuf,
    engine: Engine,
    words_per_minute: u32,
}

impl CommandSynthesizer {
    /// Find an installed synthesis command
    #[must_use]
    pub fn detect() -> Option<Self> {
        [
            ("espeak-ng", Engine::EspeakNg),
            ("espeak", Engine::Espeak),
            ("say", Engine::Say),
        ]
        .into_iter()
        .find_map(|(name, engine)| {
            which::which(name).ok().map(|program| {
                tracing::debug!(program = %program.display(), "on-device synthesis available");
                Self {
                    program,
                    engine,
                    words_per_minute: DEFAULT_WORDS_PER_MINUTE,
                }
            })
        })
    }

    /// Override speaking rate
    #[must_use]
    pub const fn with_rate(mut self, words_per_minute: u32) -> Self {
        self.words_per_minute = words_per_minute;
        self
    }

    fn args(&self, text: &str, locale: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();
        match self.engine {
            Engine::EspeakNg | Engine::Espeak => {
                if let Some(language) = locale.and_then(|l| l.split(['-', '_']).next()) {
                    if !language.is_empty() {
                        args.push("-v".to_string());
                        args.push(language.to_lowercase());
                    }
                }
                args.push("-s".to_string());
                args.push(self.words_per_minute.to_string());
            }
            Engine::Say => {
                args.push("-r".to_string());
                args.push(self.words_per_minute.to_string());
            }
        }
        args.push("--".to_string());
        args.push(text.to_string());
        args
    }
}

enum Step {
    Spawn(Command),
    Running(Child),
    Done,
}

impl LocalSynthesizer for CommandSynthesizer {
    fn speak(&self, text: &str, locale: Option<&str>) -> BoxStream<'static, LocalSpeechEvent> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(text, locale))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        stream::unfold(Step::Spawn(command), |step| async move {
            match step {
                Step::Spawn(mut command) => match command.spawn() {
                    Ok(child) => Some((LocalSpeechEvent::Started, Step::Running(child))),
                    Err(e) => Some((LocalSpeechEvent::Failed(e.to_string()), Step::Done)),
                },
                Step::Running(mut child) => match child.wait().await {
                    Ok(status) if status.success() => Some((LocalSpeechEvent::Finished, Step::Done)),
                    Ok(status) => Some((
                        LocalSpeechEvent::Failed(format!("synthesis exited with {status}")),
                        Step::Done,
                    )),
                    Err(e) => Some((LocalSpeechEvent::Failed(e.to_string()), Step::Done)),
                },
                Step::Done => None,
            }
        })
        .boxed()
    }
}
