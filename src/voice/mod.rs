//! Voice processing module
//!
//! Microphone capture and recognition on the input side, the microphone
//! gate in the middle, and synthesis plus playback on the output side.

pub mod backoff;
mod capture;
pub mod filter;
pub mod gate;
pub mod listener;
pub mod local_tts;
pub mod playback;
pub mod recognizer;
mod segmenter;
pub mod speaker;
pub mod stt;
pub mod tts;

pub use backoff::RestartPolicy;
pub use capture::{
    AudioCapture, SAMPLE_RATE, input_available, meter_level, rms, samples_to_pcm16, samples_to_wav,
};
pub use filter::FilterConfig;
pub use gate::{GateConfig, GateTimer, Heard, ManualScheduler, MicrophoneGate, MicrophoneState, Scheduler, TokioScheduler};
pub use listener::{ErrorClass, SpeechCapture};
pub use local_tts::{
    CommandSynthesizer, DEFAULT_WORDS_PER_MINUTE, LocalSpeechEvent, LocalSynthesizer,
};
pub use playback::{AudioOutput, AudioPlayback, PcmStreamPlayer};
pub use recognizer::{
    RecognitionErrorKind, RecognizerEvent, RecognizerEvents, SegmentingConfig,
    SegmentingRecognizer, SpeechRecognizer, StartError, recognizer_channel,
};
pub use segmenter::{SegmenterConfig, SegmenterState, SpeechSegmenter};
pub use speaker::{Speaker, SpeakerConfig, SpeakerEvent, SpeechEndReason, SpeechId};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{SpeechSynthesizer, TextToSpeech};
