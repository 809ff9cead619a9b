//! Energy-based speech segmentation
//!
//! Splits a live sample stream into utterance-sized chunks for batch
//! transcription: speech starts when frame energy crosses a threshold and a
//! segment completes after enough trailing silence.

use super::capture::rms;

/// Segmentation thresholds (sample counts at the capture rate)
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Minimum RMS energy to consider a frame speech
    pub energy_threshold: f32,
    /// Minimum buffered samples for a segment to count
    pub min_speech_samples: usize,
    /// Trailing silence that closes a segment
    pub silence_samples: usize,
    /// Longest segment before it is force-closed
    pub max_segment_samples: usize,
}

impl SegmenterConfig {
    /// Defaults for a given sample rate: 0.3s minimum speech, 0.7s closing
    /// silence, 30s maximum segment
    #[must_use]
    pub const fn for_sample_rate(sample_rate: u32) -> Self {
        let per_ms = sample_rate as usize / 1000;
        Self {
            energy_threshold: 0.02,
            min_speech_samples: 300 * per_ms,
            silence_samples: 700 * per_ms,
            max_segment_samples: 30_000 * per_ms,
        }
    }
}

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Inside a speech segment
    Speaking,
}

/// Accumulates speech and reports completed segments
pub struct SpeechSegmenter {
    config: SegmenterConfig,
    state: SegmenterState,
    buffer: Vec<f32>,
    silence: usize,
}

impl SpeechSegmenter {
    /// Create a segmenter
    #[must_use]
    pub const fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            state: SegmenterState::Idle,
            buffer: Vec::new(),
            silence: 0,
        }
    }

    /// Feed samples; returns a completed segment when one closes
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = rms(samples);
        let is_speech = energy > self.config.energy_threshold;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.silence = 0;
                    tracing::trace!(energy, "speech detected");
                }
                None
            }
            SegmenterState::Speaking => {
                self.buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                let closed_by_silence = self.silence > self.config.silence_samples;
                let too_long = self.buffer.len() >= self.config.max_segment_samples;

                if closed_by_silence || too_long {
                    let speech_len = self.buffer.len().saturating_sub(self.silence);
                    let segment = std::mem::take(&mut self.buffer);
                    self.reset();

                    if speech_len >= self.config.min_speech_samples {
                        tracing::debug!(samples = segment.len(), "speech segment complete");
                        return Some(segment);
                    }
                    tracing::trace!(samples = speech_len, "segment too short, discarded");
                }
                None
            }
        }
    }

    /// Drop any partial segment
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.buffer.clear();
        self.silence = 0;
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// Samples buffered in the current segment
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
