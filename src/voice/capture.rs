//! Microphone input and sample conversions
//!
//! [`AudioCapture`] holds an open input device. The cpal callback appends
//! mono `f32` frames to a shared queue that the owning thread drains with
//! [`AudioCapture::take_buffer`].

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Rate the batch recognizer expects
pub const SAMPLE_RATE: u32 = 16000;

/// Meter gain applied to RMS before clamping
const METER_GAIN: f32 = 4.0;

type FrameQueue = Arc<Mutex<Vec<f32>>>;

/// Whether the default host exposes an input device
#[must_use]
pub fn input_available() -> bool {
    cpal::default_host().default_input_device().is_some()
}

/// An opened microphone
///
/// Not `Send`: build, drain and drop it on one thread. The device is released
/// when the value is dropped.
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    frames: FrameQueue,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default microphone at [`SAMPLE_RATE`]
    ///
    /// # Errors
    ///
    /// Returns error if there is no input device or it cannot record mono
    /// at that rate
    pub fn new() -> Result<Self> {
        Self::with_sample_rate(SAMPLE_RATE)
    }

    /// Open the default microphone for mono audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if there is no input device or it cannot record mono
    /// at that rate
    pub fn with_sample_rate(sample_rate: u32) -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;
        let config = mono_config(&device, sample_rate)?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            "microphone opened"
        );

        Ok(Self {
            device,
            config,
            frames: FrameQueue::default(),
            stream: None,
        })
    }

    /// Begin recording; a no-op while already recording
    ///
    /// # Errors
    ///
    /// Returns error if the input stream cannot be built or played
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let frames = Arc::clone(&self.frames);
        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut queue) = frames.lock() {
                        queue.extend_from_slice(data);
                    }
                },
                |err| tracing::error!(error = %err, "microphone stream error"),
                None,
            )
            .map_err(stream_error)?;
        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        self.stream = Some(stream);
        tracing::debug!("microphone recording");
        Ok(())
    }

    /// Stop recording; queued frames stay available
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("microphone stopped");
        }
    }

    /// Drain every frame recorded since the last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.frames
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default()
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn mono_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|range| {
            range.channels() == 1
                && range.min_sample_rate() <= rate
                && rate <= range.max_sample_rate()
        })
        .map(|range| range.with_sample_rate(rate).config())
        .ok_or_else(|| Error::Audio(format!("microphone cannot record mono at {sample_rate} Hz")))
}

fn stream_error(e: BuildStreamError) -> Error {
    match e {
        BuildStreamError::DeviceNotAvailable => Error::DeviceUnavailable(e.to_string()),
        other => Error::Audio(other.to_string()),
    }
}

/// Root-mean-square energy of a sample block
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Map RMS energy onto a 0..=1 meter level
#[must_use]
pub fn meter_level(samples: &[f32]) -> f32 {
    (rms(samples) * METER_GAIN).clamp(0.0, 1.0)
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * f32::from(i16::MAX)).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Little-endian PCM16 bytes, as the realtime endpoint takes them
#[must_use]
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|&s| to_i16(s).to_le_bytes()).collect()
}

/// A mono 16-bit WAV file for upload to a transcription API
///
/// # Errors
///
/// Returns error if the WAV writer fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_error = |e: hound::Error| Error::Audio(e.to_string());

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
    let count = u32::try_from(samples.len())
        .map_err(|_| Error::Audio("too many samples for one WAV file".to_string()))?;
    let mut pcm = writer.get_i16_writer(count);
    for &sample in samples {
        pcm.write_sample(to_i16(sample));
    }
    pcm.flush().map_err(wav_error)?;
    writer.finalize().map_err(wav_error)?;

    Ok(cursor.into_inner())
}
