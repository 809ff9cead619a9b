//! Audio playback to speakers

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for playback (OpenAI TTS and realtime audio)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Speaker output collaborator
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play encoded MP3 audio until finished or `cancel` is set
    async fn play_mp3(&self, mp3: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()>;
}

/// Plays audio to the default output device
#[derive(Debug, Clone)]
pub struct AudioPlayback {
    config: StreamConfig,
}

impl AudioPlayback {
    /// Create a new audio playback instance
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the playback rate
    pub fn new() -> Result<Self> {
        let config = output_config()?;
        Ok(Self { config })
    }

    /// Play mono samples at [`PLAYBACK_SAMPLE_RATE`], blocking the thread
    ///
    /// # Errors
    ///
    /// Returns error if the output stream cannot be built
    pub fn play_blocking(&self, samples: Vec<f32>, cancel: &AtomicBool) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device".to_string()))?;

        let channels = self.config.channels as usize;
        let sample_count = samples.len();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_writer = Arc::clone(&finished);
        let mut position = 0usize;

        let stream = device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(position).copied().unwrap_or_else(|| {
                            finished_writer.store(true, Ordering::Release);
                            0.0
                        });
                        frame.fill(sample);
                        position = (position + 1).min(sample_count);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
        let timeout = Duration::from_millis(duration_ms + 500);
        let start = Instant::now();

        while !finished.load(Ordering::Acquire) && !cancel.load(Ordering::Acquire) {
            if start.elapsed() > timeout {
                tracing::warn!("playback did not report completion");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        if cancel.load(Ordering::Acquire) {
            tracing::debug!("playback cancelled");
        } else {
            // Let the device drain its last buffer
            std::thread::sleep(Duration::from_millis(100));
            tracing::debug!(samples = sample_count, "playback complete");
        }

        drop(stream);
        Ok(())
    }
}

#[async_trait]
impl AudioOutput for AudioPlayback {
    async fn play_mp3(&self, mp3: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()> {
        let player = self.clone();
        tokio::task::spawn_blocking(move || {
            let (samples, rate) = decode_mp3(&mp3)?;
            let samples = resample_linear(&samples, rate, PLAYBACK_SAMPLE_RATE);
            player.play_blocking(samples, &cancel)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

/// Continuous PCM16 player for streamed realtime audio
///
/// Owns an output stream on a dedicated thread; chunks are queued and
/// played in order. [`clear`](Self::clear) drops whatever has not been
/// played yet.
pub struct PcmStreamPlayer {
    queue: Arc<Mutex<VecDeque<f32>>>,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl PcmStreamPlayer {
    /// Open the output device and start the stream thread
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the playback rate
    pub fn start() -> Result<Self> {
        let config = output_config()?;
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("pcm-playback".to_string())
                .spawn(move || {
                    if let Err(e) = run_stream(&config, &queue, &stop) {
                        tracing::error!(error = %e, "streaming playback failed");
                    }
                })?
        };

        Ok(Self {
            queue,
            stop,
            worker: Some(worker),
        })
    }

    /// Queue little-endian PCM16 mono audio at [`PLAYBACK_SAMPLE_RATE`]
    pub fn push_pcm16(&self, bytes: &[u8]) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        queue.extend(
            bytes
                .chunks_exact(2)
                .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
        );
    }

    /// Drop queued audio
    pub fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    /// Whether all queued audio has been played
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }
}

impl Drop for PcmStreamPlayer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_stream(
    config: &StreamConfig,
    queue: &Arc<Mutex<VecDeque<f32>>>,
    stop: &AtomicBool,
) -> Result<()> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device".to_string()))?;
    let channels = config.channels as usize;
    let reader = Arc::clone(queue);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = reader.lock().ok();
                for frame in data.chunks_mut(channels) {
                    let sample = queue.as_mut().and_then(|q| q.pop_front()).unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;
    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

fn output_config() -> Result<StreamConfig> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
            && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
    };

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| c.channels() == 1 && supports_rate(c))
        .or_else(|| {
            device
                .supported_output_configs()
                .ok()?
                .find(|c| c.channels() == 2 && supports_rate(c))
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels = config.channels,
        "audio output initialized"
    );
    Ok(config)
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns error on corrupt data or when no audio frame is present
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate.get_or_insert(u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE));
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    let sample_rate =
        sample_rate.ok_or_else(|| Error::Audio("MP3 payload contained no audio".to_string()))?;
    Ok((samples, sample_rate))
}

/// Linear-interpolation resampling
#[must_use]
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(from) / f64::from(to);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let out_len = (samples.len() as f64 / ratio).floor() as usize;

    (0..out_len)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let pos = i as f64 * ratio;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let idx = pos as usize;
            #[allow(clippy::cast_possible_truncation)]
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_halves_length() {
        let input: Vec<f32> = (0..480).map(|i| i as f32).collect();
        let out = resample_linear(&input, 48000, 24000);
        assert_eq!(out.len(), 240);
        assert!((out[10] - 20.0).abs() < f32::EPSILON);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 24000, 24000), input);
    }

    #[test]
    fn empty_mp3_is_rejected() {
        assert!(decode_mp3(&[]).is_err());
    }
}
