//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Plays audio to the default output device
///
/// Playback blocks the calling thread; run it on a blocking task.
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let rate = SampleRate(PLAYBACK_SAMPLE_RATE);

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| supports(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { device, config })
    }

    /// Play audio from MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    pub fn play_mp3(&self, mp3_data: &[u8]) -> Result<()> {
        let samples = decode_mp3(mp3_data)?;
        self.play(samples)
    }

    /// Play mono f32 samples and wait until they have been played
    ///
    /// # Errors
    ///
    /// Returns error if the output stream cannot be started
    pub fn play(&self, samples: Vec<f32>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels.max(1));
        let sample_count = samples.len();
        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);
            self.device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).copied().unwrap_or(0.0);
                            frame.fill(sample);
                            if pos < samples.len() {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                        if pos >= samples.len() {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let expected = Duration::from_millis(
            (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE) + 500,
        );
        let start = Instant::now();
        while !finished.load(Ordering::Acquire) && start.elapsed() < expected {
            std::thread::sleep(Duration::from_millis(50));
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        Ok(())
    }
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let channels = frame.channels.max(1);
                samples.extend(frame.data.chunks(channels).map(|chunk| {
                    let sum: f32 = chunk.iter().map(|&s| f32::from(s) / 32768.0).sum();
                    #[allow(clippy::cast_precision_loss)]
                    let mean = sum / chunk.len() as f32;
                    mean
                }));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}

