//! Audio capture from microphone

use std::sync::mpsc as std_mpsc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::source::{AudioBackend, FrameAssembler, FrameSpec, RawStream, StreamGuard};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Frames buffered between the device callback and the reader
const FRAME_QUEUE: usize = 64;

/// Microphone backend built on cpal
///
/// cpal streams are not `Send`, so every opened stream lives on its own
/// thread until its guard is dropped.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Use the input device called `name` instead of the system default
    #[must_use]
    pub fn with_device(name: Option<String>) -> Self {
        Self { device_name: name }
    }
}

impl AudioBackend for CpalBackend {
    fn open(&self, spec: FrameSpec) -> Result<RawStream> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("remy-mic".to_string())
            .spawn(move || {
                let stream = match start_stream(device_name.as_deref(), spec, frame_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns when the guard sends or is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::DeviceUnavailable(
                    "capture thread exited before the stream started".to_string(),
                ));
            }
        }

        let guard = StreamGuard::new(move || {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        });

        Ok(RawStream {
            frames: frame_rx,
            guard,
        })
    }
}

fn select_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::DeviceUnavailable(format!("input device '{name}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string())),
    }
}

fn select_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supports_rate =
        |c: &cpal::SupportedStreamConfigRange| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| c.channels() == 1 && supports_rate(c))
        .or_else(|| {
            // Fallback: any channel count, first channel is kept
            device.supported_input_configs().ok()?.find(|c| supports_rate(c))
        })
        .ok_or_else(|| {
            Error::DeviceUnavailable(format!("no input config supports {sample_rate} Hz"))
        })?;

    Ok(supported.with_sample_rate(rate).config())
}

fn start_stream(
    device_name: Option<&str>,
    spec: FrameSpec,
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<Stream> {
    let device = select_device(device_name)?;
    let config = select_config(&device, spec.sample_rate)?;
    let channels = usize::from(config.channels.max(1));
    let mut assembler = FrameAssembler::new(spec.frame_length);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = spec.sample_rate,
        channels,
        frame_length = spec.frame_length,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<i16> = data.iter().step_by(channels).map(|&s| f32_to_i16(s)).collect();
                for frame in assembler.push(&mono) {
                    if let Err(mpsc::error::TrySendError::Full(_)) = frames.try_send(frame) {
                        tracing::trace!("frame queue full, dropping frame");
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    tracing::debug!("audio capture started");
    Ok(stream)
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode 16-bit mono samples as WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
