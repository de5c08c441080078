//! Recording one spoken request
//!
//! After the wake phrase, the microphone is reopened and a window of speech
//! is recorded: the ambient level is sampled first, then we wait for speech
//! to start (bounded by the onset timeout) and stop after trailing silence
//! or the maximum utterance length. Limits are counted in audio time; a
//! wall-clock deadline guards against a device that stops delivering frames.

use std::time::Duration;

use super::source::{AudioFrameSource, FrameSpec};
use super::stt::AudioWindow;
use super::wake_word::{ENERGY_THRESHOLD, frame_energy};
use crate::{Error, Result};

/// Ambient level is multiplied by this to get the speech threshold
const AMBIENT_MARGIN: f32 = 1.5;

/// Slack added to the wall-clock deadline
const DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Timing limits for one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct ListenSettings {
    /// How long to wait for speech to start
    pub onset_timeout: Duration,
    /// Longest utterance recorded
    pub max_utterance: Duration,
    /// Silence that ends the utterance
    pub end_silence: Duration,
    /// Ambient noise sampled before listening; zero disables calibration
    pub ambient_calibration: Duration,
    /// Minimum RMS energy counted as speech
    pub energy_threshold: f32,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            onset_timeout: Duration::from_secs(5),
            max_utterance: Duration::from_secs(5),
            end_silence: Duration::from_millis(800),
            ambient_calibration: Duration::from_millis(500),
            energy_threshold: ENERGY_THRESHOLD,
        }
    }
}

impl ListenSettings {
    /// Wall-clock bound on a whole recording
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.ambient_calibration + self.onset_timeout + self.max_utterance + DEADLINE_SLACK
    }
}

/// Result of a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Utterance {
    Speech(AudioWindow),
    /// Nothing was said before the onset timeout
    Silence,
}

/// Frame-by-frame utterance segmentation
#[derive(Debug)]
pub struct UtteranceRecorder {
    sample_rate: u32,
    threshold: f32,
    calibration_left: usize,
    ambient_sum: f64,
    ambient_frames: u32,
    onset_limit: usize,
    max_len: usize,
    end_silence: usize,
    waited: usize,
    previous: Vec<i16>,
    speech: Vec<i16>,
    started: bool,
    silence_run: usize,
}

impl UtteranceRecorder {
    #[must_use]
    pub fn new(spec: FrameSpec, settings: &ListenSettings) -> Self {
        Self {
            sample_rate: spec.sample_rate,
            threshold: settings.energy_threshold,
            calibration_left: spec.samples_in(settings.ambient_calibration),
            ambient_sum: 0.0,
            ambient_frames: 0,
            onset_limit: spec.samples_in(settings.onset_timeout),
            max_len: spec.samples_in(settings.max_utterance),
            end_silence: spec.samples_in(settings.end_silence),
            waited: 0,
            previous: Vec::new(),
            speech: Vec::new(),
            started: false,
            silence_run: 0,
        }
    }

    /// Current speech threshold, raised by calibration
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Feed one frame; returns true once recording is finished
    pub fn feed(&mut self, samples: &[i16]) -> bool {
        let energy = frame_energy(samples);

        if self.calibration_left > 0 {
            self.ambient_sum += f64::from(energy);
            self.ambient_frames += 1;
            self.calibration_left = self.calibration_left.saturating_sub(samples.len());
            if self.calibration_left == 0 {
                self.finish_calibration();
            }
            return false;
        }

        let loud = energy > self.threshold;

        if !self.started {
            if loud {
                self.started = true;
                // Keep the frame before onset so the first syllable isn't clipped
                self.speech.append(&mut self.previous);
                self.speech.extend_from_slice(samples);
                tracing::debug!(energy, "speech started");
            } else {
                self.waited += samples.len();
                self.previous.clear();
                self.previous.extend_from_slice(samples);
                return self.waited >= self.onset_limit;
            }
        } else {
            self.speech.extend_from_slice(samples);
            if loud {
                self.silence_run = 0;
            } else {
                self.silence_run += samples.len();
                if self.silence_run >= self.end_silence {
                    return true;
                }
            }
        }

        self.speech.len() >= self.max_len
    }

    #[allow(clippy::cast_possible_truncation)]
    fn finish_calibration(&mut self) {
        if self.ambient_frames == 0 {
            return;
        }
        let ambient = (self.ambient_sum / f64::from(self.ambient_frames)) as f32;
        self.threshold = self.threshold.max(ambient * AMBIENT_MARGIN);
        tracing::debug!(ambient, threshold = self.threshold, "ambient noise calibrated");
    }

    /// The recorded speech, or `Silence` if speech never started
    #[must_use]
    pub fn finish(self) -> Utterance {
        if self.started {
            Utterance::Speech(AudioWindow::new(self.speech, self.sample_rate))
        } else {
            Utterance::Silence
        }
    }
}

/// Open the microphone, record one utterance and close it again
///
/// The stream is closed on every path, including errors.
///
/// # Errors
///
/// Returns error if the microphone cannot be opened or fails mid-recording
pub async fn record_utterance(
    source: &AudioFrameSource,
    settings: &ListenSettings,
) -> Result<Utterance> {
    let handle = source.open()?;
    let deadline = tokio::time::Instant::now() + settings.deadline();
    let mut recorder = UtteranceRecorder::new(source.spec(), settings);

    let outcome = loop {
        match tokio::time::timeout_at(deadline, source.read(&handle)).await {
            Ok(Ok(frame)) => {
                if recorder.feed(&frame.samples) {
                    break Ok(());
                }
            }
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                tracing::warn!("recording hit the wall-clock deadline");
                break Ok(());
            }
        }
    };

    source.close(&handle);

    match outcome {
        Ok(()) => Ok(recorder.finish()),
        Err(Error::StreamClosed) => Err(Error::DeviceUnavailable(
            "microphone closed while recording".to_string(),
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: FrameSpec = FrameSpec::new(16_000, 512);

    fn settings() -> ListenSettings {
        ListenSettings {
            ambient_calibration: Duration::ZERO,
            ..ListenSettings::default()
        }
    }

    fn run(recorder: &mut UtteranceRecorder, frames: usize, amplitude: i16) -> Option<usize> {
        (0..frames).position(|_| recorder.feed(&vec![amplitude; 512]))
    }

    #[test]
    fn test_silence_until_onset_timeout() {
        let mut recorder = UtteranceRecorder::new(SPEC, &settings());
        // 5 s at 512 samples per frame is 156.25 frames
        assert_eq!(run(&mut recorder, 200, 0), Some(156));
        assert_eq!(recorder.finish(), Utterance::Silence);
    }

    #[test]
    fn test_speech_ends_on_trailing_silence() {
        let mut recorder = UtteranceRecorder::new(SPEC, &settings());
        assert_eq!(run(&mut recorder, 3, 0), None);
        assert_eq!(run(&mut recorder, 20, 8000), None);
        // 800 ms of silence is 25 frames
        assert_eq!(run(&mut recorder, 40, 0), Some(24));

        let Utterance::Speech(window) = recorder.finish() else {
            panic!("expected speech");
        };
        // pre-roll frame + 20 speech frames + 25 silent frames
        assert_eq!(window.samples.len(), 46 * 512);
    }

    #[test]
    fn test_speech_capped_at_max_utterance() {
        let mut recorder = UtteranceRecorder::new(SPEC, &settings());
        let done = run(&mut recorder, 400, 8000);
        assert_eq!(done, Some(156));
    }

    #[test]
    fn test_calibration_raises_threshold() {
        let settings = ListenSettings::default();
        let mut recorder = UtteranceRecorder::new(SPEC, &settings);
        // ambient hum at ~0.06 RMS
        run(&mut recorder, 16, 2000);
        assert!(recorder.threshold() > 0.08);

        // the same hum no longer counts as speech
        assert_eq!(run(&mut recorder, 10, 2000), None);
        assert!(!recorder.started);
    }

    #[test]
    fn test_deadline_covers_all_phases() {
        assert_eq!(ListenSettings::default().deadline(), Duration::from_millis(11_500));
    }
}
