//! Wake phrase detection
//!
//! Detects the wake phrase in the frame stream. The built-in
//! [`PhraseDetector`] uses a hybrid approach: a local energy gate cuts the
//! stream into short speech segments, and each segment is transcribed and
//! checked for the phrase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::source::{Frame, FrameSpec};
use super::stt::{AudioWindow, TranscribeError, TranscriptionService};
use crate::{Error, Result};

/// Default RMS energy above which a frame counts as speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum speech before a segment is worth checking (0.3 s)
const MIN_SPEECH_SECS: f64 = 0.3;

/// Silence that ends a segment (0.5 s)
const SILENCE_SECS: f64 = 0.5;

/// Segments are cut off here; wake phrases are short (3 s)
const MAX_SEGMENT_SECS: f64 = 3.0;

/// Default bound on transcribing one segment
pub const SEGMENT_TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Consumes frames and reports when the wake phrase was spoken
#[async_trait]
pub trait WakePhraseDetector: Send + Sync {
    /// Samples per frame this detector expects
    fn frame_length(&self) -> usize;

    /// Sample rate this detector expects
    fn sample_rate(&self) -> u32;

    /// Feed one frame; returns true when the phrase was detected
    ///
    /// # Errors
    ///
    /// Returns error if the frame could not be processed; the caller skips it
    async fn process(&mut self, frame: &Frame) -> Result<bool>;

    /// Forget any partially heard phrase (called when a new stream starts)
    fn reset(&mut self) {}
}

/// Check that a detector accepts the frames a source produces
///
/// # Errors
///
/// Returns `Error::Config` if the frame length or sample rate differ
pub fn check_compatible(detector: &dyn WakePhraseDetector, spec: FrameSpec) -> Result<()> {
    if detector.frame_length() != spec.frame_length || detector.sample_rate() != spec.sample_rate {
        return Err(Error::Config(format!(
            "wake detector expects {} samples at {} Hz, audio source delivers {} samples at {} Hz",
            detector.frame_length(),
            detector.sample_rate(),
            spec.frame_length,
            spec.sample_rate
        )));
    }
    Ok(())
}

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Detected potential speech, accumulating
    Listening,
}

/// Energy-gated, transcript-verified wake phrase detector
pub struct PhraseDetector {
    phrases: Vec<String>,
    transcriber: Arc<dyn TranscriptionService>,
    language: String,
    spec: FrameSpec,
    energy_threshold: f32,
    transcribe_timeout: Duration,
    state: DetectorState,
    speech_buffer: Vec<i16>,
    silence_counter: usize,
}

impl PhraseDetector {
    /// Create a detector for `phrases` (e.g. "hey remy")
    #[must_use]
    pub fn new(
        phrases: Vec<String>,
        transcriber: Arc<dyn TranscriptionService>,
        language: impl Into<String>,
        spec: FrameSpec,
    ) -> Self {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();

        tracing::debug!(phrases = ?phrases, "wake phrase detector initialized");

        Self {
            phrases,
            transcriber,
            language: language.into(),
            spec,
            energy_threshold: ENERGY_THRESHOLD,
            transcribe_timeout: SEGMENT_TRANSCRIBE_TIMEOUT,
            state: DetectorState::Idle,
            speech_buffer: Vec::new(),
            silence_counter: 0,
        }
    }

    #[must_use]
    pub const fn with_energy_threshold(mut self, threshold: f32) -> Self {
        self.energy_threshold = threshold;
        self
    }

    /// Bound on transcribing one segment; a slower service skips the segment
    #[must_use]
    pub const fn with_transcribe_timeout(mut self, timeout: Duration) -> Self {
        self.transcribe_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Whether `transcript` contains one of the wake phrases
    #[must_use]
    pub fn contains_phrase(&self, transcript: &str) -> bool {
        let transcript = normalize(transcript);
        self.phrases.iter().any(|p| transcript.contains(p.as_str()))
    }

    /// Run the energy gate over `samples`, returning a finished segment
    fn segment(&mut self, samples: &[i16]) -> Option<Vec<i16>> {
        let energy = frame_energy(samples);
        let is_speech = energy > self.energy_threshold;
        let min_speech = self.spec.samples_in(Duration::from_secs_f64(MIN_SPEECH_SECS));
        let silence = self.spec.samples_in(Duration::from_secs_f64(SILENCE_SECS));
        let max_segment = self.spec.samples_in(Duration::from_secs_f64(MAX_SEGMENT_SECS));

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
                None
            }
            DetectorState::Listening => {
                self.speech_buffer.extend_from_slice(samples);
                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                let speech = self.speech_buffer.len().saturating_sub(self.silence_counter);
                let ended = self.silence_counter > silence;
                if (ended && speech > min_speech) || self.speech_buffer.len() >= max_segment {
                    tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
                    let segment = std::mem::take(&mut self.speech_buffer);
                    self.reset_segmenter();
                    return Some(segment);
                }

                if ended {
                    tracing::trace!("too short, resetting");
                    self.reset_segmenter();
                }
                None
            }
        }
    }

    fn reset_segmenter(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_buffer.clear();
        self.silence_counter = 0;
    }
}

#[async_trait]
impl WakePhraseDetector for PhraseDetector {
    fn frame_length(&self) -> usize {
        self.spec.frame_length
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    async fn process(&mut self, frame: &Frame) -> Result<bool> {
        if frame.samples.len() != self.spec.frame_length {
            return Err(Error::WakeWord(format!(
                "frame {} has {} samples, expected {}",
                frame.index,
                frame.samples.len(),
                self.spec.frame_length
            )));
        }

        let Some(segment) = self.segment(&frame.samples) else {
            return Ok(false);
        };

        let window = AudioWindow::new(segment, self.spec.sample_rate);
        let transcription = tokio::time::timeout(
            self.transcribe_timeout,
            self.transcriber.transcribe(&window, &self.language),
        )
        .await
        .map_err(|_| {
            Error::WakeWord(format!(
                "transcribing segment ending at frame {} timed out",
                frame.index
            ))
        })?;

        match transcription {
            Ok(transcript) => {
                let detected = self.contains_phrase(&transcript);
                if detected {
                    tracing::info!(transcript = %transcript, "wake phrase detected");
                } else {
                    tracing::debug!(transcript = %transcript, "no wake phrase in segment");
                }
                Ok(detected)
            }
            Err(TranscribeError::Unintelligible | TranscribeError::Timeout) => Ok(false),
            Err(TranscribeError::ServiceUnavailable(detail)) => Err(Error::WakeWord(detail)),
        }
    }

    fn reset(&mut self) {
        self.reset_segmenter();
    }
}

/// RMS energy of 16-bit samples, normalized to [0, 1]
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn frame_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let s = f64::from(s) / 32768.0;
            s * s
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Lowercase, drop punctuation, collapse whitespace
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(std::result::Result<String, TranscribeError>);

    #[async_trait]
    impl TranscriptionService for Fixed {
        async fn transcribe(
            &self,
            _window: &AudioWindow,
            _language: &str,
        ) -> std::result::Result<String, TranscribeError> {
            self.0.clone()
        }
    }

    fn detector(reply: std::result::Result<String, TranscribeError>) -> PhraseDetector {
        PhraseDetector::new(
            vec!["Hey Remy".to_string()],
            Arc::new(Fixed(reply)),
            "en",
            FrameSpec::new(16_000, 512),
        )
    }

    fn frame(index: u64, amplitude: i16) -> Frame {
        Frame {
            index,
            samples: vec![amplitude; 512],
        }
    }

    /// 0.5 s of loud audio followed by 0.6 s of silence
    async fn feed_utterance(detector: &mut PhraseDetector) -> Vec<Result<bool>> {
        let mut results = Vec::new();
        let mut index = 0;
        for _ in 0..16 {
            results.push(detector.process(&frame(index, 8000)).await);
            index += 1;
        }
        for _ in 0..19 {
            results.push(detector.process(&frame(index, 0)).await);
            index += 1;
        }
        results
    }

    #[test]
    fn test_energy_calculation() {
        assert!(frame_energy(&[0; 100]) < 0.001);
        assert!(frame_energy(&[16_384; 100]) > 0.4);
        assert!(frame_energy(&[]) < f32::EPSILON);
    }

    #[test]
    fn test_phrase_matching_ignores_case_and_punctuation() {
        let detector = detector(Ok(String::new()));
        assert!(detector.contains_phrase("Hey, Remy! What's that?"));
        assert!(detector.contains_phrase("hey   remy"));
        assert!(!detector.contains_phrase("hello world"));
    }

    #[tokio::test]
    async fn test_detects_phrase_after_segment() {
        let mut detector = detector(Ok("hey remy".to_string()));
        let results = feed_utterance(&mut detector).await;

        let hits = results.iter().filter(|r| matches!(r, Ok(true))).count();
        assert_eq!(hits, 1);
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[tokio::test]
    async fn test_other_speech_is_not_a_wake() {
        let mut detector = detector(Ok("what time is it".to_string()));
        let results = feed_utterance(&mut detector).await;
        assert!(results.iter().all(|r| matches!(r, Ok(false))));
    }

    #[tokio::test]
    async fn test_service_failure_is_frame_error() {
        let mut detector = detector(Err(TranscribeError::ServiceUnavailable("down".to_string())));
        let results = feed_utterance(&mut detector).await;
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_frame_length_rejected() {
        let mut detector = detector(Ok(String::new()));
        let short = Frame {
            index: 0,
            samples: vec![0; 100],
        };
        assert!(detector.process(&short).await.is_err());
    }

    #[test]
    fn test_compatibility_check() {
        let detector = detector(Ok(String::new()));
        assert!(check_compatible(&detector, FrameSpec::new(16_000, 512)).is_ok());
        assert!(check_compatible(&detector, FrameSpec::new(16_000, 1024)).is_err());
        assert!(check_compatible(&detector, FrameSpec::new(44_100, 512)).is_err());
    }
}
