//! Voice processing module
//!
//! Handles microphone access, wake phrase detection, utterance recording,
//! transcription, and spoken replies.

mod capture;
mod listen;
mod playback;
mod source;
mod stt;
mod tts;
mod wake_word;

pub use capture::{CpalBackend, SAMPLE_RATE, f32_to_i16, samples_to_wav};
pub use listen::{ListenSettings, Utterance, UtteranceRecorder, record_utterance};
pub use playback::AudioPlayback;
pub use source::{
    AudioBackend, AudioFrameSource, Frame, FrameAssembler, FrameHandle, FrameSpec, RawStream,
    SourceStats, StreamGuard,
};
pub use stt::{AudioWindow, SpeechToText, TranscribeError, TranscriptionService};
pub use tts::{ReplyVoice, Speaker, SpeechSynthesisService, TextToSpeech, TtsProvider};
pub use wake_word::{
    DetectorState, ENERGY_THRESHOLD, PhraseDetector, SEGMENT_TRANSCRIBE_TIMEOUT,
    WakePhraseDetector, check_compatible, frame_energy,
};
