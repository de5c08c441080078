//! Error types for Remy

use thiserror::Error;

/// Result type alias for Remy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Remy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio input device could not be acquired
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Frame stream was closed while a read was pending
    #[error("audio stream closed")]
    StreamClosed,

    /// Audio error
    #[error("audio error: {0}")]
    Audio(String),

    /// Wake phrase detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Vision chat service error
    #[error("chat error: {0}")]
    Chat(String),

    /// Camera capture error
    #[error("camera error: {0}")]
    Camera(String),

    /// Chat history could not be written or read
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An external call exceeded its deadline
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML parsing error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the error means the microphone could not be acquired
    #[must_use]
    pub const fn is_device_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_))
    }
}
