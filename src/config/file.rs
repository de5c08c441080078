//! TOML configuration file loading
//!
//! Supports `~/.config/remy/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct RemyConfigFile {
    #[serde(default)]
    pub voice: VoiceFileConfig,

    #[serde(default)]
    pub chat: ChatFileConfig,

    #[serde(default)]
    pub camera: CameraFileConfig,

    #[serde(default)]
    pub active: ActiveFileConfig,

    #[serde(default)]
    pub history: HistoryFileConfig,

    #[serde(default)]
    pub prompts: PromptsFileConfig,

    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,

    #[serde(default)]
    pub device: DeviceFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    #[serde(default)]
    pub api: ApiFileConfig,
}

/// Microphone, wake phrase, STT and TTS
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Wake phrase (e.g. "hey remy")
    pub wake_phrase: Option<String>,

    /// Wake phrase model file, for detectors that use one
    pub wake_model_path: Option<String>,

    /// Language code for transcription (e.g. "zh-CN")
    pub language: Option<String>,

    /// Input device name; the system default when unset
    pub input_device: Option<String>,

    pub sample_rate: Option<u32>,
    pub frame_length: Option<usize>,

    pub onset_timeout_secs: Option<u64>,
    pub max_utterance_secs: Option<u64>,
    pub end_silence_ms: Option<u64>,
    pub ambient_calibration_ms: Option<u64>,

    /// RMS level counted as speech
    pub energy_threshold: Option<f32>,

    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,
    pub stt_model: Option<String>,

    /// "openai" or "elevenlabs"
    pub tts_provider: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,

    /// Speak passive replies aloud
    pub speak_replies: Option<bool>,
}

/// Vision chat service
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// OpenAI-compatible chat completions URL
    pub provider_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    /// History messages sent with each request
    pub history_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CameraFileConfig {
    pub program: Option<String>,
    /// Arguments; `{output}` is replaced by the image path
    pub args: Option<Vec<String>>,
    pub upload_dir: Option<String>,
}

/// Periodic capture loop
#[derive(Debug, Default, Deserialize)]
pub struct ActiveFileConfig {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub persist_history: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryFileConfig {
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PromptsFileConfig {
    pub path: Option<String>,
}

/// Timeouts in seconds
#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsFileConfig {
    pub chat: Option<u64>,
    pub camera: Option<u64>,
    pub transcription: Option<u64>,
    pub synthesis: Option<u64>,
    pub preempt: Option<u64>,
    pub shutdown_grace: Option<u64>,
}

/// Microphone reopen policy
#[derive(Debug, Default, Deserialize)]
pub struct DeviceFileConfig {
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
    /// Key for the chat provider when it is not OpenAI
    pub chat: Option<String>,
}

/// HTTP API server
#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

/// Parse a config document
///
/// # Errors
///
/// Returns error if the document is not valid TOML for this schema
pub fn parse_config_file(content: &str) -> crate::Result<RemyConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `RemyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> RemyConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return RemyConfigFile::default();
    };

    if !path.exists() {
        return RemyConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                RemyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            RemyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/remy/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("remy").join("config.toml"))
}
