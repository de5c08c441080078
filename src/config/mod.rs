//! Configuration management for Remy
//!
//! Every value resolves as environment variable > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::camera::CommandCamera;
use crate::chat::OPENAI_CHAT_URL;
use crate::coordinator::{ActiveSettings, CoordinatorSettings, RetryPolicy, Timeouts};
use crate::prompt::PromptSet;
use crate::voice::{ENERGY_THRESHOLD, FrameSpec, ListenSettings, ReplyVoice, SAMPLE_RATE, TtsProvider};
use crate::{Error, Result};

/// Frame length used by the wake detector and the audio source
pub const DEFAULT_FRAME_LENGTH: usize = 512;

/// Remy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (history, captures)
    pub data_dir: PathBuf,

    pub voice: VoiceConfig,

    pub chat: ChatConfig,

    pub camera: CameraConfig,

    /// Periodic capture loop
    pub active: ActiveSettings,

    /// Chat history file
    pub history_path: PathBuf,

    /// Prompt YAML file; built-in prompts when `None`
    pub prompts_path: Option<PathBuf>,

    pub timeouts: Timeouts,

    /// Microphone reopen policy
    pub device_retry: RetryPolicy,

    pub api_keys: ApiKeys,

    pub api_server: ApiServerConfig,
}

/// Speech-to-text provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProviderKind {
    Whisper,
    Deepgram,
}

impl FromStr for SttProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider '{other}'"))),
        }
    }
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub wake_phrase: String,

    /// Opaque model path for wake detectors that load one
    pub wake_model_path: Option<PathBuf>,

    /// Language code for transcription (e.g. "zh-CN")
    pub language: String,

    /// Input device name; the system default when `None`
    pub input_device: Option<String>,

    pub sample_rate: u32,
    pub frame_length: usize,

    /// Utterance recording limits
    pub listen: ListenSettings,

    pub stt_provider: SttProviderKind,
    pub stt_model: String,

    pub tts_provider: TtsProvider,
    pub tts_model: String,
    pub tts_voice: String,
    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,

    pub speak_replies: bool,
}

/// Vision chat configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// OpenAI-compatible chat completions URL
    pub url: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub history_window: usize,
}

/// Camera capture configuration
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub program: String,
    pub args: Vec<String>,
    pub upload_dir: PathBuf,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS, chat)
    pub openai: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,

    /// Key for a non-OpenAI chat provider
    pub chat: Option<String>,
}

impl ApiKeys {
    /// Key used for chat requests
    #[must_use]
    pub fn chat_key(&self) -> Option<&str> {
        self.chat.as_deref().or(self.openai.as_deref())
    }
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides `REMY_CONFIG` and the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = path.map(Path::to_path_buf).or_else(|| env("REMY_CONFIG").map(PathBuf::from));
        let fc = file::load_config_file(path.as_deref());
        Self::resolve(fc, env)
    }

    /// Resolve a config file against an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown
    #[allow(clippy::too_many_lines)]
    pub fn resolve(fc: file::RemyConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flag = |key: &str| env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        // Determine data directory (~/.local/share/remy on Linux)
        let data_dir = directories::BaseDirs::new()
            .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("remy"));

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
            chat: env("REMY_CHAT_API_KEY").or(fc.api_keys.chat),
        };

        // Voice config (env > toml > default)
        let v = fc.voice;
        let listen_defaults = ListenSettings::default();
        let listen = ListenSettings {
            onset_timeout: v
                .onset_timeout_secs
                .map_or(listen_defaults.onset_timeout, Duration::from_secs),
            max_utterance: v
                .max_utterance_secs
                .map_or(listen_defaults.max_utterance, Duration::from_secs),
            end_silence: v
                .end_silence_ms
                .map_or(listen_defaults.end_silence, Duration::from_millis),
            ambient_calibration: v
                .ambient_calibration_ms
                .map_or(listen_defaults.ambient_calibration, Duration::from_millis),
            energy_threshold: v.energy_threshold.unwrap_or(ENERGY_THRESHOLD),
        };
        let tts_provider = env("REMY_TTS_PROVIDER")
            .or(v.tts_provider)
            .as_deref()
            .map_or(Ok(TtsProvider::OpenAi), str::parse)?;
        let voice = VoiceConfig {
            wake_phrase: env("REMY_WAKE_PHRASE")
                .or(v.wake_phrase)
                .unwrap_or_else(|| "hey remy".to_string()),
            wake_model_path: env("REMY_WAKE_MODEL")
                .or(v.wake_model_path)
                .map(PathBuf::from),
            language: env("REMY_LANGUAGE")
                .or(v.language)
                .unwrap_or_else(|| "zh-CN".to_string()),
            input_device: env("REMY_INPUT_DEVICE").or(v.input_device),
            sample_rate: v.sample_rate.unwrap_or(SAMPLE_RATE),
            frame_length: v.frame_length.unwrap_or(DEFAULT_FRAME_LENGTH),
            listen,
            stt_provider: env("REMY_STT_PROVIDER")
                .or(v.stt_provider)
                .as_deref()
                .map_or(Ok(SttProviderKind::Whisper), str::parse)?,
            stt_model: env("REMY_STT_MODEL")
                .or(v.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_provider,
            tts_model: env("REMY_TTS_MODEL")
                .or(v.tts_model)
                .unwrap_or_else(|| tts_provider.default_model().to_string()),
            tts_voice: env("REMY_TTS_VOICE")
                .or(v.tts_voice)
                .unwrap_or_else(|| tts_provider.default_voice().to_string()),
            tts_speed: parsed(&env, "REMY_TTS_SPEED").or(v.tts_speed).unwrap_or(1.0),
            speak_replies: flag("REMY_SPEAK_REPLIES")
                .or(v.speak_replies)
                .unwrap_or(true),
        };

        let chat = ChatConfig {
            url: env("REMY_CHAT_URL")
                .or(fc.chat.provider_url)
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
            model: env("REMY_CHAT_MODEL")
                .or(fc.chat.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_tokens: fc.chat.max_tokens,
            history_window: fc.chat.history_window.unwrap_or(20),
        };

        let (default_program, default_args) = CommandCamera::platform_default();
        let camera = CameraConfig {
            program: env("REMY_CAMERA_PROGRAM")
                .or(fc.camera.program)
                .unwrap_or(default_program),
            args: fc.camera.args.unwrap_or(default_args),
            upload_dir: fc
                .camera
                .upload_dir
                .map_or_else(|| PathBuf::from("statics/uploads"), PathBuf::from),
        };

        let active_defaults = ActiveSettings::default();
        let active = ActiveSettings {
            enabled: flag("REMY_ACTIVE_ENABLED")
                .or(fc.active.enabled)
                .unwrap_or(active_defaults.enabled),
            interval: parsed(&env, "REMY_ACTIVE_INTERVAL")
                .or(fc.active.interval_secs)
                .map_or(active_defaults.interval, Duration::from_secs),
            persist_history: fc
                .active
                .persist_history
                .unwrap_or(active_defaults.persist_history),
        };

        let history_path = env("REMY_HISTORY_PATH")
            .or(fc.history.path)
            .map_or_else(|| data_dir.join("chat_history.json"), PathBuf::from);

        let prompts_path = env("REMY_PROMPTS")
            .or(fc.prompts.path)
            .map(PathBuf::from)
            .or_else(|| {
                let local = PathBuf::from("prompts.yaml");
                local.exists().then_some(local)
            });

        let t = fc.timeouts;
        let defaults = Timeouts::default();
        let secs = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_secs);
        let timeouts = Timeouts {
            chat: secs(t.chat, defaults.chat),
            camera: secs(t.camera, defaults.camera),
            transcription: secs(t.transcription, defaults.transcription),
            synthesis: secs(t.synthesis, defaults.synthesis),
            preempt: secs(t.preempt, defaults.preempt),
            shutdown_grace: secs(t.shutdown_grace, defaults.shutdown_grace),
        };

        let retry_defaults = RetryPolicy::default();
        let device_retry = RetryPolicy {
            attempts: fc.device.retry_attempts.unwrap_or(retry_defaults.attempts),
            backoff: fc
                .device
                .retry_backoff_ms
                .map_or(retry_defaults.backoff, Duration::from_millis),
        };

        let port: Option<u16> = parsed(&env, "REMY_API_PORT");
        let api_server = ApiServerConfig {
            enabled: port.is_some() || fc.api.enabled.unwrap_or(false),
            port: port.or(fc.api.port).unwrap_or(8000),
        };

        Ok(Self {
            data_dir,
            voice,
            chat,
            camera,
            active,
            history_path,
            prompts_path,
            timeouts,
            device_retry,
            api_keys,
            api_server,
        })
    }

    /// Frame shape shared by the audio source and the wake detector
    #[must_use]
    pub const fn frame_spec(&self) -> FrameSpec {
        FrameSpec::new(self.voice.sample_rate, self.voice.frame_length)
    }

    /// Voice used for spoken replies
    #[must_use]
    pub fn reply_voice(&self) -> ReplyVoice {
        ReplyVoice {
            model: self.voice.tts_model.clone(),
            voice: self.voice.tts_voice.clone(),
            speed: self.voice.tts_speed,
        }
    }

    /// Prompts from the configured file, or the built-in set
    #[must_use]
    pub fn prompts(&self) -> PromptSet {
        PromptSet::load_or_default(self.prompts_path.as_deref())
    }

    /// Settings for the coordinator
    #[must_use]
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            language: self.voice.language.clone(),
            listen: self.voice.listen.clone(),
            active: self.active.clone(),
            history_window: self.chat.history_window,
            prompts: self.prompts(),
            timeouts: self.timeouts,
            device_retry: self.device_retry,
            speak_replies: self.voice.speak_replies,
        }
    }
}

/// Parse an environment value, ignoring ones that do not parse
fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn resolve(toml: &str, env: &[(&str, &str)]) -> Result<Config> {
        let fc = file::parse_config_file(toml).unwrap();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::resolve(fc, |key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve("", &[]).unwrap();

        assert_eq!(config.voice.wake_phrase, "hey remy");
        assert_eq!(config.voice.language, "zh-CN");
        assert_eq!(config.frame_spec(), FrameSpec::new(16_000, 512));
        assert_eq!(config.voice.stt_provider, SttProviderKind::Whisper);
        assert_eq!(config.chat.history_window, 20);
        assert_eq!(config.active.interval, Duration::from_secs(2));
        assert!(!config.active.persist_history);
        assert_eq!(config.timeouts.preempt, Duration::from_secs(2));
        assert_eq!(config.device_retry.attempts, 5);
        assert!(!config.api_server.enabled);
        assert_eq!(config.api_server.port, 8000);
        assert!(config.history_path.ends_with("chat_history.json"));
    }

    #[test]
    fn test_env_overrides_file() {
        let config = resolve(
            r#"
            [voice]
            language = "en-US"
            wake_phrase = "hello remy"

            [active]
            interval_secs = 30

            [api_keys]
            openai = "sk-file"
            "#,
            &[
                ("REMY_LANGUAGE", "fr-FR"),
                ("REMY_ACTIVE_INTERVAL", "7"),
                ("OPENAI_API_KEY", "sk-env"),
            ],
        )
        .unwrap();

        assert_eq!(config.voice.language, "fr-FR");
        assert_eq!(config.voice.wake_phrase, "hello remy");
        assert_eq!(config.active.interval, Duration::from_secs(7));
        assert_eq!(config.api_keys.openai.as_deref(), Some("sk-env"));
    }

    #[test]
    fn test_port_env_enables_api() {
        let config = resolve("", &[("REMY_API_PORT", "9000")]).unwrap();
        assert!(config.api_server.enabled);
        assert_eq!(config.api_server.port, 9000);
    }

    #[test]
    fn test_numeric_env_values() {
        let config = resolve(
            "",
            &[
                ("REMY_TTS_SPEED", "1.25"),
                ("REMY_ACTIVE_INTERVAL", " 9 "),
                ("REMY_API_PORT", "8123"),
            ],
        )
        .unwrap();

        assert!((config.voice.tts_speed - 1.25).abs() < f32::EPSILON);
        assert_eq!(config.active.interval, Duration::from_secs(9));
        assert_eq!(config.api_server.port, 8123);

        // Unparsable values fall through to the default
        let config = resolve("", &[("REMY_ACTIVE_INTERVAL", "soon")]).unwrap();
        assert_eq!(config.active.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_reply_voice_defaults_follow_provider() {
        let config = resolve("", &[]).unwrap();
        assert_eq!(config.reply_voice(), ReplyVoice::default_for(TtsProvider::OpenAi));

        let config = resolve("[voice]\ntts_provider = \"elevenlabs\"\n", &[]).unwrap();
        assert_eq!(config.voice.tts_provider, TtsProvider::ElevenLabs);
        assert_eq!(config.reply_voice().model, "eleven_multilingual_v2");

        let config = resolve(
            "[voice]\ntts_provider = \"elevenlabs\"\ntts_model = \"eleven_turbo_v2_5\"\n",
            &[("REMY_TTS_VOICE", "custom-voice")],
        )
        .unwrap();
        assert_eq!(config.reply_voice().model, "eleven_turbo_v2_5");
        assert_eq!(config.reply_voice().voice, "custom-voice");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(resolve("", &[("REMY_STT_PROVIDER", "carrier-pigeon")]).is_err());
        assert!(resolve("[voice]\ntts_provider = \"ElevenLabs\"\n", &[]).is_ok());
    }

    #[test]
    fn test_chat_key_prefers_dedicated_key() {
        let keys = ApiKeys {
            openai: Some("sk-openai".to_string()),
            chat: Some("zhipu".to_string()),
            ..ApiKeys::default()
        };
        assert_eq!(keys.chat_key(), Some("zhipu"));
        assert_eq!(ApiKeys::default().chat_key(), None);
    }

    #[test]
    fn test_coordinator_settings_projection() {
        let config = resolve(
            "[timeouts]\nchat = 12\n\n[active]\npersist_history = true\n",
            &[],
        )
        .unwrap();
        let settings = config.coordinator_settings();
        assert_eq!(settings.timeouts.chat, Duration::from_secs(12));
        assert!(settings.active.persist_history);
        assert_eq!(settings.language, "zh-CN");
    }
}
