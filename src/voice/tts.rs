//! Spoken replies
//!
//! Replies are synthesized to MP3 by a hosted TTS provider and played on the
//! default output device.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::playback::AudioPlayback;
use crate::{Error, Result};

const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const ELEVENLABS_SPEECH_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Per-request bound; the coordinator applies its own synthesis timeout on top
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Says text out loud
#[async_trait]
pub trait SpeechSynthesisService: Send + Sync {
    /// Speak `text`, returning once playback has finished
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<()>;
}

/// Hosted TTS provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAi,
    ElevenLabs,
}

impl TtsProvider {
    /// Model used when none is configured
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "tts-1",
            // Replies follow the transcription language, which is rarely English
            Self::ElevenLabs => "eleven_multilingual_v2",
        }
    }

    /// Voice used when none is configured
    #[must_use]
    pub const fn default_voice(self) -> &'static str {
        match self {
            Self::OpenAi => "alloy",
            Self::ElevenLabs => "21m00Tcm4TlvDq8ikWAM",
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::ElevenLabs => "ElevenLabs",
        }
    }
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider '{other}'"))),
        }
    }
}

/// How replies sound
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyVoice {
    pub model: String,
    /// Voice name (`OpenAI`) or voice id (ElevenLabs)
    pub voice: String,
    /// Playback speed; ElevenLabs ignores it
    pub speed: f32,
}

impl ReplyVoice {
    /// Provider defaults at normal speed
    #[must_use]
    pub fn default_for(provider: TtsProvider) -> Self {
        Self {
            model: provider.default_model().to_string(),
            voice: provider.default_voice().to_string(),
            speed: 1.0,
        }
    }
}

/// Synthesizes reply text to MP3
pub struct TextToSpeech {
    client: reqwest::Client,
    provider: TtsProvider,
    api_key: String,
    voice: ReplyVoice,
}

impl TextToSpeech {
    /// # Errors
    ///
    /// Returns `Error::Config` if the provider's API key is missing
    pub fn new(provider: TtsProvider, api_key: Option<String>, voice: ReplyVoice) -> Result<Self> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!("{} API key required for spoken replies", provider.name()))
            })?;

        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            provider,
            api_key,
            voice,
        })
    }

    #[must_use]
    pub const fn provider(&self) -> TtsProvider {
        self.provider
    }

    /// The provider request for `text`
    fn request(&self, text: &str) -> reqwest::RequestBuilder {
        let voice = &self.voice;
        match self.provider {
            TtsProvider::OpenAi => self
                .client
                .post(OPENAI_SPEECH_URL)
                .bearer_auth(&self.api_key)
                .json(&json!({
                    "model": voice.model,
                    "input": text,
                    "voice": voice.voice,
                    "speed": voice.speed,
                    "response_format": "mp3",
                })),
            TtsProvider::ElevenLabs => self
                .client
                .post(format!("{ELEVENLABS_SPEECH_URL}/{}", voice.voice))
                .header("xi-api-key", &self.api_key)
                .header(reqwest::header::ACCEPT, "audio/mpeg")
                .json(&json!({
                    "text": text,
                    "model_id": voice.model,
                })),
        }
    }

    /// Synthesize `text`, returning MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Tts` if the provider rejects the request
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let response = self.request(text).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!(
                "{} returned {status}: {body}",
                self.provider.name()
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Synthesizes replies and plays them on the default output device
pub struct Speaker {
    tts: TextToSpeech,
}

impl Speaker {
    #[must_use]
    pub const fn new(tts: TextToSpeech) -> Self {
        Self { tts }
    }
}

#[async_trait]
impl SpeechSynthesisService for Speaker {
    async fn speak(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let audio = self.tts.synthesize(text).await?;
        tracing::debug!(audio_bytes = audio.len(), "speech synthesized");

        // cpal output streams block and are not Send
        tokio::task::spawn_blocking(move || AudioPlayback::new()?.play_mp3(&audio))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(tts: &TextToSpeech, text: &str) -> (String, serde_json::Value) {
        let request = tts.request(text).build().unwrap();
        let bytes = request.body().and_then(reqwest::Body::as_bytes).unwrap();
        (request.url().to_string(), serde_json::from_slice(bytes).unwrap())
    }

    #[test]
    fn test_missing_key_rejected() {
        let voice = ReplyVoice::default_for(TtsProvider::OpenAi);
        assert!(TextToSpeech::new(TtsProvider::OpenAi, None, voice.clone()).is_err());
        assert!(TextToSpeech::new(TtsProvider::ElevenLabs, Some("  ".to_string()), voice).is_err());
    }

    #[test]
    fn test_provider_names_parse() {
        assert_eq!("OpenAI".parse::<TtsProvider>().unwrap(), TtsProvider::OpenAi);
        assert_eq!(" elevenlabs ".parse::<TtsProvider>().unwrap(), TtsProvider::ElevenLabs);
        assert!("espeak".parse::<TtsProvider>().is_err());
    }

    #[test]
    fn test_openai_request_carries_voice() {
        let voice = ReplyVoice {
            model: "tts-1-hd".to_string(),
            voice: "nova".to_string(),
            speed: 1.5,
        };
        let tts = TextToSpeech::new(TtsProvider::OpenAi, Some("sk-test".to_string()), voice).unwrap();

        let (url, json) = body(&tts, "a red cup");
        assert_eq!(url, OPENAI_SPEECH_URL);
        assert_eq!(json["model"], "tts-1-hd");
        assert_eq!(json["voice"], "nova");
        assert_eq!(json["input"], "a red cup");
        assert_eq!(json["speed"], 1.5);
    }

    #[test]
    fn test_elevenlabs_request_uses_configured_model() {
        let voice = ReplyVoice {
            model: "eleven_turbo_v2_5".to_string(),
            ..ReplyVoice::default_for(TtsProvider::ElevenLabs)
        };
        let tts = TextToSpeech::new(TtsProvider::ElevenLabs, Some("xi".to_string()), voice).unwrap();

        let (url, json) = body(&tts, "hello");
        assert!(url.ends_with("/21m00Tcm4TlvDq8ikWAM"));
        assert_eq!(json["model_id"], "eleven_turbo_v2_5");
        assert_eq!(json["text"], "hello");
    }

    #[tokio::test]
    async fn test_blank_text_is_not_spoken() {
        let tts = TextToSpeech::new(
            TtsProvider::OpenAi,
            Some("sk-test".to_string()),
            ReplyVoice::default_for(TtsProvider::OpenAi),
        )
        .unwrap();
        assert!(Speaker::new(tts).speak("   ").await.is_ok());
    }
}
