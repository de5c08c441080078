//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::capture::samples_to_wav;
use crate::{Error, Result};

/// A recorded span of audio handed to transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioWindow {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioWindow {
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }

    /// Encode as 16-bit mono WAV
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, self.sample_rate)
    }
}

/// Why a window produced no transcript
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscribeError {
    #[error("no speech before the listening timeout")]
    Timeout,

    #[error("speech could not be understood")]
    Unintelligible,

    #[error("transcription service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Per-request bound on the transcription HTTP call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Turns recorded speech into text
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Transcribe `window`, spoken in `language` (e.g. `zh-CN`)
    ///
    /// # Errors
    ///
    /// `Unintelligible` when the service heard nothing it could transcribe,
    /// `ServiceUnavailable` when the service could not be reached or failed
    async fn transcribe(
        &self,
        window: &AudioWindow,
        language: &str,
    ) -> std::result::Result<String, TranscribeError>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SttProvider {
    Whisper,
    Deepgram,
}

/// Transcribes speech to text over HTTP
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: String,
    model: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            provider: SttProvider::Whisper,
        })
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            provider: SttProvider::Deepgram,
        })
    }

    /// Transcribe WAV audio to text
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    pub async fn transcribe_wav(&self, audio: &[u8], language: &str) -> Result<String> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(audio, language).await,
            SttProvider::Deepgram => self.transcribe_deepgram(audio, language).await,
        }
    }

    async fn transcribe_whisper(&self, audio: &[u8], language: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", whisper_language(language).to_string());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, audio: &[u8], language: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&language={language}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[async_trait]
impl TranscriptionService for SpeechToText {
    async fn transcribe(
        &self,
        window: &AudioWindow,
        language: &str,
    ) -> std::result::Result<String, TranscribeError> {
        let wav = window
            .to_wav()
            .map_err(|e| TranscribeError::ServiceUnavailable(e.to_string()))?;

        let transcript = self
            .transcribe_wav(&wav, language)
            .await
            .map_err(|e| TranscribeError::ServiceUnavailable(e.to_string()))?;

        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(TranscribeError::Unintelligible);
        }
        Ok(transcript.to_string())
    }
}

/// Whisper only takes the ISO-639-1 part of a locale (`zh-CN` -> `zh`)
fn whisper_language(language: &str) -> &str {
    language.split(['-', '_']).next().unwrap_or(language)
}
