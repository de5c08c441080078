//! Daemon - the main assistant service
//!
//! Builds the microphone, wake phrase detector, STT, chat, camera, TTS and
//! history store from the configuration and hands them to the coordinator

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::camera::CommandCamera;
use crate::chat::OpenAiChatClient;
use crate::config::SttProviderKind;
use crate::coordinator::{Coordinator, CoordinatorEvent, Services, TurnOutcome, TurnReport};
use crate::history::JsonHistoryStore;
use crate::voice::{
    AudioFrameSource, CpalBackend, PhraseDetector, Speaker, SpeechSynthesisService, SpeechToText,
    TextToSpeech, TtsProvider,
};
use crate::{Config, Error, Result};

/// The Remy daemon - runs the coordinator until interrupted
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator cannot be built or the microphone is
    /// unavailable
    pub async fn run(self) -> Result<()> {
        let coordinator = self.build_coordinator()?;
        let handle = coordinator.handle();

        // Set up shutdown signal
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                signal_handle.shutdown();
            }
        });

        let printed = CancellationToken::new();
        let printer = tokio::spawn(print_turns(handle.subscribe(), printed.clone()));

        let api = if self.config.api_server.enabled {
            let server = ApiServer::new(handle.clone(), self.config.api_server.port);
            Some(server.spawn().await?)
        } else {
            None
        };

        tracing::info!(
            wake_phrase = %self.config.voice.wake_phrase,
            active = self.config.active.enabled,
            "remy ready"
        );

        let result = coordinator.run().await;

        printed.cancel();
        if let Err(e) = printer.await {
            tracing::warn!(error = %e, "turn printer failed");
        }
        if let Some(api) = api {
            api.stopped().await;
        }

        result
    }

    fn build_coordinator(&self) -> Result<Coordinator> {
        let config = &self.config;

        if let Some(path) = &config.voice.wake_model_path {
            tracing::info!(path = %path.display(), "wake model configured");
        }

        let transcriber = Arc::new(build_transcriber(config)?);
        let detector = PhraseDetector::new(
            vec![config.voice.wake_phrase.clone()],
            transcriber.clone(),
            config.voice.language.clone(),
            config.frame_spec(),
        )
        .with_energy_threshold(config.voice.listen.energy_threshold)
        .with_transcribe_timeout(config.timeouts.transcription);

        let services = Services {
            transcriber,
            chat: Arc::new(build_chat(config)?),
            camera: Arc::new(build_camera(config)),
            speaker: build_speaker(config)?,
            history: Arc::new(JsonHistoryStore::new(&config.history_path)),
        };

        Coordinator::new(
            config.coordinator_settings(),
            build_source(config),
            Box::new(detector),
            services,
        )
    }
}

/// Microphone frame source for the configured input device
#[must_use]
pub fn build_source(config: &Config) -> AudioFrameSource {
    let backend = CpalBackend::with_device(config.voice.input_device.clone());
    AudioFrameSource::new(Arc::new(backend), config.frame_spec())
}

/// Speech-to-text client for the configured provider
///
/// # Errors
///
/// Returns error if the provider's API key is missing
pub fn build_transcriber(config: &Config) -> Result<SpeechToText> {
    let voice = &config.voice;
    match voice.stt_provider {
        SttProviderKind::Whisper => SpeechToText::new_whisper(
            config.api_keys.openai.clone().unwrap_or_default(),
            voice.stt_model.clone(),
        ),
        SttProviderKind::Deepgram => SpeechToText::new_deepgram(
            config.api_keys.deepgram.clone().unwrap_or_default(),
            voice.stt_model.clone(),
        ),
    }
}

/// Vision chat client for the configured endpoint
///
/// # Errors
///
/// Returns error if no chat API key is configured
pub fn build_chat(config: &Config) -> Result<OpenAiChatClient> {
    let key = config
        .api_keys
        .chat_key()
        .ok_or_else(|| Error::Config("chat API key required".to_string()))?;

    let mut client = OpenAiChatClient::new(key.to_string(), config.chat.model.clone())?
        .with_url(config.chat.url.clone());
    if let Some(max_tokens) = config.chat.max_tokens {
        client = client.with_max_tokens(max_tokens);
    }

    tracing::info!(url = %config.chat.url, model = %config.chat.model, "chat client initialized");
    Ok(client)
}

#[must_use]
pub fn build_camera(config: &Config) -> CommandCamera {
    CommandCamera::new(
        config.camera.program.clone(),
        config.camera.args.clone(),
        config.camera.upload_dir.clone(),
    )
}

/// Text-to-speech engine for the configured provider
///
/// # Errors
///
/// Returns error if the provider's API key is missing
pub fn build_tts(config: &Config) -> Result<TextToSpeech> {
    let provider = config.voice.tts_provider;
    let api_key = match provider {
        TtsProvider::OpenAi => config.api_keys.openai.clone(),
        TtsProvider::ElevenLabs => config.api_keys.elevenlabs.clone(),
    };
    TextToSpeech::new(provider, api_key, config.reply_voice())
}

/// Speaker for passive replies, or `None` when replies are only printed
fn build_speaker(config: &Config) -> Result<Option<Arc<dyn SpeechSynthesisService>>> {
    if !config.voice.speak_replies {
        return Ok(None);
    }

    match build_tts(config) {
        Ok(tts) => Ok(Some(Arc::new(Speaker::new(tts)))),
        Err(Error::Config(reason)) => {
            tracing::warn!(%reason, "speech output disabled");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Print every finished turn to stdout until `done` is cancelled
///
/// Events already queued when `done` fires are still printed.
async fn print_turns(mut events: broadcast::Receiver<CoordinatorEvent>, done: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            () = done.cancelled() => break,
        };

        match event {
            Ok(CoordinatorEvent::TurnFinished(report)) => println!("{}", format_report(&report)),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "turn printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One-line summary of a finished turn
#[must_use]
pub fn format_report(report: &TurnReport) -> String {
    let heard = report
        .heard
        .as_deref()
        .map(|text| format!(" \"{text}\""))
        .unwrap_or_default();

    match &report.outcome {
        TurnOutcome::Completed(reply) => format!("[{}]{heard} -> {reply}", report.kind),
        TurnOutcome::NoSpeech => format!("[{}] no speech", report.kind),
        TurnOutcome::Unintelligible => format!("[{}] could not understand the request", report.kind),
        TurnOutcome::ServiceError(detail) => format!("[{}]{heard} failed: {detail}", report.kind),
        TurnOutcome::Aborted => format!("[{}]{heard} aborted", report.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TurnKind;

    #[test]
    fn test_format_report() {
        let completed = TurnReport {
            kind: TurnKind::Passive,
            heard: Some("what is this".to_string()),
            outcome: TurnOutcome::Completed("a cup".to_string()),
        };
        assert_eq!(format_report(&completed), "[passive] \"what is this\" -> a cup");

        let silent = TurnReport {
            kind: TurnKind::Passive,
            heard: None,
            outcome: TurnOutcome::NoSpeech,
        };
        assert_eq!(format_report(&silent), "[passive] no speech");

        let failed = TurnReport {
            kind: TurnKind::Active,
            heard: None,
            outcome: TurnOutcome::ServiceError("camera: timed out".to_string()),
        };
        assert_eq!(format_report(&failed), "[active] failed: camera: timed out");
    }
}
