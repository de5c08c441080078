//! Passive turn: record a spoken request and answer it with a photo

use super::Shared;
use super::events::{TurnKind, TurnOutcome, TurnReport};
use crate::Error;
use crate::chat::ChatRequest;
use crate::history::ChatHistory;
use crate::voice::{TranscribeError, Utterance, record_utterance};

/// Run one passive turn; the caller holds the turn lock and has closed the
/// listening stream
pub(crate) async fn run(shared: &Shared, history: &mut ChatHistory) -> TurnReport {
    let mut heard = None;
    let outcome = serve(shared, history, &mut heard).await;
    TurnReport {
        kind: TurnKind::Passive,
        heard,
        outcome,
    }
}

async fn serve(
    shared: &Shared,
    history: &mut ChatHistory,
    heard: &mut Option<String>,
) -> TurnOutcome {
    let settings = &shared.settings;
    if shared.is_shutting_down() {
        return TurnOutcome::Aborted;
    }

    let (source, listen) = (&shared.source, &settings.listen);
    let recorded = shared
        .retry_device("record request", move || record_utterance(source, listen))
        .await;
    let window = match recorded {
        None => return TurnOutcome::Aborted,
        Some(Ok(Utterance::Speech(window))) => window,
        Some(Ok(Utterance::Silence)) => return TurnOutcome::NoSpeech,
        Some(Err(e)) => return TurnOutcome::ServiceError(format!("microphone: {e}")),
    };
    if shared.is_shutting_down() {
        return TurnOutcome::Aborted;
    }

    tracing::debug!(duration_ms = window.duration().as_millis(), "transcribing request");
    let transcription = tokio::time::timeout(
        settings.timeouts.transcription,
        shared.services.transcriber.transcribe(&window, &settings.language),
    )
    .await;
    let text = match transcription {
        Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(Ok(_) | Err(TranscribeError::Unintelligible)) => return TurnOutcome::Unintelligible,
        Ok(Err(TranscribeError::Timeout)) => return TurnOutcome::NoSpeech,
        Ok(Err(TranscribeError::ServiceUnavailable(detail))) => {
            return TurnOutcome::ServiceError(format!("transcription: {detail}"));
        }
        Err(_) => return TurnOutcome::ServiceError(Error::Timeout("transcription").to_string()),
    };
    tracing::info!(transcript = %text, "heard request");
    *heard = Some(text.clone());
    if shared.is_shutting_down() {
        return TurnOutcome::Aborted;
    }

    let capture = match shared.capture_photo().await {
        Ok(capture) => capture,
        Err(detail) => return TurnOutcome::ServiceError(detail),
    };
    tracing::debug!(path = %capture.path.display(), "photo attached");
    if shared.is_shutting_down() {
        return TurnOutcome::Aborted;
    }

    let prompts = &settings.prompts;
    let user_prompt = prompts.passive_user_prompt(&text);
    let request = ChatRequest {
        system_prompt: &prompts.passive_system,
        user_prompt: &user_prompt,
        image: Some(&capture.image),
        history: history.recent(settings.history_window),
    };
    let reply = match shared.ask(request).await {
        Ok(reply) => reply,
        Err(detail) => return TurnOutcome::ServiceError(detail),
    };

    shared.record_exchange(history, text, reply.clone());
    TurnOutcome::Completed(reply)
}
