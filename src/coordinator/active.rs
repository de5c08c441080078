//! Active loop: periodic photo and chat query while nobody is talking

use std::sync::Arc;

use tokio::sync::watch;

use super::events::{CoordinatorEvent, TurnKind, TurnOutcome, TurnReport};
use super::mode::Mode;
use super::Shared;
use crate::chat::ChatRequest;
use crate::history::ChatHistory;

pub(crate) async fn run(shared: Arc<Shared>) {
    let interval = shared.settings.active.interval;
    let mut mode = shared.mode.subscribe();
    let mut pause = shared.pause.subscribe();

    tracing::debug!(interval_ms = interval.as_millis(), "active loop started");

    loop {
        if !wait_until_listening(&shared, &mut mode, &mut pause).await {
            break;
        }

        // A pause while waiting restarts the interval from zero afterwards
        let paused = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => false,
            () = wait_for_pause(&mut pause) => true,
        };
        if paused {
            continue;
        }

        let mut history = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            guard = shared.turn_lock.lock() => guard,
        };
        if *pause.borrow() || !shared.mode.transition(Mode::Listening, Mode::ActiveRunning) {
            continue;
        }

        let abandon = shared.begin_active_turn();
        shared.emit(CoordinatorEvent::TurnStarted {
            kind: TurnKind::Active,
        });

        let outcome = tokio::select! {
            outcome = turn(&shared, &mut history) => outcome,
            () = abandon.cancelled() => TurnOutcome::Aborted,
        };

        shared.end_active_turn();
        shared.mode.transition(Mode::ActiveRunning, Mode::Listening);
        drop(history);

        shared.report(TurnReport {
            kind: TurnKind::Active,
            heard: None,
            outcome,
        });
    }

    tracing::debug!("active loop stopped");
}

/// Wait until the mode is `Listening` with no passive turn pending
///
/// Returns false on shutdown.
async fn wait_until_listening(
    shared: &Shared,
    mode: &mut watch::Receiver<Mode>,
    pause: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if shared.is_shutting_down() {
            return false;
        }
        let paused = *pause.borrow_and_update();
        let current = *mode.borrow_and_update();
        if !paused && current == Mode::Listening {
            return true;
        }

        tokio::select! {
            () = shared.shutdown.cancelled() => return false,
            _ = mode.changed() => {}
            _ = pause.changed() => {}
        }
    }
}

async fn wait_for_pause(pause: &mut watch::Receiver<bool>) {
    let _ = pause.wait_for(|paused| *paused).await;
}

/// One iteration: photo, fixed prompt, optional history record
async fn turn(shared: &Shared, history: &mut ChatHistory) -> TurnOutcome {
    let capture = match shared.capture_photo().await {
        Ok(capture) => capture,
        Err(detail) => return TurnOutcome::ServiceError(detail),
    };
    if shared.is_shutting_down() {
        return TurnOutcome::Aborted;
    }

    let prompts = &shared.settings.prompts;
    let request = ChatRequest {
        system_prompt: &prompts.active_system,
        user_prompt: &prompts.active_user,
        image: Some(&capture.image),
        history: history.recent(shared.settings.history_window),
    };
    let reply = match shared.ask(request).await {
        Ok(reply) => reply,
        Err(detail) => return TurnOutcome::ServiceError(detail),
    };

    if shared.settings.active.persist_history {
        shared.record_exchange(history, prompts.active_user.clone(), reply.clone());
    }
    TurnOutcome::Completed(reply)
}
