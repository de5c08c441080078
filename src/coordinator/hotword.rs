//! Hotword loop: listening stream -> wake phrase detector -> coordinator

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::Shared;
use super::events::{CoordinatorEvent, DropReason, HotwordSignal, WakeDetectionEvent};
use crate::Error;
use crate::voice::{FrameHandle, WakePhraseDetector};

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut detector: Box<dyn WakePhraseDetector>,
    signals: mpsc::Sender<HotwordSignal>,
) {
    let mut listening = shared.listening.subscribe();
    let mut last_stream = None;

    loop {
        let current = listening.borrow_and_update().clone();
        let handle = match current {
            Some(handle) if Some(handle.id()) != last_stream => handle,
            _ => {
                tokio::select! {
                    () = shared.shutdown.cancelled() => break,
                    changed = listening.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
        };

        last_stream = Some(handle.id());
        detector.reset();
        tracing::debug!(stream = handle.id(), "hotword detection started");

        if !detect_on(&shared, detector.as_mut(), &handle, &signals).await {
            break;
        }
        tracing::debug!(stream = handle.id(), "hotword detection paused");
    }

    tracing::debug!("hotword loop stopped");
}

/// Feed frames from `handle` to the detector until the stream closes
///
/// Returns false when the loop should stop altogether.
async fn detect_on(
    shared: &Shared,
    detector: &mut dyn WakePhraseDetector,
    handle: &FrameHandle,
    signals: &mpsc::Sender<HotwordSignal>,
) -> bool {
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => return false,
            frame = shared.source.read(handle) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::StreamClosed) => return true,
            Err(e) => {
                let lost = HotwordSignal::DeviceLost {
                    stream: handle.id(),
                    error: e.to_string(),
                };
                return tokio::select! {
                    () = shared.shutdown.cancelled() => false,
                    sent = signals.send(lost) => sent.is_ok(),
                };
            }
        };

        let detected = tokio::select! {
            () = shared.shutdown.cancelled() => return false,
            detected = detector.process(&frame) => detected,
        };

        match detected {
            Ok(true) => {
                let event = WakeDetectionEvent {
                    stream: handle.id(),
                    frame: frame.index,
                };
                match signals.try_send(HotwordSignal::Wake(event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(frame = frame.index, "wake already pending, dropping");
                        shared.emit(CoordinatorEvent::WakeDropped {
                            frame: frame.index,
                            reason: DropReason::PassivePending,
                        });
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    stream = handle.id(),
                    frame = frame.index,
                    error = %e,
                    "wake detector failed, skipping frame"
                );
            }
        }
    }
}
