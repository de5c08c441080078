//! Session mode with compare-and-transition updates

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::events::CoordinatorEvent;

/// What the session is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    Listening = 1,
    ActiveRunning = 2,
    PassiveRunning = 3,
    ShuttingDown = 4,
}

impl Mode {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Listening,
            2 => Self::ActiveRunning,
            3 => Self::PassiveRunning,
            4 => Self::ShuttingDown,
            _ => Self::Idle,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::ActiveRunning => "active_running",
            Self::PassiveRunning => "passive_running",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic mode cell
///
/// Every change goes through a compare-and-swap so two callers can never
/// both win the same transition. `ShuttingDown` is terminal. Changes are
/// mirrored to a watch channel for waiters and to the event stream.
pub(crate) struct ModeCell {
    state: AtomicU8,
    watch: watch::Sender<Mode>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl ModeCell {
    pub(crate) fn new(events: broadcast::Sender<CoordinatorEvent>) -> Self {
        Self {
            state: AtomicU8::new(Mode::Idle as u8),
            watch: watch::Sender::new(Mode::Idle),
            events,
        }
    }

    pub(crate) fn get(&self) -> Mode {
        Mode::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Mode> {
        self.watch.subscribe()
    }

    /// Move from `from` to `to`; false if the mode was something else
    pub(crate) fn transition(&self, from: Mode, to: Mode) -> bool {
        if from == Mode::ShuttingDown {
            return false;
        }
        let won = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.publish(from, to);
        }
        won
    }

    /// Enter `ShuttingDown` from any mode, returning the previous mode
    pub(crate) fn shut_down(&self) -> Mode {
        let previous = Mode::from_u8(self.state.swap(Mode::ShuttingDown as u8, Ordering::AcqRel));
        if previous != Mode::ShuttingDown {
            self.publish(previous, Mode::ShuttingDown);
        }
        previous
    }

    fn publish(&self, from: Mode, to: Mode) {
        tracing::debug!(from = %from, to = %to, "mode changed");
        // Read the cell under the watch lock so racing publishers settle on
        // the latest value
        self.watch.send_if_modified(|current| {
            let now = Mode::from_u8(self.state.load(Ordering::Acquire));
            let changed = *current != now;
            *current = now;
            changed
        });
        let _ = self.events.send(CoordinatorEvent::ModeChanged { mode: to });
    }
}
