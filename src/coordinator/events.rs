//! Turn outcomes and the coordinator event stream

use std::fmt;

use serde::Serialize;

use super::mode::Mode;

/// Which sequence a turn ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Triggered by the wake phrase
    Passive,
    /// Periodic, unprompted
    Active,
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passive => "passive",
            Self::Active => "active",
        })
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The chat service replied
    Completed(String),
    /// Nothing was said before the listening window closed
    NoSpeech,
    /// Speech was heard but not understood
    Unintelligible,
    /// An external call failed; history is unchanged
    ServiceError(String),
    /// Shutdown interrupted the turn
    Aborted,
}

impl TurnOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Reply text for completed turns
    #[must_use]
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Completed(reply) => Some(reply),
            _ => None,
        }
    }
}

/// Everything a presentation layer needs about a finished turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReport {
    pub kind: TurnKind,
    /// What the user said, for passive turns that got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heard: Option<String>,
    pub outcome: TurnOutcome,
}

/// Wake phrase detected on a listening stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WakeDetectionEvent {
    /// Id of the stream the frame came from
    pub stream: u64,
    /// Index of the detecting frame within that stream
    pub frame: u64,
}

/// Messages from the hotword loop to the coordinator
#[derive(Debug, Clone)]
pub(crate) enum HotwordSignal {
    Wake(WakeDetectionEvent),
    /// The listening stream stopped delivering audio
    DeviceLost { stream: u64, error: String },
}

/// Why a wake detection was not served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The stream it came from is no longer the listening stream
    StaleStream,
    /// A passive turn is already pending or running
    PassivePending,
    ShuttingDown,
}

/// Push-only notifications for presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    ModeChanged { mode: Mode },
    WakeDetected { stream: u64, frame: u64 },
    WakeDropped { frame: u64, reason: DropReason },
    TurnStarted { kind: TurnKind },
    TurnFinished(TurnReport),
}
