//! Remy - wake-phrase vision assistant
//!
//! This library provides the core functionality for Remy:
//! - Periodic camera capture answered by a vision chat model (active mode)
//! - Wake phrase detection, transcription and spoken replies (passive mode)
//! - The activity coordinator that keeps the two from overlapping
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Interfaces                       │
//! │        CLI   │   HTTP status / SSE   │   stdout     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Activity coordinator                  │
//! │   Hotword loop  │  Active loop  │  Passive turns    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Collaborators                       │
//! │   Microphone │ STT │ Camera │ Vision chat │ TTS     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod camera;
pub mod chat;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod history;
pub mod prompt;
pub mod voice;

pub use camera::{CameraCapture, CaptureResult, CommandCamera};
pub use chat::{ChatRequest, OpenAiChatClient, VisionChatService};
pub use config::Config;
pub use coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorHandle, CoordinatorSettings, Mode, Services,
    TurnKind, TurnOutcome, TurnReport,
};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use history::{ChatHistory, HistoryStore, JsonHistoryStore, Message, Role};
pub use prompt::PromptSet;
