//! Plain settings consumed by the coordinator

use std::time::Duration;

use crate::prompt::PromptSet;
use crate::voice::ListenSettings;

/// Periodic capture-and-query loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSettings {
    pub enabled: bool,
    /// Wait between iterations
    pub interval: Duration,
    /// Whether active exchanges are appended to the chat history
    pub persist_history: bool,
}

impl Default for ActiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(2),
            persist_history: false,
        }
    }
}

/// Bounds on every external call and on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub chat: Duration,
    pub camera: Duration,
    pub transcription: Duration,
    pub synthesis: Duration,
    /// How long a wake event waits for an in-flight active turn
    pub preempt: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(30),
            camera: Duration::from_secs(10),
            transcription: Duration::from_secs(15),
            synthesis: Duration::from_secs(15),
            preempt: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Reopening the microphone after it was lost mid-run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubles each time
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Backoff is capped here
    pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

    /// Delay after the given failed attempt (1-based)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(Self::MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Language code passed to transcription
    pub language: String,
    pub listen: ListenSettings,
    pub active: ActiveSettings,
    /// History messages sent with each chat request
    pub history_window: usize,
    pub prompts: PromptSet,
    pub timeouts: Timeouts,
    pub device_retry: RetryPolicy,
    /// Speak passive replies through the synthesis service
    pub speak_replies: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            language: "zh-CN".to_string(),
            listen: ListenSettings::default(),
            active: ActiveSettings::default(),
            history_window: 20,
            prompts: PromptSet::default(),
            timeouts: Timeouts::default(),
            device_retry: RetryPolicy::default(),
            speak_replies: true,
        }
    }
}
