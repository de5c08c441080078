//! Activity coordinator
//!
//! The coordinator owns the microphone and decides which activity may use
//! it and the chat history at any moment:
//!
//! - the hotword loop reads frames from the listening stream and reports
//!   wake detections
//! - the active loop periodically captures a photo and asks the chat service
//!   about it
//! - a passive turn runs once per served wake detection: record a request,
//!   transcribe it, capture a photo, ask the chat service, save and speak the
//!   reply
//!
//! Active and passive turn bodies both run under a single turn lock that
//! guards the [`ChatHistory`], so they never overlap. The [`Mode`] is only
//! changed by compare-and-transition. A wake detection pauses the active
//! loop, closes the listening stream, takes the turn lock (abandoning an
//! active turn that does not yield within the preempt timeout), runs the
//! passive turn inline and then reopens the stream and resumes the active
//! loop with a fresh interval.

mod active;
mod events;
mod hotword;
mod mode;
mod passive;
mod settings;

pub use events::{CoordinatorEvent, DropReason, TurnKind, TurnOutcome, TurnReport};
pub use mode::Mode;
pub use settings::{ActiveSettings, CoordinatorSettings, RetryPolicy, Timeouts};

use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraCapture, CaptureResult};
use crate::chat::{ChatRequest, VisionChatService};
use crate::history::{ChatHistory, HistoryStore, Message};
use crate::voice::{
    AudioFrameSource, FrameHandle, SourceStats, SpeechSynthesisService, TranscriptionService,
    WakePhraseDetector, check_compatible,
};
use crate::{Error, Result};
use events::{HotwordSignal, WakeDetectionEvent};
use mode::ModeCell;

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 64;

/// Spoken when a passive request could not be understood
const UNINTELLIGIBLE_NOTICE: &str = "Sorry, I didn't catch that.";

/// External capabilities the coordinator drives
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn TranscriptionService>,
    pub chat: Arc<dyn VisionChatService>,
    pub camera: Arc<dyn CameraCapture>,
    /// Passive replies are only printed when absent
    pub speaker: Option<Arc<dyn SpeechSynthesisService>>,
    pub history: Arc<dyn HistoryStore>,
}

/// State shared between the coordinator and its background tasks
pub(crate) struct Shared {
    settings: CoordinatorSettings,
    services: Services,
    source: AudioFrameSource,
    mode: ModeCell,
    /// The turn lock; whoever holds it may touch history, camera and chat
    turn_lock: Mutex<ChatHistory>,
    history_view: watch::Sender<Vec<Message>>,
    events: broadcast::Sender<CoordinatorEvent>,
    shutdown: CancellationToken,
    /// Set while a passive turn is pending or running
    pause: watch::Sender<bool>,
    /// Stream the hotword loop reads from
    listening: watch::Sender<Option<FrameHandle>>,
    active_turn: std::sync::Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    /// Set the pause flag; false if it was already set
    fn request_pause(&self) -> bool {
        self.pause.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        })
    }

    fn clear_pause(&self) {
        self.pause.send_replace(false);
    }

    fn listening_stream(&self) -> Option<u64> {
        self.listening.borrow().as_ref().map(FrameHandle::id)
    }

    fn close_listening(&self) {
        if let Some(handle) = self.listening.send_replace(None) {
            self.source.close(&handle);
        }
    }

    fn begin_active_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    fn end_active_turn(&self) {
        self.active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Cancel the in-flight active turn, if any
    fn abandon_active_turn(&self) -> bool {
        let token = self
            .active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        token.map(|t| t.cancel()).is_some()
    }

    /// Take the turn lock for a passive turn
    ///
    /// An active turn holding the lock gets `preempt` to finish its current
    /// call before it is abandoned.
    async fn lock_for_passive(&self) -> MutexGuard<'_, ChatHistory> {
        if let Ok(guard) = self.turn_lock.try_lock() {
            return guard;
        }

        let preempt = self.settings.timeouts.preempt;
        tracing::debug!(timeout_ms = preempt.as_millis(), "waiting for active turn to yield");
        if let Ok(guard) = tokio::time::timeout(preempt, self.turn_lock.lock()).await {
            return guard;
        }

        if self.abandon_active_turn() {
            tracing::warn!("active turn did not yield in time, abandoning it");
        }
        self.turn_lock.lock().await
    }

    /// Run `op` again with exponential backoff while it fails with
    /// `DeviceUnavailable`
    ///
    /// Returns `None` if shutdown was requested during a backoff.
    async fn retry_device<T, F>(
        &self,
        action: &'static str,
        mut op: impl FnMut() -> F,
    ) -> Option<Result<T>>
    where
        F: Future<Output = Result<T>>,
    {
        let retry = self.settings.device_retry;
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Err(e) if attempt < attempts && e.is_device_unavailable() => {
                    let delay = retry.delay_after(attempt);
                    tracing::warn!(
                        action,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "microphone unavailable, retrying"
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                result => return Some(result),
            }
        }
    }

    async fn capture_photo(&self) -> std::result::Result<CaptureResult, String> {
        match tokio::time::timeout(self.settings.timeouts.camera, self.services.camera.capture())
            .await
        {
            Ok(Ok(capture)) => Ok(capture),
            Ok(Err(e)) => Err(format!("camera: {e}")),
            Err(_) => Err(Error::Timeout("camera capture").to_string()),
        }
    }

    async fn ask(&self, request: ChatRequest<'_>) -> std::result::Result<String, String> {
        match tokio::time::timeout(self.settings.timeouts.chat, self.services.chat.complete(request))
            .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(Error::Timeout("chat request").to_string()),
        }
    }

    /// Append an exchange and flush it; a failed flush keeps it in memory
    fn record_exchange(&self, history: &mut ChatHistory, user: String, reply: String) {
        history.push_exchange(user, reply);
        self.history_view.send_replace(history.messages().to_vec());
        self.flush_history(history);
    }

    fn flush_history(&self, history: &mut ChatHistory) {
        if let Err(e) = history.flush(self.services.history.as_ref()) {
            tracing::warn!(
                error = %e,
                messages = history.len(),
                "failed to save chat history, keeping it for the next flush"
            );
        }
    }

    /// Log, announce and (for passive turns) speak a finished turn, once
    fn report(&self, report: TurnReport) {
        let kind = report.kind;
        match &report.outcome {
            TurnOutcome::Completed(reply) => tracing::info!(kind = %kind, reply = %reply, "turn completed"),
            TurnOutcome::NoSpeech => tracing::info!(kind = %kind, "no speech heard"),
            TurnOutcome::Unintelligible => tracing::info!(kind = %kind, "speech not understood"),
            TurnOutcome::ServiceError(detail) => {
                tracing::warn!(kind = %kind, detail = %detail, "turn failed");
            }
            TurnOutcome::Aborted => tracing::warn!(kind = %kind, "turn aborted"),
        }

        if kind == TurnKind::Passive && self.settings.speak_replies {
            match &report.outcome {
                TurnOutcome::Completed(reply) => self.speak(reply.clone()),
                TurnOutcome::Unintelligible => self.speak(UNINTELLIGIBLE_NOTICE.to_string()),
                _ => {}
            }
        }

        self.emit(CoordinatorEvent::TurnFinished(report));
    }

    /// Fire-and-forget speech, bounded by the synthesis timeout
    fn speak(&self, text: String) {
        let Some(speaker) = self.services.speaker.clone() else {
            return;
        };
        let limit = self.settings.timeouts.synthesis;

        tokio::spawn(async move {
            match tokio::time::timeout(limit, speaker.speak(&text)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to speak reply"),
                Err(_) => tracing::warn!("speaking reply timed out"),
            }
        });
    }
}

/// Cloneable view of a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Arc<Shared>,
}

impl CoordinatorHandle {
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.shared.mode.get()
    }

    /// Watch mode changes
    #[must_use]
    pub fn mode_changes(&self) -> watch::Receiver<Mode> {
        self.shared.mode.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn source_stats(&self) -> SourceStats {
        self.shared.source.stats()
    }

    /// The conversation as of the last recorded turn
    #[must_use]
    pub fn history_snapshot(&self) -> Vec<Message> {
        self.shared.history_view.borrow().clone()
    }

    /// Ask the coordinator to shut down; `run` returns once it has
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Resolves once shutdown has been requested
    pub async fn stopped(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

/// The activity coordinator
pub struct Coordinator {
    shared: Arc<Shared>,
    detector: Option<Box<dyn WakePhraseDetector>>,
    signals: mpsc::Sender<HotwordSignal>,
    incoming: mpsc::Receiver<HotwordSignal>,
    shutdown_deadline: Option<Instant>,
}

impl Coordinator {
    /// Create a coordinator; nothing is opened until [`Coordinator::run`]
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the detector does not accept the source's
    /// frames, or a persistence error if the stored history cannot be read
    pub fn new(
        settings: CoordinatorSettings,
        source: AudioFrameSource,
        detector: Box<dyn WakePhraseDetector>,
        services: Services,
    ) -> Result<Self> {
        check_compatible(detector.as_ref(), source.spec())?;

        let history = ChatHistory::load(services.history.as_ref())?;
        tracing::info!(messages = history.len(), "chat history loaded");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (signals, incoming) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            mode: ModeCell::new(events.clone()),
            history_view: watch::Sender::new(history.messages().to_vec()),
            turn_lock: Mutex::new(history),
            events,
            shutdown: CancellationToken::new(),
            pause: watch::Sender::new(false),
            listening: watch::Sender::new(None),
            active_turn: std::sync::Mutex::new(None),
            settings,
            services,
            source,
        });

        Ok(Self {
            shared,
            detector: Some(detector),
            signals,
            incoming,
            shutdown_deadline: None,
        })
    }

    #[must_use]
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run until shutdown is requested
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the microphone cannot be opened
    /// at startup (the mode stays `Idle`) or cannot be reopened mid-run
    pub async fn run(mut self) -> Result<()> {
        if self.shared.is_shutting_down() {
            return Ok(());
        }

        self.start()?;

        let mut tasks = Vec::with_capacity(2);
        if let Some(detector) = self.detector.take() {
            tasks.push(tokio::spawn(hotword::run(
                Arc::clone(&self.shared),
                detector,
                self.signals.clone(),
            )));
        }
        if self.shared.settings.active.enabled {
            tasks.push(tokio::spawn(active::run(Arc::clone(&self.shared))));
        }

        let result = self.serve().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "coordinator failed");
        }
        self.finish(tasks).await;
        result
    }

    fn start(&self) -> Result<()> {
        let handle = self.shared.source.open().inspect_err(|e| {
            tracing::error!(error = %e, "failed to open microphone");
        })?;
        tracing::info!(stream = handle.id(), "microphone open, listening");

        self.shared.listening.send_replace(Some(handle));
        self.shared.mode.transition(Mode::Idle, Mode::Listening);
        Ok(())
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let signal = tokio::select! {
                biased;
                () = self.shared.shutdown.cancelled() => return Ok(()),
                signal = self.incoming.recv() => signal,
            };

            match signal {
                Some(HotwordSignal::Wake(event)) => self.serve_wake(event).await?,
                Some(HotwordSignal::DeviceLost { stream, error }) => {
                    self.recover_listening(stream, &error).await?;
                }
                None => return Ok(()),
            }
        }
    }

    async fn serve_wake(&mut self, event: WakeDetectionEvent) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        shared.emit(CoordinatorEvent::WakeDetected {
            stream: event.stream,
            frame: event.frame,
        });

        if shared.listening_stream() != Some(event.stream) {
            tracing::debug!(stream = event.stream, frame = event.frame, "dropping wake from closed stream");
            shared.emit(CoordinatorEvent::WakeDropped {
                frame: event.frame,
                reason: DropReason::StaleStream,
            });
            return Ok(());
        }
        if !shared.request_pause() {
            shared.emit(CoordinatorEvent::WakeDropped {
                frame: event.frame,
                reason: DropReason::PassivePending,
            });
            return Ok(());
        }

        tracing::info!(stream = event.stream, frame = event.frame, "wake phrase detected");

        // The passive turn opens the microphone itself
        shared.close_listening();

        let mut history = shared.lock_for_passive().await;
        if !shared.mode.transition(Mode::Listening, Mode::PassiveRunning) {
            drop(history);
            shared.clear_pause();
            shared.emit(CoordinatorEvent::WakeDropped {
                frame: event.frame,
                reason: DropReason::ShuttingDown,
            });
            return Ok(());
        }
        shared.emit(CoordinatorEvent::TurnStarted {
            kind: TurnKind::Passive,
        });

        let report = {
            let turn = passive::run(&shared, &mut history);
            tokio::pin!(turn);

            tokio::select! {
                report = &mut turn => report,
                () = shared.shutdown.cancelled() => {
                    let deadline = self.shutdown_deadline();
                    match tokio::time::timeout_at(deadline, &mut turn).await {
                        Ok(report) => report,
                        Err(_) => {
                            tracing::warn!("passive turn abandoned after shutdown grace period");
                            TurnReport {
                                kind: TurnKind::Passive,
                                heard: None,
                                outcome: TurnOutcome::Aborted,
                            }
                        }
                    }
                }
            }
        };
        shared.report(report);
        drop(history);

        if shared.is_shutting_down() {
            return Ok(());
        }

        self.reopen_listening().await?;
        shared.mode.transition(Mode::PassiveRunning, Mode::Listening);
        shared.clear_pause();
        Ok(())
    }

    async fn recover_listening(&self, stream: u64, error: &str) -> Result<()> {
        if self.shared.listening_stream() != Some(stream) {
            return Ok(());
        }
        tracing::warn!(stream, error, "microphone stream lost, reopening");
        self.shared.close_listening();
        self.reopen_listening().await
    }

    /// Open a new listening stream, retrying with exponential backoff
    async fn reopen_listening(&self) -> Result<()> {
        let shared = &self.shared;
        let opened = shared
            .retry_device("reopen microphone", move || async move { shared.source.open() })
            .await;

        match opened {
            // Shutdown interrupted the backoff
            None => Ok(()),
            Some(Ok(handle)) => {
                tracing::debug!(stream = handle.id(), "listening stream reopened");
                shared.listening.send_replace(Some(handle));
                Ok(())
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "giving up on microphone");
                Err(e)
            }
        }
    }

    fn shutdown_deadline(&mut self) -> Instant {
        let grace = self.shared.settings.timeouts.shutdown_grace;
        *self
            .shutdown_deadline
            .get_or_insert_with(|| Instant::now() + grace)
    }

    async fn finish(&mut self, tasks: Vec<JoinHandle<()>>) {
        let shared = Arc::clone(&self.shared);
        let previous = shared.mode.shut_down();
        shared.shutdown.cancel();
        let deadline = self.shutdown_deadline();
        tracing::info!(from = %previous, "shutting down");

        shared.close_listening();

        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("background task did not stop within the grace period, aborting it");
                task.abort();
                let _ = task.await;
            }
        }

        if let Some(stream) = shared.source.close_active() {
            tracing::warn!(stream, "force-closed audio stream");
        }

        let history = match shared.turn_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => tokio::time::timeout_at(deadline, shared.turn_lock.lock())
                .await
                .ok(),
        };
        match history {
            Some(mut history) => shared.flush_history(&mut history),
            None => tracing::warn!("turn lock still held, chat history not flushed"),
        }

        let stats = shared.source.stats();
        tracing::info!(opens = stats.opens, closes = stats.closes, "coordinator stopped");
    }
}
