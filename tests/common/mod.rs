//! Shared test utilities
//!
//! Fakes for every collaborator the coordinator drives. Timing in these
//! fakes uses `tokio::time`, so tests run with a paused clock.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use remy::camera::{CameraCapture, CaptureResult};
use remy::chat::{ChatRequest, VisionChatService};
use remy::coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorHandle, CoordinatorSettings, Mode, Services,
    TurnKind, TurnReport,
};
use remy::history::{HistoryStore, Message};
use remy::prompt::PromptSet;
use remy::voice::{
    AudioBackend, AudioFrameSource, AudioWindow, Frame, FrameSpec, ListenSettings, RawStream,
    SpeechSynthesisService, StreamGuard, TranscribeError, TranscriptionService,
    WakePhraseDetector,
};
use remy::{Error, Result};

pub const SPEC: FrameSpec = FrameSpec::new(16_000, 512);

/// Amplitude well above the default speech threshold
pub const SPEECH_AMPLITUDE: i16 = 8000;

#[must_use]
pub fn speech_frames(count: usize) -> Vec<Vec<i16>> {
    vec![vec![SPEECH_AMPLITUDE; SPEC.frame_length]; count]
}

#[must_use]
pub fn silence_frames(count: usize) -> Vec<Vec<i16>> {
    vec![vec![0; SPEC.frame_length]; count]
}

/// Frames delivered by one open of [`ScriptedBackend`]
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub frames: Vec<Vec<i16>>,
    /// End the stream after the scripted frames instead of continuing with silence
    pub lose_device: bool,
}

impl Script {
    #[must_use]
    pub fn speech(frames: usize) -> Self {
        Self {
            frames: speech_frames(frames),
            lose_device: false,
        }
    }

    #[must_use]
    pub fn device_lost_after(frames: usize) -> Self {
        Self {
            frames: silence_frames(frames),
            lose_device: true,
        }
    }
}

/// Audio backend playing one queued script per open, silence otherwise
///
/// Frames are paced at real frame duration.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    failing_opens: AtomicUsize,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Script for the next open that has none queued before it
    pub fn queue(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open device streams
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl AudioBackend for ScriptedBackend {
    fn open(&self, spec: FrameSpec) -> Result<RawStream> {
        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::DeviceUnavailable("scripted open failure".to_string()));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();

        let feeder_stop = stop.clone();
        tokio::spawn(async move {
            let period = spec.frame_duration();
            let silence = std::iter::repeat_with(|| vec![0; spec.frame_length]);
            let tail: Box<dyn Iterator<Item = Vec<i16>> + Send> = if script.lose_device {
                Box::new(std::iter::empty())
            } else {
                Box::new(silence)
            };

            for frame in script.frames.into_iter().chain(tail) {
                tokio::select! {
                    () = feeder_stop.cancelled() => return,
                    () = tokio::time::sleep(period) => {}
                }
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        let closes = Arc::clone(&self.closes);
        let live = Arc::clone(&self.live);
        let guard = StreamGuard::new(move || {
            stop.cancel();
            live.fetch_sub(1, Ordering::SeqCst);
            closes.fetch_add(1, Ordering::SeqCst);
        });

        Ok(RawStream { frames: rx, guard })
    }
}

/// Fires the test detector on the next processed frame
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    pending: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl Trigger {
    pub fn fire(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next `count` frames fail to process
    pub fn fail_frames(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Detector that reports a wake phrase whenever its [`Trigger`] fires
pub struct TriggerDetector {
    trigger: Trigger,
    spec: FrameSpec,
}

impl TriggerDetector {
    #[must_use]
    pub fn new(trigger: Trigger, spec: FrameSpec) -> Self {
        Self { trigger, spec }
    }
}

#[async_trait]
impl WakePhraseDetector for TriggerDetector {
    fn frame_length(&self) -> usize {
        self.spec.frame_length
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    async fn process(&mut self, frame: &Frame) -> Result<bool> {
        let decrement = |n: usize| n.checked_sub(1);
        if self
            .trigger
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement)
            .is_ok()
        {
            return Err(Error::WakeWord(format!("frame {} rejected", frame.index)));
        }
        Ok(self
            .trigger
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement)
            .is_ok())
    }

    fn reset(&mut self) {
        self.trigger.pending.store(0, Ordering::SeqCst);
    }
}

/// Transcriber returning a fixed result
pub struct FakeTranscriber {
    result: Mutex<std::result::Result<String, TranscribeError>>,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            result: Mutex::new(Ok(text.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_result(&self, result: std::result::Result<String, TranscribeError>) {
        *self.result.lock().unwrap() = result;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionService for FakeTranscriber {
    async fn transcribe(
        &self,
        window: &AudioWindow,
        _language: &str,
    ) -> std::result::Result<String, TranscribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(!window.samples.is_empty(), "transcriber got an empty window");
        self.result.lock().unwrap().clone()
    }
}

/// One call to [`FakeChat`]
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub kind: TurnKind,
    pub user_prompt: String,
    pub history_len: usize,
    pub had_image: bool,
    pub started: Instant,
    /// `None` if the call was dropped before it finished
    pub finished: Option<Instant>,
}

/// Chat service with per-kind latency
pub struct FakeChat {
    active_system: String,
    active_delay: Mutex<Duration>,
    passive_delay: Mutex<Duration>,
    failing: AtomicBool,
    calls: Mutex<Vec<ChatCall>>,
}

impl FakeChat {
    #[must_use]
    pub fn new(prompts: &PromptSet) -> Self {
        Self {
            active_system: prompts.active_system.clone(),
            active_delay: Mutex::new(Duration::from_millis(100)),
            passive_delay: Mutex::new(Duration::from_millis(100)),
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_active_delay(&self, delay: Duration) {
        *self.active_delay.lock().unwrap() = delay;
    }

    pub fn set_passive_delay(&self, delay: Duration) {
        *self.passive_delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, kind: TurnKind) -> Vec<ChatCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }
}

#[async_trait]
impl VisionChatService for FakeChat {
    async fn complete(&self, request: ChatRequest<'_>) -> Result<String> {
        let kind = if request.system_prompt == self.active_system {
            TurnKind::Active
        } else {
            TurnKind::Passive
        };
        let delay = match kind {
            TurnKind::Active => *self.active_delay.lock().unwrap(),
            TurnKind::Passive => *self.passive_delay.lock().unwrap(),
        };

        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ChatCall {
                kind,
                user_prompt: request.user_prompt.to_string(),
                history_len: request.history.len(),
                had_image: request.image.is_some(),
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };

        tokio::time::sleep(delay).await;
        self.calls.lock().unwrap()[index].finished = Some(Instant::now());

        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Chat("scripted chat failure".to_string()));
        }
        Ok(format!("{kind} reply {}", index + 1))
    }
}

/// Camera returning a tiny fake JPEG
#[derive(Default)]
pub struct FakeCamera {
    captures: AtomicUsize,
    failing: AtomicBool,
}

impl FakeCamera {
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CameraCapture for FakeCamera {
    async fn capture(&self) -> Result<CaptureResult> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("no camera".to_string()));
        }
        Ok(CaptureResult {
            image: vec![0xFF, 0xD8, 0xFF, 0xD9],
            path: format!("statics/uploads/capture_{n}.jpg").into(),
        })
    }
}

/// Speaker that remembers what it was asked to say
#[derive(Default)]
pub struct RecordingSpeaker {
    spoken: Mutex<Vec<String>>,
}

impl RecordingSpeaker {
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesisService for RecordingSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// In-memory history store that can fail on demand
#[derive(Default)]
pub struct FlakyStore {
    saved: Mutex<Vec<Message>>,
    failing_saves: AtomicUsize,
    saves: AtomicUsize,
    corrupt: AtomicBool,
}

impl FlakyStore {
    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            saved: Mutex::new(messages),
            ..Self::default()
        }
    }

    /// Make the next `count` saves fail
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Make loading fail as if the stored file were unreadable
    pub fn set_corrupt(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<Message> {
        self.saved.lock().unwrap().clone()
    }

    /// Successful saves
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl HistoryStore for FlakyStore {
    fn load(&self) -> Result<Vec<Message>> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(Error::Persistence("history file is corrupt".to_string()));
        }
        Ok(self.saved())
    }

    fn save(&self, messages: &[Message]) -> Result<()> {
        if self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Persistence("disk full".to_string()));
        }
        *self.saved.lock().unwrap() = messages.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Everything needed to build a coordinator over fakes
pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub trigger: Trigger,
    pub transcriber: Arc<FakeTranscriber>,
    pub chat: Arc<FakeChat>,
    pub camera: Arc<FakeCamera>,
    pub speaker: Arc<RecordingSpeaker>,
    pub store: Arc<FlakyStore>,
    pub settings: CoordinatorSettings,
}

impl Harness {
    /// Harness with the active loop disabled and short listening limits
    #[must_use]
    pub fn new() -> Self {
        let mut settings = CoordinatorSettings::default();
        settings.active.enabled = false;
        settings.listen = ListenSettings {
            ambient_calibration: Duration::ZERO,
            end_silence: Duration::from_millis(300),
            ..ListenSettings::default()
        };

        Self {
            backend: Arc::new(ScriptedBackend::default()),
            trigger: Trigger::default(),
            transcriber: Arc::new(FakeTranscriber::new("what am I holding")),
            chat: Arc::new(FakeChat::new(&settings.prompts)),
            camera: Arc::new(FakeCamera::default()),
            speaker: Arc::new(RecordingSpeaker::default()),
            store: Arc::new(FlakyStore::default()),
            settings,
        }
    }

    /// Enable the active loop with `interval`
    #[must_use]
    pub fn with_active(mut self, interval: Duration) -> Self {
        self.settings.active.enabled = true;
        self.settings.active.interval = interval;
        self
    }

    /// # Errors
    ///
    /// Whatever [`Coordinator::new`] reports
    pub fn coordinator(&self) -> Result<Coordinator> {
        let services = Services {
            transcriber: self.transcriber.clone(),
            chat: self.chat.clone(),
            camera: self.camera.clone(),
            speaker: Some(self.speaker.clone()),
            history: self.store.clone(),
        };
        let source = AudioFrameSource::new(self.backend.clone(), SPEC);
        let detector = TriggerDetector::new(self.trigger.clone(), SPEC);

        Coordinator::new(self.settings.clone(), source, Box::new(detector), services)
    }

    /// Start the coordinator and wait until it is listening
    pub async fn start(&self) -> Running {
        let coordinator = self.coordinator().expect("coordinator builds");
        let handle = coordinator.handle();
        let events = handle.subscribe();
        let task = tokio::spawn(coordinator.run());

        wait_for_mode(&handle, Mode::Listening).await;
        // Let the hotword loop pick up the stream before anything fires
        tokio::time::sleep(Duration::from_millis(100)).await;

        Running {
            handle,
            events,
            task,
        }
    }

    /// Queue an utterance for the next passive turn and fire the wake trigger
    pub fn say(&self, speech_frames: usize) {
        self.backend.queue(Script::speech(speech_frames));
        self.trigger.fire();
    }
}

/// A coordinator running in a background task
pub struct Running {
    pub handle: CoordinatorHandle,
    pub events: broadcast::Receiver<CoordinatorEvent>,
    pub task: tokio::task::JoinHandle<Result<()>>,
}

impl Running {
    /// Wait for the next event matching `pick`
    pub async fn next_event<T>(&mut self, mut pick: impl FnMut(CoordinatorEvent) -> Option<T>) -> T {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .expect("event did not arrive")
    }

    /// Wait for the next finished turn of `kind`
    pub async fn next_report(&mut self, kind: TurnKind) -> TurnReport {
        self.next_event(|event| match event {
            CoordinatorEvent::TurnFinished(report) if report.kind == kind => Some(report),
            _ => None,
        })
        .await
    }

    /// Wait for the next turn of `kind` to start, returning when it did
    pub async fn next_start(&mut self, kind: TurnKind) -> Instant {
        self.next_event(|event| match event {
            CoordinatorEvent::TurnStarted { kind: started } if started == kind => {
                Some(Instant::now())
            }
            _ => None,
        })
        .await
    }

    /// Request shutdown and wait for `run` to return
    pub async fn stop(&mut self) -> Result<()> {
        self.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(60), &mut self.task)
            .await
            .expect("coordinator stopped")
            .expect("coordinator task")
    }
}

pub async fn wait_for_mode(handle: &CoordinatorHandle, mode: Mode) {
    let mut modes = handle.mode_changes();
    tokio::time::timeout(Duration::from_secs(60), modes.wait_for(|m| *m == mode))
        .await
        .expect("mode reached in time")
        .expect("mode channel open");
}
