//! Exclusive access to the microphone
//!
//! [`AudioFrameSource`] wraps an [`AudioBackend`] so that at most one input
//! stream is open at any time. Each successful [`AudioFrameSource::open`]
//! hands out a [`FrameHandle`]; the stream stays open until that handle is
//! closed. Reads block until a frame arrives and fail with
//! [`Error::StreamClosed`] once the handle has been closed, even if the close
//! happens while a read is pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Shape of the frames a stream delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub sample_rate: u32,
    /// Samples per frame (mono, 16-bit)
    pub frame_length: usize,
}

impl FrameSpec {
    #[must_use]
    pub const fn new(sample_rate: u32, frame_length: usize) -> Self {
        Self {
            sample_rate,
            frame_length,
        }
    }

    /// Audio time covered by one frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_length as f64 / f64::from(self.sample_rate.max(1)))
    }

    /// Number of samples covering `duration`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn samples_in(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize
    }
}

/// One fixed-size block of PCM samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position of the frame within its stream, starting at zero
    pub index: u64,
    pub samples: Vec<i16>,
}

/// Releases the underlying device when dropped
pub struct StreamGuard(Option<Box<dyn FnOnce() + Send>>);

impl StreamGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    /// Guard with nothing to release
    #[must_use]
    pub fn noop() -> Self {
        Self(None)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// An open device stream as produced by a backend
pub struct RawStream {
    pub frames: mpsc::Receiver<Vec<i16>>,
    pub guard: StreamGuard,
}

/// Something that can open the physical input device
pub trait AudioBackend: Send + Sync {
    /// Open the device and start delivering frames shaped like `spec`
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the device cannot be acquired
    fn open(&self, spec: FrameSpec) -> Result<RawStream>;
}

/// Splits arbitrary sample chunks into frames of exactly `frame_length`
#[derive(Debug)]
pub struct FrameAssembler {
    frame_length: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(frame_length: usize) -> Self {
        Self {
            frame_length: frame_length.max(1),
            pending: Vec::with_capacity(frame_length * 2),
        }
    }

    /// Buffer `samples` and return every frame completed by them
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_length;
        if complete == 0 {
            return Vec::new();
        }
        let rest = self.pending.split_off(complete * self.frame_length);
        let full = std::mem::replace(&mut self.pending, rest);
        full.chunks_exact(self.frame_length).map(<[i16]>::to_vec).collect()
    }

    /// Samples waiting for the next frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct HandleInner {
    id: u64,
    frames: tokio::sync::Mutex<mpsc::Receiver<Vec<i16>>>,
    closed: CancellationToken,
    next_index: AtomicU64,
}

/// Proof of an open stream; cheap to clone and share between tasks
#[derive(Clone)]
pub struct FrameHandle {
    inner: Arc<HandleInner>,
}

impl FrameHandle {
    /// Unique id of the stream this handle refers to
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the stream has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Open/close accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub opens: u64,
    pub closes: u64,
    /// Id of the currently open stream
    pub open: Option<u64>,
}

struct ActiveStream {
    id: u64,
    closed: CancellationToken,
    guard: StreamGuard,
}

/// Microphone wrapper enforcing a single open stream
pub struct AudioFrameSource {
    backend: Arc<dyn AudioBackend>,
    spec: FrameSpec,
    active: Mutex<Option<ActiveStream>>,
    next_id: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl AudioFrameSource {
    pub fn new(backend: Arc<dyn AudioBackend>, spec: FrameSpec) -> Self {
        Self {
            backend,
            spec,
            active: Mutex::new(None),
            next_id: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn spec(&self) -> FrameSpec {
        self.spec
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveStream>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the device
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if a stream is already open or the
    /// backend cannot acquire the device
    pub fn open(&self) -> Result<FrameHandle> {
        let mut active = self.active();
        if let Some(current) = active.as_ref() {
            return Err(Error::DeviceUnavailable(format!(
                "input stream {} is still open",
                current.id
            )));
        }

        let raw = self.backend.open(self.spec)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let closed = CancellationToken::new();
        *active = Some(ActiveStream {
            id,
            closed: closed.clone(),
            guard: raw.guard,
        });
        self.opens.fetch_add(1, Ordering::AcqRel);
        drop(active);

        tracing::debug!(stream = id, "audio stream opened");

        Ok(FrameHandle {
            inner: Arc::new(HandleInner {
                id,
                frames: tokio::sync::Mutex::new(raw.frames),
                closed,
                next_index: AtomicU64::new(0),
            }),
        })
    }

    /// Wait for the next frame
    ///
    /// # Errors
    ///
    /// Returns `Error::StreamClosed` once the handle is closed, or
    /// `Error::DeviceUnavailable` if the device stopped delivering audio
    pub async fn read(&self, handle: &FrameHandle) -> Result<Frame> {
        let inner = &handle.inner;
        if inner.closed.is_cancelled() {
            return Err(Error::StreamClosed);
        }

        let mut frames = tokio::select! {
            () = inner.closed.cancelled() => return Err(Error::StreamClosed),
            frames = inner.frames.lock() => frames,
        };

        tokio::select! {
            biased;
            () = inner.closed.cancelled() => Err(Error::StreamClosed),
            samples = frames.recv() => match samples {
                Some(samples) => Ok(Frame {
                    index: inner.next_index.fetch_add(1, Ordering::Relaxed),
                    samples,
                }),
                None if inner.closed.is_cancelled() => Err(Error::StreamClosed),
                None => Err(Error::DeviceUnavailable(format!(
                    "input stream {} ended unexpectedly",
                    inner.id
                ))),
            },
        }
    }

    /// Close the stream behind `handle`
    ///
    /// Closing an already-closed handle does nothing.
    pub fn close(&self, handle: &FrameHandle) {
        let released = {
            let mut active = self.active();
            match active.as_ref() {
                Some(current) if current.id == handle.id() => active.take(),
                _ => None,
            }
        };
        handle.inner.closed.cancel();

        if let Some(stream) = released {
            self.release(stream);
        }
    }

    /// Close whatever stream is open, regardless of who holds its handle
    ///
    /// Returns the id of the stream that was closed.
    pub fn close_active(&self) -> Option<u64> {
        let released = self.active().take();
        released.map(|stream| {
            let id = stream.id;
            self.release(stream);
            id
        })
    }

    fn release(&self, stream: ActiveStream) {
        stream.closed.cancel();
        self.closes.fetch_add(1, Ordering::AcqRel);
        let id = stream.id;
        drop(stream.guard);
        tracing::debug!(stream = id, "audio stream closed");
    }

    /// Id of the open stream, if any
    #[must_use]
    pub fn open_stream(&self) -> Option<u64> {
        self.active().as_ref().map(|s| s.id)
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        let active = self.active();
        SourceStats {
            opens: self.opens.load(Ordering::Acquire),
            closes: self.closes.load(Ordering::Acquire),
            open: active.as_ref().map(|s| s.id),
        }
    }
}

impl Drop for AudioFrameSource {
    fn drop(&mut self) {
        if let Some(id) = self.close_active() {
            tracing::debug!(stream = id, "released audio stream on drop");
        }
    }
}
