//! Microphone acquisition
//!
//! The capture device is a single shared resource. [`MediaGate`] hands out
//! one [`MediaHandle`] per overlapping lifetime: concurrent callers wait on
//! the same in-flight request, and an active handle is returned from cache
//! without asking the platform again.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::broadcast;

use crate::error::MediaError;

/// Frames buffered per subscriber before the slowest one starts lagging
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Processing requested from the platform for voice capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channels: u16,
    pub sample_rate: u32,
}

impl CaptureConstraints {
    pub const VOICE: CaptureConstraints = CaptureConstraints {
        echo_cancellation: true,
        noise_suppression: true,
        auto_gain_control: true,
        channels: 1,
        sample_rate: talkback_media::SAMPLE_RATE,
    };
}

/// Platform microphone access
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, constraints: CaptureConstraints) -> Result<MediaHandle, MediaError>;
}

type StopFn = Box<dyn FnOnce() + Send>;

struct HandleInner {
    id: u64,
    frames: broadcast::Sender<Arc<Vec<f32>>>,
    active: AtomicBool,
    stop: Mutex<Option<StopFn>>,
}

/// A live microphone stream.
///
/// Cloning is cheap; every clone refers to the same capture. PCM frames (mono,
/// 48 kHz) are fanned out to every subscriber.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<HandleInner>,
}

impl MediaHandle {
    /// Wrap a capture. `stop` runs once, on the first call to [`MediaHandle::stop`].
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                frames,
                active: AtomicBool::new(true),
                stop: Mutex::new(Some(Box::new(stop))),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<f32>>> {
        self.inner.frames.subscribe()
    }

    /// Deliver captured samples to subscribers
    pub fn publish(&self, samples: Vec<f32>) {
        if self.is_active() {
            let _ = self.inner.frames.send(Arc::new(samples));
        }
    }

    /// Sender side for capture callbacks running off the runtime
    pub fn frame_sender(&self) -> broadcast::Sender<Arc<Vec<f32>>> {
        self.inner.frames.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop the capture. Idempotent.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let stop = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(stop) = stop {
            stop();
        }
        tracing::debug!("Media handle {} stopped", self.inner.id);
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .finish()
    }
}

type PendingAcquire = Shared<BoxFuture<'static, Result<MediaHandle, MediaError>>>;

#[derive(Default)]
struct GateSlot {
    handle: Option<MediaHandle>,
    in_flight: Option<PendingAcquire>,
    /// Bumped on release so an acquisition that straddles it is discarded
    generation: u64,
}

struct GateInner {
    backend: Arc<dyn CaptureBackend>,
    slot: Mutex<GateSlot>,
}

/// Single owner of the microphone
#[derive(Clone)]
pub struct MediaGate {
    inner: Arc<GateInner>,
}

impl MediaGate {
    /// Create a gate over a capture backend.
    ///
    /// Most callers want [`MediaGate::global`]; a private gate is for tests and
    /// for embedding with a non-default input.
    ///
    /// # Arguments
    /// * `backend` - Platform capture used to open the microphone
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                backend,
                slot: Mutex::new(GateSlot::default()),
            }),
        }
    }

    /// Process-wide gate over the default input device
    pub fn global() -> MediaGate {
        static GLOBAL: OnceLock<MediaGate> = OnceLock::new();
        GLOBAL
            .get_or_init(|| MediaGate::new(Arc::new(super::capture::CpalCapture::default())))
            .clone()
    }

    fn slot(&self) -> MutexGuard<'_, GateSlot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the shared capture handle, opening the device if needed.
    ///
    /// A live cached handle is returned without touching the device. While a
    /// request is in flight every caller awaits that same request, so the
    /// user is prompted at most once. A [`MediaGate::release`] issued while the
    /// request is pending wins: the freshly opened capture is stopped and not
    /// cached.
    ///
    /// # Errors
    /// `MediaUnavailable` when there is no input device, `PermissionDenied`
    /// when access was refused.
    pub async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        let (pending, generation) = {
            let mut slot = self.slot();

            if let Some(handle) = slot.handle.as_ref().filter(|h| h.is_active()) {
                return Ok(handle.clone());
            }
            slot.handle = None;

            let pending = match &slot.in_flight {
                Some(pending) => pending.clone(),
                None => {
                    let backend = Arc::clone(&self.inner.backend);
                    let pending = async move { backend.open(CaptureConstraints::VOICE).await }
                        .boxed()
                        .shared();
                    slot.in_flight = Some(pending.clone());
                    pending
                }
            };
            (pending, slot.generation)
        };

        let result = pending.await;

        let mut slot = self.slot();
        if slot.generation != generation {
            if let Ok(handle) = &result {
                handle.stop();
            }
            return Err(MediaError::Unavailable(
                "capture was released during acquisition".to_string(),
            ));
        }
        slot.in_flight = None;

        match result {
            Ok(handle) => {
                // Concurrent waiters all resolve with the same handle
                if slot.handle.is_none() {
                    tracing::info!("Microphone acquired (handle {})", handle.id());
                    slot.handle = Some(handle.clone());
                }
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!("Microphone acquisition failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the capture and forget it. Idempotent.
    pub fn release(&self) {
        let handle = {
            let mut slot = self.slot();
            slot.generation += 1;
            slot.in_flight = None;
            slot.handle.take()
        };

        if let Some(handle) = handle {
            handle.stop();
            tracing::info!("Microphone released (handle {})", handle.id());
        }
    }

    /// The cached handle, if one is active
    pub fn current(&self) -> Option<MediaHandle> {
        self.slot().handle.clone().filter(|h| h.is_active())
    }
}
