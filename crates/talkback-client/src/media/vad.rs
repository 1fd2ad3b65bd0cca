//! Local speech-activity monitoring
//!
//! Detects the user starting to talk over the assistant so playback can be
//! interrupted before the provider's own turn detection reacts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use talkback_media::spectrum::{DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING};
use talkback_media::SpectrumAnalyser;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::gate::MediaHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    /// Mean spectral byte level above which a sample counts as loud
    pub threshold: f32,
    /// Consecutive loud samples needed to declare speech
    pub required_frames: u32,
    pub interval: Duration,
    pub fft_size: usize,
    pub smoothing: f32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            required_frames: 2,
            interval: Duration::from_millis(50),
            fft_size: DEFAULT_FFT_SIZE,
            smoothing: DEFAULT_SMOOTHING,
        }
    }
}

/// Edge reported by [`SpeechOnsetDetector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechActivity {
    /// Enough consecutive loud samples to count as speech
    Started,
    /// The first quiet sample after speech
    Stopped,
}

/// Debounced, edge-triggered speech onset.
///
/// Reports `Started` once when `required` consecutive levels exceed the
/// threshold, then `Stopped` on the first level at or below it. Levels in
/// between report nothing, so a listener can track whether the user is
/// talking right now without being flooded.
#[derive(Debug, Clone)]
pub struct SpeechOnsetDetector {
    threshold: f32,
    required: u32,
    consecutive: u32,
    fired: bool,
}

impl SpeechOnsetDetector {
    pub fn new(threshold: f32, required: u32) -> Self {
        Self {
            threshold,
            required: required.max(1),
            consecutive: 0,
            fired: false,
        }
    }

    /// Feed one level sample; returns the edge it produced, if any
    pub fn observe(&mut self, level: f32) -> Option<SpeechActivity> {
        if level > self.threshold {
            self.consecutive = self.consecutive.saturating_add(1);
            if !self.fired && self.consecutive >= self.required {
                self.fired = true;
                return Some(SpeechActivity::Started);
            }
            None
        } else {
            self.consecutive = 0;
            if std::mem::take(&mut self.fired) {
                return Some(SpeechActivity::Stopped);
            }
            None
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn is_active(&self) -> bool {
        self.fired
    }
}

pub type ActivityCallback = Arc<dyn Fn(SpeechActivity) + Send + Sync>;

/// Samples microphone energy on a timer and reports speech start and stop
pub struct SpeechActivityMonitor {
    settings: VadSettings,
    task: Option<JoinHandle<()>>,
}

impl SpeechActivityMonitor {
    pub fn new(settings: VadSettings) -> Self {
        Self {
            settings,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start analysing `handle`. No-op if already running.
    ///
    /// # Arguments
    /// * `handle` - Microphone handle whose frames are analysed
    /// * `on_activity` - Called from the monitor task on every speech edge
    pub fn start(&mut self, handle: &MediaHandle, on_activity: ActivityCallback) {
        if self.is_running() {
            return;
        }
        let frames = handle.subscribe();
        let settings = self.settings;
        self.task = Some(tokio::spawn(run_monitor(settings, frames, on_activity)));
        tracing::debug!("Speech monitor started on handle {}", handle.id());
    }

    /// Stop analysis. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Speech monitor stopped");
        }
    }
}

impl Drop for SpeechActivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_monitor(
    settings: VadSettings,
    mut frames: tokio::sync::broadcast::Receiver<Arc<Vec<f32>>>,
    on_activity: ActivityCallback,
) {
    let mut analyser = SpectrumAnalyser::new(settings.fft_size, settings.smoothing);
    let mut detector = SpeechOnsetDetector::new(settings.threshold, settings.required_frames);
    let mut window: VecDeque<f32> = VecDeque::with_capacity(settings.fft_size);

    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        loop {
            match frames.try_recv() {
                Ok(frame) => {
                    window.extend(frame.iter().copied());
                    let excess = window.len().saturating_sub(settings.fft_size);
                    window.drain(..excess);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::trace!("Speech monitor skipped {} frames", skipped);
                }
                Err(TryRecvError::Closed) => {
                    tracing::debug!("Capture closed, speech monitor exiting");
                    return;
                }
            }
        }

        let level = analyser.mean_level(window.make_contiguous());
        if let Some(activity) = detector.observe(level) {
            tracing::debug!("Local speech {:?} (level {:.1})", activity, level);
            on_activity(activity);
        }
    }
}
