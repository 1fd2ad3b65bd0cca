//! Assistant audio playback

use anyhow::Result;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Volume removed per fade step
pub const FADE_STEP: f32 = 0.3;
/// Fade stops once volume is at or below this
pub const FADE_FLOOR: f32 = 0.1;
pub const FADE_INTERVAL: Duration = Duration::from_millis(16);

/// Where decoded remote audio goes
pub trait AudioOutput: Send + Sync {
    fn volume(&self) -> f32;
    fn set_volume(&self, volume: f32);
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    /// Queue mono 48 kHz samples
    fn push_pcm(&self, samples: &[f32]);
    /// Drop everything queued
    fn clear(&self);
}

/// Fade playback out for a barge-in, then pause, drop queued audio and
/// restore full volume for the next response.
pub async fn fade_out(output: &dyn AudioOutput) {
    let mut volume = output.volume();
    while volume > FADE_FLOOR {
        volume = (volume - FADE_STEP).max(0.0);
        output.set_volume(volume);
        tokio::time::sleep(FADE_INTERVAL).await;
    }
    output.pause();
    output.clear();
    output.set_volume(1.0);
}

/// Speaker output through rodio
pub struct RodioOutput {
    sink: Arc<Sink>,
    /// Dropping this ends the thread that owns the output stream
    _shutdown: std_mpsc::Sender<()>,
}

impl RodioOutput {
    pub fn new() -> Result<Self> {
        let (sink_tx, sink_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        // OutputStream is !Send; it stays on this thread for its whole life
        std::thread::Builder::new()
            .name("talkback-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = sink_tx.send(Err(anyhow::anyhow!("No output device: {}", e)));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = sink_tx.send(Ok(Arc::new(sink)));
                    }
                    Err(e) => {
                        let _ = sink_tx.send(Err(anyhow::anyhow!("Failed to create sink: {}", e)));
                        return;
                    }
                }
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        let sink = sink_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("Playback thread exited before starting"))??;

        tracing::info!("Audio playback ready");
        Ok(Self {
            sink,
            _shutdown: shutdown_tx,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn volume(&self) -> f32 {
        self.sink.volume()
    }

    fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }

    fn pause(&self) {
        self.sink.pause();
    }

    fn resume(&self) {
        self.sink.play();
    }

    fn is_paused(&self) -> bool {
        self.sink.is_paused()
    }

    fn push_pcm(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.sink.append(SamplesBuffer::new(
            talkback_media::CHANNELS as u16,
            talkback_media::SAMPLE_RATE,
            samples.to_vec(),
        ));
    }

    fn clear(&self) {
        self.sink.clear();
    }
}

/// Output for hosts without a speaker: tracks volume and pause state, discards audio
pub struct SilentOutput {
    volume: AtomicU32,
    paused: AtomicBool,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self {
            volume: AtomicU32::new(1.0f32.to_bits()),
            paused: AtomicBool::new(false),
        }
    }
}

impl Default for SilentOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for SilentOutput {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn push_pcm(&self, _samples: &[f32]) {}

    fn clear(&self) {}
}
