//! Microphone capture through cpal
//!
//! cpal streams are not `Send`, so each capture lives on its own thread and is
//! dropped there when the handle is stopped.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

use super::gate::{CaptureBackend, CaptureConstraints, MediaHandle};
use crate::error::MediaError;

/// Default input device capture
#[derive(Debug, Default, Clone)]
pub struct CpalCapture {
    /// Input device name; `None` uses the system default
    pub device_name: Option<String>,
}

#[async_trait]
impl CaptureBackend for CpalCapture {
    async fn open(&self, constraints: CaptureConstraints) -> Result<MediaHandle, MediaError> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let handle = MediaHandle::new(move || {
            let _ = stop_tx.send(());
        });

        let frames = handle.frame_sender();
        let device_name = self.device_name.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("talkback-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), constraints, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                // Keep the stream alive until stopped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("Capture thread exiting");
            })
            .map_err(|e| MediaError::Unavailable(format!("failed to start capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.stop();
                Err(e)
            }
            Err(_) => {
                handle.stop();
                Err(MediaError::Unavailable("capture thread exited".to_string()))
            }
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    constraints: CaptureConstraints,
    frames: broadcast::Sender<Arc<Vec<f32>>>,
) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| MediaError::Unavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| MediaError::Unavailable(format!("input device not found: {}", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| MediaError::Unavailable("no default input device".to_string()))?,
    };

    let config = device.default_input_config().map_err(classify)?;
    let device_rate = config.sample_rate().0;
    let channels = config.channels() as usize;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels (echo cancellation {}, noise suppression {}, AGC {} requested from the platform)",
        device_rate,
        channels,
        constraints.echo_cancellation,
        constraints.noise_suppression,
        constraints.auto_gain_control
    );

    let target_rate = constraints.sample_rate;

    let stream = device
        .build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };

                let samples = if device_rate == target_rate {
                    mono
                } else {
                    resample_linear(&mono, device_rate, target_rate)
                };

                let _ = frames.send(Arc::new(samples));
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(classify)?;

    stream.play().map_err(classify)?;
    Ok(stream)
}

/// Map a cpal error onto permission denial or plain unavailability
fn classify(err: impl std::fmt::Display) -> MediaError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") || lower.contains("access denied") {
        MediaError::PermissionDenied
    } else {
        MediaError::Unavailable(text)
    }
}

/// Naive linear resampler, adequate for speech
fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if input.is_empty() || from == 0 {
        return Vec::new();
    }
    let ratio = from as f64 / to as f64;
    let out_len = (input.len() as u64 * to as u64 / from as u64) as usize;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}
