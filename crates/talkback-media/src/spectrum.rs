//! Frequency-domain energy analysis
//!
//! Mirrors the behaviour of a Web Audio `AnalyserNode`: Blackman-windowed FFT
//! over the most recent `fft_size` samples, magnitudes smoothed over time,
//! converted to decibels and scaled into bytes between `min_db` and `max_db`.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Default analysis window (samples)
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Default time smoothing between successive analyses
pub const DEFAULT_SMOOTHING: f32 = 0.3;

const DEFAULT_MIN_DB: f32 = -100.0;
const DEFAULT_MAX_DB: f32 = -30.0;

pub struct SpectrumAnalyser {
    fft_size: usize,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectrumAnalyser {
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
            window: blackman_window(fft_size),
            smoothed: vec![0.0; fft_size / 2],
            fft,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of frequency bins produced per analysis
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Analyse the most recent `fft_size` samples into byte magnitudes (0-255).
    ///
    /// Shorter input is treated as zero-padded at the front.
    pub fn byte_frequency_data(&mut self, samples: &[f32]) -> Vec<u8> {
        let tail = &samples[samples.len().saturating_sub(self.fft_size)..];
        let offset = self.fft_size - tail.len();

        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.fft_size];
        for (i, &sample) in tail.iter().enumerate() {
            let idx = offset + i;
            buffer[idx] = Complex::new(sample * self.window[idx], 0.0);
        }
        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = self.max_db - self.min_db;
        let tau = self.smoothing;

        self.smoothed
            .iter_mut()
            .zip(buffer.iter())
            .map(|(previous, bin)| {
                let magnitude = bin.norm() * scale;
                *previous = tau * *previous + (1.0 - tau) * magnitude;

                let db = 20.0 * previous.log10();
                if !db.is_finite() {
                    return 0;
                }
                (255.0 / range * (db - self.min_db)).floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Mean byte magnitude across all bins, the level used for speech detection
    pub fn mean_level(&mut self, samples: &[f32]) -> f32 {
        let bins = self.byte_frequency_data(samples);
        if bins.is_empty() {
            return 0.0;
        }
        bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
    }

    /// Forget the smoothing history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING)
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;

    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}
