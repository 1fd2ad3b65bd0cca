//! Media processing utilities for talkback
//!
//! This crate provides the audio building blocks used by the client:
//! - Opus encoding/decoding for the WebRTC audio tracks
//! - Frequency-domain energy analysis for local speech detection

pub mod audio;
pub mod spectrum;

pub use audio::*;
pub use spectrum::SpectrumAnalyser;
