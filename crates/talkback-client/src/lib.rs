//! Talkback client library
//!
//! Drives a realtime voice session against a speech-to-speech provider:
//! token accounting, microphone capture, local barge-in detection, the
//! WebRTC transport and reconnection.

pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod media;
pub mod network;
pub mod session;
pub mod state;
pub mod transport;
