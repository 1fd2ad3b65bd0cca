//! Shared protocol definitions for talkback
//!
//! Two wire surfaces live here: the JSON events exchanged with the realtime
//! provider over the WebRTC data channel, and the request/response bodies of
//! the backend REST API.

pub mod events;
pub mod types;

pub use events::*;
pub use types::*;
