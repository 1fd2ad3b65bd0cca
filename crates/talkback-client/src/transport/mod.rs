//! Realtime connection to the speech provider
//!
//! One transport is one peer connection plus its `oai-events` data channel.
//! It is built fresh for every connection attempt and reports everything that
//! happens to it through an [`EventSink`].

pub mod peer;

pub use peer::WebRtcConnector;

use async_trait::async_trait;
use std::sync::Arc;
use talkback_protocol::ClientEvent;

use crate::error::TransportError;
use crate::media::{AudioOutput, MediaHandle};

/// Name of the data channel carrying provider events
pub const EVENTS_CHANNEL: &str = "oai-events";

/// Peer connection state, reduced to what the session reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// The connection is gone and will not recover on its own
    pub fn is_lost(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The data channel opened; the session is live
    ChannelOpen,
    ChannelClosed,
    /// A text frame arrived on the data channel
    Message(String),
    PeerState(PeerState),
    /// Remote audio started flowing into the output
    RemoteAudio,
}

pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Everything needed to build one connection attempt
pub struct OpenRequest {
    /// Ephemeral provider key
    pub api_key: String,
    pub model: String,
    pub media: MediaHandle,
    pub output: Arc<dyn AudioOutput>,
}

/// Builds transports
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Set up the peer connection and complete signaling.
    ///
    /// On error nothing is left open.
    async fn open(&self, request: OpenRequest, events: EventSink)
        -> Result<Arc<dyn Transport>, TransportError>;
}

/// A live connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError>;

    /// Tear down the data channel and peer connection. Idempotent.
    async fn close(&self);
}
