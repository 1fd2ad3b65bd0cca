//! WebRTC transport to the realtime provider

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use talkback_media::{AudioDecoder, AudioEncoder, FrameAccumulator, SAMPLE_RATE};
use talkback_protocol::ClientEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{EventSink, OpenRequest, PeerState, Transport, TransportConnector, TransportEvent, EVENTS_CHANNEL};
use crate::error::TransportError;
use crate::media::{AudioOutput, MediaHandle};
use crate::network::{signaling, USER_AGENT};

const FRAME_DURATION: Duration = Duration::from_millis(20);
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Opens peer connections to the provider's signaling endpoint
pub struct WebRtcConnector {
    http: reqwest::Client,
    provider_url: String,
}

impl WebRtcConnector {
    /// # Arguments
    /// * `provider_url` - SDP signaling endpoint, without the `model` query
    /// * `timeout` - Upper bound for the offer/answer POST
    pub fn new(provider_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            provider_url: provider_url.to_string(),
        })
    }

    async fn negotiate(
        &self,
        pc: &Arc<RTCPeerConnection>,
        request: &OpenRequest,
        events: &EventSink,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<Arc<RTCDataChannel>, TransportError> {
        // Local microphone track
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "talkback".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so interceptors keep working
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        }));
        tasks.push(tokio::spawn(pump_microphone(request.media.clone(), track)));

        let sink = Arc::clone(events);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("Peer connection state changed: {}", state);
            sink(TransportEvent::PeerState(peer_state(state)));
            Box::pin(async {})
        }));

        let sink = Arc::clone(events);
        let output = Arc::clone(&request.output);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let sink = Arc::clone(&sink);
            let output = Arc::clone(&output);
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    tracing::debug!("Ignoring remote {} track", track.kind());
                    return;
                }
                tracing::info!("Remote audio track started: {}", track.id());
                sink(TransportEvent::RemoteAudio);
                tokio::spawn(play_remote_audio(track, output));
            })
        }));

        let channel = pc.create_data_channel(EVENTS_CHANNEL, None).await?;

        let sink = Arc::clone(events);
        channel.on_open(Box::new(move || {
            tracing::info!("Data channel open");
            sink(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let sink = Arc::clone(events);
        channel.on_close(Box::new(move || {
            tracing::debug!("Data channel closed");
            sink(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let sink = Arc::clone(events);
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => sink(TransportEvent::Message(text)),
                Err(_) => tracing::debug!("Dropping non-UTF-8 data channel frame"),
            }
            Box::pin(async {})
        }));

        // Offer with all candidates gathered, then exchange over HTTP
        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Other("no local description after gathering".to_string()))?;

        let answer = signaling::post_sdp_offer(
            &self.http,
            &self.provider_url,
            &request.model,
            &request.api_key,
            &local.sdp,
        )
        .await?;

        pc.set_remote_description(RTCSessionDescription::answer(answer)?)
            .await?;

        tracing::info!("SDP answer applied, waiting for data channel");
        Ok(channel)
    }
}

#[async_trait]
impl TransportConnector for WebRtcConnector {
    async fn open(
        &self,
        request: OpenRequest,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let pc = new_peer_connection().await?;
        let mut tasks = Vec::new();

        match self.negotiate(&pc, &request, &events, &mut tasks).await {
            Ok(channel) => Ok(Arc::new(WebRtcTransport {
                pc,
                channel,
                tasks: Mutex::new(tasks),
                closed: AtomicBool::new(false),
            })),
            Err(e) => {
                for task in tasks {
                    task.abort();
                }
                if let Err(close_err) = pc.close().await {
                    tracing::warn!("Failed to close peer connection: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

async fn new_peer_connection() -> Result<Arc<RTCPeerConnection>, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

/// Encode microphone PCM into 20 ms Opus samples on the outbound track
async fn pump_microphone(media: MediaHandle, track: Arc<TrackLocalStaticSample>) {
    let mut encoder = match AudioEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!("Failed to create Opus encoder: {}", e);
            return;
        }
    };
    let mut frames = media.subscribe();
    let mut accumulator = FrameAccumulator::new();

    loop {
        let chunk = match frames.recv().await {
            Ok(chunk) => chunk,
            Err(RecvError::Lagged(skipped)) => {
                tracing::trace!("Outbound audio lagged, skipped {} chunks", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        for frame in accumulator.push(&chunk) {
            let packet = match encoder.encode_float(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!("Opus encode failed: {}", e);
                    continue;
                }
            };
            let sample = Sample {
                data: packet.into(),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Failed to write audio sample: {}", e);
            }
        }
    }
}

/// Decode the provider's Opus stream into the speaker
async fn play_remote_audio(track: Arc<TrackRemote>, output: Arc<dyn AudioOutput>) {
    let mut decoder = match AudioDecoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!("Failed to create Opus decoder: {}", e);
            return;
        }
    };

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                match decoder.decode_float(&packet.payload) {
                    Ok(pcm) => output.push_pcm(&pcm),
                    Err(e) => tracing::trace!("Opus decode failed: {}", e),
                }
            }
            Err(e) => {
                tracing::debug!("Remote audio track ended: {}", e);
                break;
            }
        }
    }
}

/// One live peer connection and its event channel
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if self.channel.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        let json = event.to_json()?;
        self.channel.send_text(json).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.channel.close().await {
            tracing::debug!("Data channel close: {}", e);
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Peer connection close: {}", e);
        }
        tracing::info!("Transport closed");
    }
}
