//! In-memory stand-ins for the backend, microphone, transport and speaker

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use talkback_client::error::{MediaError, TransportError};
use talkback_client::media::{
    AudioOutput, AudioRoutingHint, CaptureBackend, CaptureConstraints, MediaGate, MediaHandle,
};
use talkback_client::network::{ApiError, Backend};
use talkback_client::session::{SessionController, SessionDeps, SessionSettings};
use talkback_client::state::SessionSnapshot;
use talkback_client::transport::{EventSink, OpenRequest, Transport, TransportConnector, TransportEvent};
use talkback_protocol::{
    ClientEvent, DeductTokensRequest, HealthStatus, SaveMessageRequest, TokenDeductData, UserId,
    UserProfile,
};

pub const USER: UserId = 42;

#[derive(Default)]
pub struct BackendState {
    pub balance: i64,
    pub deductions: Vec<DeductTokensRequest>,
    pub saved: Vec<SaveMessageRequest>,
    pub sessions_created: u32,
    pub fail_balance: bool,
    pub fail_credential: bool,
    pub profile_voice: Option<String>,
    pub profile_model: Option<String>,
}

#[derive(Default)]
pub struct FakeBackend {
    pub state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn with_balance(balance: i64) -> Self {
        let backend = Self::default();
        backend.state().balance = balance;
        backend
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn token_balance(&self, _user_id: UserId) -> Result<i64, ApiError> {
        let state = self.state();
        if state.fail_balance {
            return Err(ApiError::Status {
                status: 503,
                message: "ledger offline".to_string(),
            });
        }
        Ok(state.balance)
    }

    async fn deduct_tokens(&self, request: &DeductTokensRequest) -> Result<TokenDeductData, ApiError> {
        let mut state = self.state();
        if request.usage.total_tokens > state.balance {
            return Err(ApiError::Rejected("Insufficient tokens".to_string()));
        }
        state.balance -= request.usage.total_tokens;
        state.deductions.push(request.clone());
        Ok(TokenDeductData {
            new_balance: state.balance,
            tokens_used: request.usage.total_tokens,
        })
    }

    async fn issue_credential(&self, _user_id: Option<UserId>) -> Result<String, ApiError> {
        if self.state().fail_credential {
            return Err(ApiError::Status {
                status: 500,
                message: "OpenAI API key not configured".to_string(),
            });
        }
        Ok("ek_test".to_string())
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserProfile, ApiError> {
        let state = self.state();
        Ok(UserProfile {
            id: user_id,
            token_balance: state.balance,
            selected_model: state.profile_model.clone(),
            selected_voice: state.profile_voice.clone(),
            ..Default::default()
        })
    }

    async fn save_message(&self, request: &SaveMessageRequest) -> Result<(), ApiError> {
        self.state().saved.push(request.clone());
        Ok(())
    }

    async fn create_voice_session(&self, _user_id: UserId) -> Result<i64, ApiError> {
        let mut state = self.state();
        state.sessions_created += 1;
        Ok(900 + state.sessions_created as i64)
    }

    async fn update_user_model(&self, _user_id: UserId, model: &str) -> Result<(), ApiError> {
        self.state().profile_model = Some(model.to_string());
        Ok(())
    }

    async fn update_user_voice(&self, _user_id: UserId, voice: &str) -> Result<(), ApiError> {
        self.state().profile_voice = Some(voice.to_string());
        Ok(())
    }

    async fn select_prompt(&self, _user_id: UserId, _prompt_id: i64) -> Result<(), ApiError> {
        Ok(())
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        Ok(HealthStatus {
            status: "ok".to_string(),
            service: None,
        })
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub opens: AtomicUsize,
    pub deny: AtomicBool,
    last: Mutex<Option<MediaHandle>>,
}

impl FakeCapture {
    pub fn last_handle(&self) -> Option<MediaHandle> {
        self.last.lock().unwrap().clone()
    }

    pub fn publish(&self, samples: Vec<f32>) {
        if let Some(handle) = self.last_handle() {
            handle.publish(samples);
        }
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn open(&self, _constraints: CaptureConstraints) -> Result<MediaHandle, MediaError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let handle = MediaHandle::new(|| {});
        *self.last.lock().unwrap() = Some(handle.clone());
        Ok(handle)
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<ClientEvent>>,
    pub closed: AtomicBool,
}

impl FakeTransport {
    pub fn cancels(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ClientEvent::ResponseCancel))
            .count()
    }

    pub fn session_updates(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ClientEvent::SessionUpdate { .. }))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    pub opens: AtomicUsize,
    pub open_times: Mutex<Vec<Instant>>,
    pub fail: AtomicBool,
    /// Report the data channel open as soon as signaling completes
    pub auto_open: AtomicBool,
    pub last_request: Mutex<Option<(String, String)>>,
    /// How long signaling takes
    pub latency: Mutex<Duration>,
    sink: Mutex<Option<EventSink>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            open_times: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            auto_open: AtomicBool::new(true),
            last_request: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            sink: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
        }
    }
}

impl FakeConnector {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event through the sink of the most recent connection
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    pub fn message(&self, json: serde_json::Value) {
        self.emit(TransportEvent::Message(json.to_string()));
    }

    pub fn last_sink(&self) -> Option<EventSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport opened")
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn open(
        &self,
        request: OpenRequest,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().unwrap().push(Instant::now());
        *self.last_request.lock().unwrap() = Some((request.model.clone(), request.api_key.clone()));

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Signaling {
                status: 502,
                body: "upstream unavailable".to_string(),
            });
        }

        let transport = Arc::new(FakeTransport::default());
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        *self.sink.lock().unwrap() = Some(Arc::clone(&events));
        if self.auto_open.load(Ordering::SeqCst) {
            events(TransportEvent::ChannelOpen);
        }
        Ok(transport as Arc<dyn Transport>)
    }
}

pub struct FakeOutput {
    volume: Mutex<f32>,
    pub volumes: Mutex<Vec<f32>>,
    paused: AtomicBool,
    pub clears: AtomicUsize,
}

impl Default for FakeOutput {
    fn default() -> Self {
        Self {
            volume: Mutex::new(1.0),
            volumes: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            clears: AtomicUsize::new(0),
        }
    }
}

impl AudioOutput for FakeOutput {
    fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume;
        self.volumes.lock().unwrap().push(volume);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn push_pcm(&self, _samples: &[f32]) {}

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingRouting {
    pub applied: AtomicUsize,
}

impl AudioRoutingHint for RecordingRouting {
    fn apply_best_effort(&self) {
        self.applied.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub backend: Arc<FakeBackend>,
    pub capture: Arc<FakeCapture>,
    pub media: MediaGate,
    pub connector: Arc<FakeConnector>,
    pub output: Arc<FakeOutput>,
    pub routing: Arc<RecordingRouting>,
}

impl Harness {
    pub fn new(balance: i64) -> Self {
        let backend = Arc::new(FakeBackend::with_balance(balance));
        let capture = Arc::new(FakeCapture::default());
        let media = MediaGate::new(capture.clone());
        let connector = Arc::new(FakeConnector::default());
        let output = Arc::new(FakeOutput::default());
        let routing = Arc::new(RecordingRouting::default());

        let controller = SessionController::new(
            SessionDeps {
                backend: backend.clone(),
                connector: connector.clone(),
                media: media.clone(),
                output: output.clone(),
                routing: routing.clone(),
            },
            SessionSettings::default(),
        );

        Self {
            controller,
            backend,
            capture,
            media,
            connector,
            output,
            routing,
        }
    }

    /// Connect and wait until the session is live
    pub async fn connected(balance: i64) -> Self {
        let harness = Self::new(balance);
        harness
            .controller
            .connect(USER, None)
            .await
            .expect("connect failed");
        harness.wait_for(|s| s.state.is_connected()).await;
        harness
    }

    pub async fn wait_for(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx: watch::Receiver<SessionSnapshot> = self.controller.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for session state")
            .expect("session controller dropped")
            .clone();
        snapshot
    }
}

/// Poll `check` until it holds, letting spawned tasks run in between
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// Deterministic white noise
pub fn noise(len: usize, amplitude: f32, mut seed: u32) -> Vec<f32> {
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let unit = (seed >> 8) as f32 / (1u32 << 24) as f32;
            (unit * 2.0 - 1.0) * amplitude
        })
        .collect()
}
