//! Realtime session controller
//!
//! Owns one voice session end to end: eligibility and billing against the
//! token ledger, the microphone, local barge-in detection, the transport to
//! the provider, and reconnection. All transport and monitor callbacks are
//! funnelled into a single event-loop task so provider events are handled
//! strictly in order.
//!
//! Every connection attempt gets a new epoch. Callbacks carry the epoch they
//! were created under and anything from an older attempt is dropped.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use talkback_protocol::{
    ClientEvent, ConversationItem, DecodeError, ProviderError, ResponseData, SaveMessageRequest,
    ServerEvent, SessionConfig, UserId,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::reconnect::ReconnectSupervisor;
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::ledger::{BalanceCheck, TokenLedger};
use crate::media::vad::ActivityCallback;
use crate::media::{
    fade_out, AudioOutput, AudioRoutingHint, MediaGate, SpeechActivity, SpeechActivityMonitor,
    VadSettings,
};
use crate::network::Backend;
use crate::state::{ConnectionState, SessionSnapshot};
use crate::transport::{EventSink, OpenRequest, Transport, TransportConnector, TransportEvent};

/// Tunables for one controller
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub min_tokens_to_start: i64,
    pub min_tokens_to_continue: i64,
    pub max_reconnect_attempts: u32,
    pub default_model: String,
    pub default_voice: String,
    pub vad: VadSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            min_tokens_to_start: config.min_tokens_to_start,
            min_tokens_to_continue: config.min_tokens_to_continue,
            max_reconnect_attempts: config.max_reconnect_attempts,
            default_model: config.default_model.clone(),
            default_voice: config.default_voice.clone(),
            vad: VadSettings {
                threshold: config.vad_threshold,
                required_frames: config.vad_required_frames,
                interval: Duration::from_millis(config.vad_interval_ms.max(1)),
                ..VadSettings::default()
            },
        }
    }
}

/// Collaborators the controller drives
pub struct SessionDeps {
    pub backend: Arc<dyn Backend>,
    pub connector: Arc<dyn TransportConnector>,
    pub media: MediaGate,
    pub output: Arc<dyn AudioOutput>,
    pub routing: Arc<dyn AudioRoutingHint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectArgs {
    user_id: UserId,
    voice: Option<String>,
}

enum LoopEvent {
    Transport { epoch: u64, event: TransportEvent },
    Speech(SpeechActivity),
}

enum AttemptError {
    /// A newer attempt or a disconnect took over while this one was in flight
    Superseded,
    Failed(SessionError),
}

impl From<SessionError> for AttemptError {
    fn from(err: SessionError) -> Self {
        AttemptError::Failed(err)
    }
}

struct SessionCore {
    state: ConnectionState,
    epoch: u64,
    user_id: Option<UserId>,
    voice: Option<String>,
    session_id: Option<i64>,
    reconnect: ReconnectSupervisor,
    /// Arguments of the last manual connect; cleared by disconnect
    last_args: Option<ConnectArgs>,
    transport: Option<Arc<dyn Transport>>,
    /// The data channel opened before the transport was stored
    channel_open_pending: bool,
    monitor: SpeechActivityMonitor,
    /// The local monitor currently hears the user
    user_speaking: bool,
    /// The current response has already been cut off by barge-in
    interrupted: bool,
    retry_timer: Option<JoinHandle<()>>,
    seen_items: HashSet<String>,
    error: Option<SessionError>,
    token_balance: i64,
    can_connect: bool,
    online: bool,
}

impl SessionCore {
    fn new(settings: &SessionSettings) -> Self {
        Self {
            state: ConnectionState::Idle,
            epoch: 0,
            user_id: None,
            voice: None,
            session_id: None,
            reconnect: ReconnectSupervisor::new(settings.max_reconnect_attempts),
            last_args: None,
            transport: None,
            channel_open_pending: false,
            monitor: SpeechActivityMonitor::new(settings.vad),
            user_speaking: false,
            interrupted: false,
            retry_timer: None,
            seen_items: HashSet::new(),
            error: None,
            token_balance: 0,
            can_connect: false,
            online: true,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            user_id: self.user_id,
            selected_voice: self.voice.clone(),
            session_id: self.session_id,
            reconnect_attempts: self.reconnect.attempts(),
            token_balance: self.token_balance,
            can_connect: self.can_connect,
            is_online: self.online,
            error: self.error.clone(),
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn stop_monitor(&mut self) {
        self.monitor.stop();
        self.user_speaking = false;
        self.interrupted = false;
    }

    /// End the current attempt: later callbacks from it are ignored and its
    /// transport is handed back for closing.
    fn detach(&mut self) -> Option<Arc<dyn Transport>> {
        self.epoch += 1;
        self.channel_open_pending = false;
        self.transport.take()
    }
}

struct Inner {
    deps: SessionDeps,
    settings: SessionSettings,
    ledger: TokenLedger,
    core: Mutex<SessionCore>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: mpsc::UnboundedSender<LoopEvent>,
    disposed: AtomicBool,
}

/// Client-side state machine for one realtime voice session
pub struct SessionController {
    inner: Arc<Inner>,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Create a controller and spawn its event loop.
    ///
    /// Must be called inside a tokio runtime. The controller starts `idle`;
    /// nothing touches the network or the microphone until [`connect`] is
    /// called.
    ///
    /// # Arguments
    /// * `deps` - Backend, transport connector, microphone gate, audio output
    ///   and routing hint the session drives
    /// * `settings` - Token thresholds, retry cap, defaults and speech detection
    ///
    /// [`connect`]: SessionController::connect
    pub fn new(deps: SessionDeps, settings: SessionSettings) -> Self {
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let ledger = TokenLedger::new(
            Arc::clone(&deps.backend),
            settings.min_tokens_to_start,
            settings.min_tokens_to_continue,
        );

        let inner = Arc::new(Inner {
            core: Mutex::new(SessionCore::new(&settings)),
            deps,
            settings,
            ledger,
            snapshot,
            events,
            disposed: AtomicBool::new(false),
        });

        let loop_inner = Arc::clone(&inner);
        let event_loop = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                loop_inner.handle(event).await;
            }
        });

        Self {
            inner,
            event_loop: StdMutex::new(Some(event_loop)),
        }
    }

    /// Watch session state. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Start a session for `user_id`.
    ///
    /// A no-op while connecting or connected. Resolves once signaling is done;
    /// the session is live when the state reaches `connected`.
    ///
    /// Balance, profile and credential are fetched concurrently. A balance at
    /// or below the continue threshold is swept before the refusal.
    ///
    /// # Arguments
    /// * `user_id` - Account that is billed for the session
    /// * `voice` - Voice override; the profile's voice, then the default, otherwise
    ///
    /// # Errors
    /// The reason the attempt failed, which is also published as the session
    /// error. When the network drops mid-attempt this is `ConnectivityLost`;
    /// a `disconnect()` mid-attempt is not an error.
    pub async fn connect(&self, user_id: UserId, voice: Option<String>) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(SessionError::Transport(
                "session controller has been disposed".to_string(),
            ));
        }

        let args = ConnectArgs { user_id, voice };
        let epoch = {
            let mut core = inner.core.lock().await;
            if core.state == ConnectionState::Connecting || core.state.is_connected() {
                tracing::debug!("connect() ignored while {}", core.state);
                return Ok(());
            }

            core.cancel_retry();
            core.reconnect.reset();
            core.epoch += 1;
            core.last_args = Some(args.clone());
            core.user_id = Some(user_id);
            core.error = None;

            if !core.online {
                inner.enter_error(&mut core, SessionError::ConnectivityLost);
                return Err(SessionError::ConnectivityLost);
            }

            inner.set_state(&mut core, ConnectionState::Connecting);
            core.epoch
        };

        tracing::info!("Connecting voice session for user {}", user_id);
        inner.establish(epoch, args, false).await
    }

    /// Tear everything down and return to `idle`. Safe in any state, any number of times.
    pub async fn disconnect(&self) {
        self.inner.shutdown().await;
    }

    /// Disconnect and stop the event loop. The controller cannot be reused.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown().await;
        self.stop_event_loop();
        tracing::debug!("Session controller disposed");
    }

    /// Report a change in network reachability
    pub async fn network_changed(&self, online: bool) {
        let inner = &self.inner;
        let transport = {
            let mut core = inner.core.lock().await;
            if core.online == online {
                return;
            }
            core.online = online;
            tracing::info!("Network is {}", if online { "online" } else { "offline" });

            let mut transport = None;
            if !online {
                if core.state.is_active() {
                    transport = core.detach();
                    inner.enter_error(&mut core, SessionError::ConnectivityLost);
                }
            } else if core.state == ConnectionState::Error
                && core.error == Some(SessionError::ConnectivityLost)
                && core.last_args.is_some()
                && core.reconnect.can_retry()
            {
                core.detach();
                inner.schedule_retry(&mut core);
            }
            inner.publish(&core);
            transport
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Refresh the published balance and eligibility
    pub async fn update_token_balance(&self, user_id: UserId) -> BalanceCheck {
        let check = self.inner.ledger.check_balance(user_id).await;
        let mut core = self.inner.core.lock().await;
        core.token_balance = check.balance;
        core.can_connect = check.can_proceed;
        self.inner.publish(&core);
        check
    }

    fn stop_event_loop(&self) {
        let task = self
            .event_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_event_loop();
    }
}

impl Inner {
    fn publish(&self, core: &SessionCore) {
        self.snapshot.send_replace(core.snapshot());
    }

    fn set_state(&self, core: &mut SessionCore, state: ConnectionState) {
        if core.state != state {
            tracing::info!("Session state: {} -> {}", core.state, state);
            core.state = state;
        }
        self.publish(core);
    }

    /// Terminal error. Balance failures also forget the connect arguments so
    /// nothing resumes the session automatically.
    fn enter_error(&self, core: &mut SessionCore, err: SessionError) {
        tracing::warn!("Session error: {}", err);
        core.cancel_retry();
        core.stop_monitor();
        if err.is_balance_related() {
            core.last_args = None;
            core.can_connect = false;
        }
        core.error = Some(err);
        self.set_state(core, ConnectionState::Error);
    }

    fn event_sink(&self, epoch: u64) -> EventSink {
        let events = self.events.clone();
        Arc::new(move |event| {
            let _ = events.send(LoopEvent::Transport { epoch, event });
        })
    }

    fn activity_callback(&self) -> ActivityCallback {
        let events = self.events.clone();
        Arc::new(move |activity| {
            let _ = events.send(LoopEvent::Speech(activity));
        })
    }

    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        args: ConnectArgs,
        retrying: bool,
    ) -> Result<(), SessionError> {
        match self.open_attempt(epoch, &args).await {
            Ok(()) => Ok(()),
            Err(AttemptError::Superseded) => {
                tracing::debug!("Connection attempt {} superseded", epoch);
                // Whatever took over may have recorded why, e.g. going offline
                match self.core.lock().await.error.clone() {
                    Some(err) if !retrying => Err(err),
                    _ => Ok(()),
                }
            }
            Err(AttemptError::Failed(err)) => {
                self.fail_attempt(epoch, err.clone(), retrying).await;
                Err(err)
            }
        }
    }

    async fn open_attempt(self: &Arc<Self>, epoch: u64, args: &ConnectArgs) -> Result<(), AttemptError> {
        let backend = &self.deps.backend;
        let (balance, profile, credential) = tokio::join!(
            self.ledger.check_balance(args.user_id),
            backend.get_user(args.user_id),
            backend.issue_credential(Some(args.user_id)),
        );

        {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return Err(AttemptError::Superseded);
            }
            core.token_balance = balance.balance;
            core.can_connect = balance.can_proceed;
            self.publish(&core);
        }

        if !balance.can_proceed {
            let err = match balance.error {
                Some(reason) => SessionError::LedgerUnavailable(reason),
                None => {
                    if balance.balance <= self.settings.min_tokens_to_continue
                        && self.ledger.sweep(args.user_id, balance.balance).await
                    {
                        let mut core = self.core.lock().await;
                        if core.epoch == epoch {
                            core.token_balance = 0;
                            self.publish(&core);
                        }
                    }
                    SessionError::InsufficientBalance {
                        balance: balance.balance,
                    }
                }
            };
            return Err(err.into());
        }

        let profile = match profile {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!("Could not load profile for user {}: {}", args.user_id, e);
                None
            }
        };
        let model = profile
            .as_ref()
            .and_then(|p| p.selected_model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());
        let voice = args
            .voice
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| profile.and_then(|p| p.selected_voice))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.settings.default_voice.clone());

        let api_key = credential.map_err(|e| SessionError::CredentialError(e.reason()))?;

        let media = self.deps.media.acquire().await.map_err(SessionError::from)?;

        {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return Err(AttemptError::Superseded);
            }
            core.voice = Some(voice);
            core.monitor.start(&media, self.activity_callback());
            self.publish(&core);
        }

        tracing::debug!("Opening transport (model {})", model);
        let request = OpenRequest {
            api_key,
            model,
            media,
            output: Arc::clone(&self.deps.output),
        };
        let transport = self
            .deps
            .connector
            .open(request, self.event_sink(epoch))
            .await
            .map_err(SessionError::from)?;

        let mut core = self.core.lock().await;
        if core.epoch != epoch {
            drop(core);
            transport.close().await;
            return Err(AttemptError::Superseded);
        }
        core.transport = Some(transport);
        if core.channel_open_pending {
            self.on_channel_open(&mut core).await;
        }
        Ok(())
    }

    async fn fail_attempt(self: &Arc<Self>, epoch: u64, err: SessionError, retrying: bool) {
        let transport = {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return;
            }
            let transport = core.detach();

            if retrying && err.is_retryable() {
                tracing::warn!("Reconnection attempt failed: {}", err);
                if core.online {
                    self.schedule_retry(&mut core);
                } else {
                    self.enter_error(&mut core, SessionError::ConnectivityLost);
                }
            } else {
                self.enter_error(&mut core, err);
            }
            transport
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Move to `reconnecting` and arm the backoff timer, or give up at the cap
    fn schedule_retry(self: &Arc<Self>, core: &mut SessionCore) {
        core.cancel_retry();

        if core.last_args.is_none() {
            self.enter_error(core, SessionError::ConnectionLost);
            return;
        }
        let Some(delay) = core.reconnect.next_delay() else {
            let attempts = core.reconnect.attempts();
            self.enter_error(core, SessionError::MaxRetriesExceeded { attempts });
            return;
        };

        tracing::info!(
            "Reconnecting in {}s (attempt {}/{})",
            delay.as_secs(),
            core.reconnect.attempts(),
            core.reconnect.max_attempts()
        );
        core.error = None;

        let epoch = core.epoch;
        let retry = Arc::clone(self).retry_task(epoch);
        core.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Run the attempt separately so cancelling the timer never cuts it short
            tokio::spawn(retry);
        }));

        self.set_state(core, ConnectionState::Reconnecting);
    }

    fn retry_task(self: Arc<Self>, scheduled_epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let (epoch, args) = {
                let mut core = self.core.lock().await;
                if core.epoch != scheduled_epoch || core.state != ConnectionState::Reconnecting {
                    return;
                }
                core.retry_timer = None;
                let Some(args) = core.last_args.clone() else {
                    return;
                };
                core.epoch += 1;
                (core.epoch, args)
            };

            tracing::info!("Reconnecting voice session for user {}", args.user_id);
            if let Err(e) = self.establish(epoch, args, true).await {
                tracing::debug!("Reconnection attempt ended with: {}", e);
            }
        })
    }

    async fn shutdown(&self) {
        let transport = {
            let mut core = self.core.lock().await;
            core.cancel_retry();
            let transport = core.detach();
            core.stop_monitor();
            core.user_id = None;
            core.voice = None;
            core.session_id = None;
            core.seen_items.clear();
            core.last_args = None;
            core.reconnect.reset();
            core.error = None;
            self.set_state(&mut core, ConnectionState::Idle);
            transport
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
        self.deps.media.release();
        self.deps.output.clear();
        tracing::info!("Voice session disconnected");
    }

    /// End the session after a fatal in-session error
    async fn terminate(&self, epoch: u64, err: SessionError) {
        let transport = {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return;
            }
            let transport = core.detach();
            if err == SessionError::TokensExhausted {
                core.token_balance = 0;
            }
            self.enter_error(&mut core, err);
            transport
        };

        self.deps.output.clear();
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    async fn handle(self: &Arc<Self>, event: LoopEvent) {
        match event {
            LoopEvent::Transport { epoch, event } => self.on_transport_event(epoch, event).await,
            LoopEvent::Speech(activity) => self.on_speech_activity(activity).await,
        }
    }

    async fn on_transport_event(self: &Arc<Self>, epoch: u64, event: TransportEvent) {
        let mut core = self.core.lock().await;
        if core.epoch != epoch {
            tracing::trace!("Dropping {:?} from a closed connection", event);
            return;
        }

        match event {
            TransportEvent::ChannelOpen => {
                if core.transport.is_some() {
                    self.on_channel_open(&mut core).await;
                } else {
                    core.channel_open_pending = true;
                }
            }
            TransportEvent::ChannelClosed => tracing::debug!("Data channel closed"),
            TransportEvent::RemoteAudio => self.deps.routing.apply_best_effort(),
            TransportEvent::PeerState(state) if state.is_lost() && core.transport.is_some() => {
                tracing::warn!("Peer connection {:?}", state);
                let transport = core.detach();
                if core.online {
                    self.schedule_retry(&mut core);
                } else {
                    self.enter_error(&mut core, SessionError::ConnectivityLost);
                }
                drop(core);
                if let Some(transport) = transport {
                    transport.close().await;
                }
            }
            TransportEvent::PeerState(state) => tracing::debug!("Peer connection {:?}", state),
            TransportEvent::Message(text) => {
                drop(core);
                self.on_message(epoch, &text).await;
            }
        }
    }

    async fn on_channel_open(self: &Arc<Self>, core: &mut SessionCore) {
        core.channel_open_pending = false;
        core.interrupted = false;
        core.reconnect.reset();
        core.error = None;

        let voice = core
            .voice
            .clone()
            .unwrap_or_else(|| self.settings.default_voice.clone());
        if let Some(transport) = core.transport.clone() {
            let update = ClientEvent::SessionUpdate {
                session: SessionConfig::for_voice(voice),
            };
            if let Err(e) = transport.send(&update).await {
                tracing::warn!("Failed to send session.update: {}", e);
            }
        }

        if let (Some(user_id), None) = (core.user_id, core.session_id) {
            self.register_voice_session(core.epoch, user_id);
        }

        self.set_state(core, ConnectionState::Connected);
    }

    fn register_voice_session(self: &Arc<Self>, epoch: u64, user_id: UserId) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.deps.backend.create_voice_session(user_id).await {
                Ok(session_id) => {
                    let mut core = inner.core.lock().await;
                    if core.epoch == epoch && core.session_id.is_none() {
                        tracing::info!("Voice session {} registered", session_id);
                        core.session_id = Some(session_id);
                        inner.publish(&core);
                    }
                }
                Err(e) => tracing::warn!("Failed to register voice session: {}", e),
            }
        });
    }

    async fn on_message(self: &Arc<Self>, epoch: u64, text: &str) {
        let event = match ServerEvent::decode(text) {
            Ok(event) => event,
            Err(DecodeError::UnknownType(kind)) => {
                tracing::warn!("Unhandled provider event: {}", kind);
                return;
            }
            Err(e) => {
                tracing::debug!("Ignoring provider message: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::SpeechStarted { .. } => {
                self.transition(epoch, ConnectionState::Listening).await;
            }
            ServerEvent::SpeechStopped { .. } | ServerEvent::InputCommitted { .. } => {
                tracing::debug!("Input audio turn ended");
            }
            ServerEvent::ResponseCreated { .. } => {
                if self.transition(epoch, ConnectionState::Thinking).await {
                    self.core.lock().await.interrupted = false;
                    if self.deps.output.is_paused() {
                        tracing::debug!("Resuming playback for the new response");
                        self.deps.output.resume();
                    }
                }
            }
            ServerEvent::AudioDelta { .. } => {
                if self.transition(epoch, ConnectionState::Speaking).await {
                    self.barge_in().await;
                }
            }
            ServerEvent::AudioDone { .. } => {
                self.transition(epoch, ConnectionState::Connected).await;
            }
            ServerEvent::ResponseDone { response } => self.on_response_done(epoch, response).await,
            ServerEvent::ConversationItemDone { item: Some(item) } => {
                self.on_item_done(epoch, item).await
            }
            ServerEvent::ConversationItemDone { item: None } => {}
            ServerEvent::Error { error } => self.on_provider_error(epoch, error).await,
            ServerEvent::Unrecognized => {}
        }
    }

    /// Move between live sub-states. False if the event no longer applies.
    async fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let mut core = self.core.lock().await;
        if core.epoch != epoch || !core.state.is_connected() {
            return false;
        }
        self.set_state(&mut core, state);
        true
    }

    async fn on_response_done(&self, epoch: u64, response: Option<ResponseData>) {
        if !self.transition(epoch, ConnectionState::Connected).await {
            return;
        }
        let user_id = self.core.lock().await.user_id;

        let Some(response) = response else {
            return;
        };
        let (Some(user_id), Some(usage)) = (user_id, response.usage) else {
            return;
        };
        let response_id = response
            .id
            .unwrap_or_else(|| format!("session_{}", chrono::Utc::now().timestamp_millis()));

        match self.ledger.settle_response(user_id, &response_id, usage).await {
            Ok(balance) => {
                let mut core = self.core.lock().await;
                if core.epoch == epoch {
                    core.token_balance = balance;
                    core.can_connect = balance > self.settings.min_tokens_to_start;
                    self.publish(&core);
                }
            }
            Err(err) => self.terminate(epoch, err).await,
        }
    }

    async fn on_item_done(&self, epoch: u64, item: ConversationItem) {
        let request = {
            let mut core = self.core.lock().await;
            if core.epoch != epoch {
                return;
            }
            // Every id counts as seen, persistable or not
            let known_id = item.id.clone().filter(|id| !id.is_empty());
            if let Some(id) = &known_id {
                if !core.seen_items.insert(id.clone()) {
                    tracing::debug!("Skipping duplicate conversation item {}", id);
                    return;
                }
            }
            let Some((role, content)) = item.transcript() else {
                return;
            };
            if known_id.is_none() {
                let fallback =
                    format!("{}_{}", role.as_str(), chrono::Utc::now().timestamp_millis());
                if !core.seen_items.insert(fallback) {
                    return;
                }
            }
            let Some(user_id) = core.user_id else {
                return;
            };
            SaveMessageRequest {
                user_id,
                session_id: core.session_id,
                message_type: role,
                content,
                audio_duration_seconds: 0,
            }
        };

        if let Err(e) = self.deps.backend.save_message(&request).await {
            tracing::warn!("Failed to save {} message: {}", request.message_type.as_str(), e);
        }
    }

    async fn on_provider_error(&self, epoch: u64, error: Option<ProviderError>) {
        let message = error
            .and_then(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string());
        tracing::warn!("Provider reported an error: {}", message);

        let mut core = self.core.lock().await;
        if core.epoch == epoch {
            core.error = Some(SessionError::ServerReportedError(message));
            self.publish(&core);
        }
    }

    async fn on_speech_activity(&self, activity: SpeechActivity) {
        {
            let mut core = self.core.lock().await;
            if !core.monitor.is_running() {
                return;
            }
            core.user_speaking = activity == SpeechActivity::Started;
        }
        self.barge_in().await;
    }

    /// Interrupt the assistant if the user is talking over it. At most once
    /// per response; `response.created` re-arms it.
    async fn barge_in(&self) {
        let (epoch, transport) = {
            let mut core = self.core.lock().await;
            if !core.user_speaking || core.interrupted || core.state != ConnectionState::Speaking {
                return;
            }
            let Some(transport) = core.transport.clone() else {
                return;
            };
            core.interrupted = true;
            (core.epoch, transport)
        };

        tracing::info!("User interrupted the assistant");
        fade_out(self.deps.output.as_ref()).await;
        if let Err(e) = transport.send(&ClientEvent::ResponseCancel).await {
            tracing::warn!("Failed to send response.cancel: {}", e);
        }

        let mut core = self.core.lock().await;
        if core.epoch == epoch && core.state == ConnectionState::Speaking {
            self.set_state(&mut core, ConnectionState::Listening);
        }
    }
}
