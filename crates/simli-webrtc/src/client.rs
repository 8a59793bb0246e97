//! Connection orchestrator
//!
//! Top-level state machine sequencing token acquisition, ICE discovery,
//! peer-connection negotiation, and the signaling session. Owns every
//! transport resource exclusively: starting a new attempt always tears
//! down the previous one first, and all failure paths converge on one
//! idempotent cleanup routine.

use crate::config::SimliClientConfig;
use crate::events::{EventBus, HandlerId, SessionEvent, SessionEventKind};
use crate::health::{self, PingTracker, ANSWER_TIMEOUT, CONNECTION_TIMEOUT};
use crate::ice::IceServerResolver;
use crate::media::{self, AudioCapturePipeline, MediaSink};
use crate::peer::{PeerConnectionManager, PeerObservation};
use crate::session::SessionTokenProvider;
use crate::signaling::{
    derive_ws_url, ControlToken, SignalingChannel, SignalingEvent, SignalingMessage,
};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Session lifecycle state, owned exclusively by the orchestrator
///
/// Other components report observations over channels; only the
/// orchestrator transitions this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt in progress
    Idle,
    /// Resolving ICE servers / acquiring the session token / building the offer
    Connecting,
    /// Signaling WebSocket connected
    SignalingOpen,
    /// Offer sent, awaiting the remote answer
    Negotiating,
    /// START received; audio may flow
    Active,
    /// Session ended (caller close, STOP, or connection loss)
    Disconnected,
    /// Terminal failure for the last attempt
    Failed,
}

/// Point-in-time connection status snapshot
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// Orchestrator state
    pub state: ConnectionState,
    /// Whether the session has been activated by the service
    pub session_active: bool,
    /// Whether the signaling transport is open
    pub websocket_open: bool,
    /// Native peer connection state, if a connection exists
    pub peer_connection_state: Option<RTCPeerConnectionState>,
    /// Most recent recorded failure reason
    pub error_reason: Option<String>,
    /// Total connection attempts made by this client
    pub connection_attempts: u32,
    /// Latency of the most recent ping round trip
    pub last_latency_ms: Option<u64>,
}

/// Resources owned by one connection attempt
struct ActiveSession {
    signaling: Arc<SignalingChannel>,
    peer: Arc<PeerConnectionManager>,
    pump: JoinHandle<()>,
    ping: Option<JoinHandle<()>>,
}

/// Client for one avatar-rendering session at a time
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct SimliClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SimliClientConfig,
    ice: IceServerResolver,
    tokens: SessionTokenProvider,
    media_sink: Arc<dyn MediaSink>,
    events: EventBus,
    pings: Arc<PingTracker>,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<ActiveSession>>,
    capture: RwLock<Option<AudioCapturePipeline>>,
    error_reason: RwLock<Option<String>>,
    connection_attempts: AtomicU32,
    avatar_speaking: AtomicBool,
}

impl SimliClient {
    /// Create a client from a validated configuration
    ///
    /// `media_sink` receives incoming remote audio/video tracks; the
    /// client never renders media itself.
    pub fn new(config: SimliClientConfig, media_sink: Arc<dyn MediaSink>) -> Result<Self> {
        config.validate()?;

        let ice = IceServerResolver::new(config.api_base_url.clone(), config.ice_retry)?;
        let tokens = SessionTokenProvider::new(&config)?;

        info!(base_url = %config.api_base_url, "simli client initialized");

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                ice,
                tokens,
                media_sink,
                events: EventBus::new(),
                pings: Arc::new(PingTracker::new()),
                state: RwLock::new(ConnectionState::Idle),
                session: RwLock::new(None),
                capture: RwLock::new(None),
                error_reason: RwLock::new(None),
                connection_attempts: AtomicU32::new(0),
                avatar_speaking: AtomicBool::new(false),
            }),
        })
    }

    /// Establish the session, retrying per the configured policy
    ///
    /// Resolves once negotiation completes; the `connected` event fires
    /// when the service activates the session with START. After the last
    /// failed attempt a single terminal `failed` event is emitted and the
    /// final error is returned.
    pub async fn start(&self) -> Result<()> {
        ClientInner::start(&self.inner).await
    }

    /// Attach a microphone sample stream to the session
    ///
    /// Replaces any previously attached stream. Frames are transmitted
    /// only while the session is active.
    pub fn listen_to_mediastream_track(&self, samples: mpsc::Receiver<Vec<f32>>) {
        ClientInner::listen_to_mediastream_track(&self.inner, samples);
    }

    /// Transmit one audio payload
    ///
    /// Silently dropped (not queued) unless the session is active and the
    /// signaling transport is open.
    pub fn send_audio_data(&self, frame: &[u8]) {
        self.inner.send_audio_data(frame);
    }

    /// Ask the service to drop buffered, not-yet-rendered audio
    pub fn clear_buffer(&self) {
        self.inner.clear_buffer();
    }

    /// End the session
    ///
    /// Emits `disconnected` before cleanup runs; safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Whether the session is active end to end
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Whether the avatar is currently speaking
    pub fn is_avatar_speaking(&self) -> bool {
        self.inner.avatar_speaking.load(Ordering::Acquire)
    }

    /// Current connection status snapshot
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection_status()
    }

    /// Subscribe to a session event
    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> HandlerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Unsubscribe a previously registered handler
    pub fn off(&self, kind: SessionEventKind, id: HandlerId) -> bool {
        self.inner.events.off(kind, id)
    }
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "connection state transition");
            *current = state;
        }
    }

    fn record_error(&self, reason: String) {
        *self.error_reason.write() = Some(reason);
    }

    /// Bounded attempt loop; never recurses
    async fn start(inner: &Arc<Self>) -> Result<()> {
        let policy = inner.config.connect_retry;
        let mut last_error: Option<Error> = None;
        let mut attempts_made = 0;

        for attempt in 1..=policy.max_attempts {
            attempts_made = attempt;
            inner.connection_attempts.fetch_add(1, Ordering::AcqRel);

            // prior attempt's resources must be gone before new ones exist
            inner.cleanup().await;

            match health::deadline(
                "connection",
                CONNECTION_TIMEOUT,
                Self::connect_once(inner, attempt),
            )
            .await
            {
                Ok(()) => {
                    info!(attempt, "session negotiated");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "connection attempt failed");
                    inner.record_error(e.to_string());
                    inner.cleanup().await;

                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if policy.should_retry(attempt) {
                        tokio::time::sleep(policy.delay()).await;
                    }
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| Error::PeerConnection("connection attempt loop ended".to_string()));
        let reason = format!("failed to connect after {} attempt(s): {}", attempts_made, error);

        inner.record_error(reason.clone());
        inner.set_state(ConnectionState::Failed);
        inner.events.emit(&SessionEvent::Failed(reason));
        Err(error)
    }

    /// One pass through the Connecting → Negotiating sequence
    async fn connect_once(inner: &Arc<Self>, attempt: u32) -> Result<()> {
        debug!(attempt, "starting connection sequence");
        *inner.error_reason.write() = None;
        inner.set_state(ConnectionState::Connecting);

        // ICE discovery and token acquisition are independent HTTP
        // exchanges; run them concurrently.
        let (ice_servers, token) = tokio::join!(inner.ice.resolve(), inner.tokens.acquire());
        let token = token?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(
            PeerConnectionManager::new(ice_servers, inner.media_sink.clone(), peer_tx).await?,
        );
        let offer_json = peer.create_offer().await?;

        let ws_url = derive_ws_url(&inner.config.api_base_url, None)?;
        let (signaling, signaling_rx) =
            SignalingChannel::connect(&ws_url, inner.pings.clone()).await?;
        let signaling = Arc::new(signaling);
        inner.set_state(ConnectionState::SignalingOpen);

        // Wire ordering is mandatory: offer first, then the raw token.
        signaling.send_offer(&offer_json)?;
        signaling.send_session_token(&token)?;
        inner.set_state(ConnectionState::Negotiating);

        let (answer_tx, mut answer_rx) = watch::channel(None::<String>);
        let pump = tokio::spawn(session_pump(
            inner.clone(),
            signaling.clone(),
            peer.clone(),
            signaling_rx,
            peer_rx,
            answer_tx,
        ));

        *inner.session.write() = Some(ActiveSession {
            signaling: signaling.clone(),
            peer: peer.clone(),
            pump,
            ping: None,
        });

        let answer_sdp = health::deadline("answer wait", ANSWER_TIMEOUT, async {
            loop {
                if let Some(sdp) = answer_rx.borrow_and_update().clone() {
                    return Ok(sdp);
                }
                answer_rx.changed().await.map_err(|_| {
                    Error::Signaling("signaling ended before the answer arrived".to_string())
                })?;
            }
        })
        .await?;

        peer.apply_answer(&answer_sdp).await?;
        debug!(attempt, "remote answer applied");
        Ok(())
    }

    fn listen_to_mediastream_track(inner: &Arc<Self>, samples: mpsc::Receiver<Vec<f32>>) {
        let sink = inner.clone();
        let pipeline =
            AudioCapturePipeline::attach(samples, move |frame| sink.send_audio_data(&frame));

        if let Some(old) = inner.capture.write().replace(pipeline) {
            old.detach();
        }
        debug!("audio capture pipeline attached");
    }

    fn send_audio_data(&self, frame: &[u8]) {
        if self.state() != ConnectionState::Active {
            debug!("session not active, dropping audio frame");
            return;
        }

        let signaling = self.session.read().as_ref().map(|s| s.signaling.clone());
        match signaling {
            Some(channel) if channel.is_open() => {
                if let Err(e) = channel.send_audio(frame) {
                    warn!(error = %e, "failed to send audio frame");
                }
            }
            _ => debug!("signaling transport not open, dropping audio frame"),
        }
    }

    fn clear_buffer(&self) {
        let signaling = self.session.read().as_ref().map(|s| s.signaling.clone());
        match signaling {
            Some(channel) if channel.is_open() => {
                if let Err(e) = channel.send_clear_buffer() {
                    warn!(error = %e, "failed to send buffer-clear request");
                }
            }
            _ => warn!("cannot clear buffer, signaling transport not open"),
        }
    }

    async fn close(&self) {
        info!("closing session");
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(&SessionEvent::Disconnected);
        self.cleanup().await;
    }

    fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Active {
            return false;
        }
        let session = self.session.read();
        match session.as_ref() {
            Some(s) => {
                s.signaling.is_open()
                    && s.peer.connection_state() == RTCPeerConnectionState::Connected
            }
            None => false,
        }
    }

    fn connection_status(&self) -> ConnectionStatus {
        let state = self.state();
        let session = self.session.read();
        ConnectionStatus {
            state,
            session_active: state == ConnectionState::Active,
            websocket_open: session.as_ref().map(|s| s.signaling.is_open()).unwrap_or(false),
            peer_connection_state: session.as_ref().map(|s| s.peer.connection_state()),
            error_reason: self.error_reason.read().clone(),
            connection_attempts: self.connection_attempts.load(Ordering::Acquire),
            last_latency_ms: self.pings.last_latency_ms(),
        }
    }

    /// Tear down all transport resources for the current attempt
    ///
    /// Idempotent: every handle is Option-guarded, so invoking this twice
    /// in a row is safe and leaves all handles empty.
    async fn cleanup(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.pump.abort();
            if let Some(ping) = session.ping {
                ping.abort();
            }
            session.signaling.close();
            if let Err(e) = session.peer.close().await {
                debug!(error = %e, "error closing peer connection");
            }
        }

        if let Some(capture) = self.capture.write().take() {
            capture.detach();
        }

        self.pings.clear();
        self.avatar_speaking.store(false, Ordering::Release);
        debug!("cleanup complete");
    }
}

/// Consumes signaling messages and peer observations for one attempt
async fn session_pump(
    inner: Arc<ClientInner>,
    signaling: Arc<SignalingChannel>,
    _peer: Arc<PeerConnectionManager>,
    mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    mut peer_rx: mpsc::UnboundedReceiver<PeerObservation>,
    answer_tx: watch::Sender<Option<String>>,
) {
    loop {
        tokio::select! {
            event = signaling_rx.recv() => match event {
                Some(SignalingEvent::Message(msg)) => {
                    if !handle_signaling_message(&inner, &signaling, msg, &answer_tx) {
                        break;
                    }
                }
                Some(SignalingEvent::Closed(reason)) => {
                    on_transport_lost(&inner, format!("WebSocket closed: {}", reason));
                    break;
                }
                None => {
                    on_transport_lost(&inner, "signaling event stream ended".to_string());
                    break;
                }
            },
            observation = peer_rx.recv() => match observation {
                Some(PeerObservation::Connected) => {
                    debug!("peer connection established");
                }
                Some(PeerObservation::Disconnected) => {
                    if inner.state() == ConnectionState::Active {
                        info!("connection lost, attempting to reconnect");
                        reconnect::spawn_reconnect(inner.clone());
                        break;
                    }
                    debug!("peer disconnected before session was active");
                }
                Some(PeerObservation::Failed(reason)) => {
                    on_transport_lost(&inner, reason);
                    break;
                }
                Some(PeerObservation::Closed) => {
                    on_transport_lost(&inner, "peer connection closed".to_string());
                    break;
                }
                None => break,
            },
        }
    }

    debug!("session pump terminated");
}

/// Dispatch one decoded signaling message; returns false to stop the pump
fn handle_signaling_message(
    inner: &Arc<ClientInner>,
    signaling: &Arc<SignalingChannel>,
    msg: SignalingMessage,
    answer_tx: &watch::Sender<Option<String>>,
) -> bool {
    match msg {
        SignalingMessage::Control(ControlToken::Start) => {
            info!("session activated");
            inner.set_state(ConnectionState::Active);

            // primer frame warms the remote audio path before real audio
            if let Err(e) = signaling.send_audio(&media::primer_frame()) {
                warn!(error = %e, "failed to send primer frame");
            }

            let ping = tokio::spawn(health::ping_task(signaling.clone(), inner.pings.clone()));
            let mut session = inner.session.write();
            if let Some(session) = session.as_mut() {
                if let Some(old) = session.ping.replace(ping) {
                    old.abort();
                }
            } else {
                ping.abort();
            }
            drop(session);

            inner.events.emit(&SessionEvent::Connected);
            true
        }
        SignalingMessage::Control(ControlToken::Stop) => {
            info!("service requested session stop");
            let inner = inner.clone();
            tokio::spawn(async move { inner.close().await });
            false
        }
        SignalingMessage::Control(ControlToken::Ack) => {
            debug!("payload acknowledged");
            true
        }
        SignalingMessage::Control(ControlToken::Speak) => {
            inner.avatar_speaking.store(true, Ordering::Release);
            inner.events.emit(&SessionEvent::Speaking);
            true
        }
        SignalingMessage::Control(ControlToken::Silent) => {
            inner.avatar_speaking.store(false, Ordering::Release);
            inner.events.emit(&SessionEvent::Silent);
            true
        }
        SignalingMessage::Pong { .. } => true, // correlated at the channel boundary
        SignalingMessage::Answer { sdp } => {
            debug!("remote answer received");
            let _ = answer_tx.send(Some(sdp));
            true
        }
        SignalingMessage::Raw(_) => true, // logged at the channel boundary
    }
}

/// Transport loss: terminal when the session was active, otherwise the
/// in-flight attempt surfaces the failure itself
fn on_transport_lost(inner: &Arc<ClientInner>, reason: String) {
    if inner.state() == ConnectionState::Active {
        error!(reason = %reason, "connection failure");
        inner.record_error(reason.clone());
        inner.set_state(ConnectionState::Failed);
        inner.events.emit(&SessionEvent::Failed(reason));

        let inner = inner.clone();
        tokio::spawn(async move { inner.cleanup().await });
    } else {
        debug!(reason = %reason, "transport lost during connection attempt");
        inner.record_error(reason);
    }
}

/// Reconnect spawn isolated in its own module.
///
/// Spawning the recursive [`ClientInner::start`] future directly inside
/// `client` tripped a rustc limitation: it cannot check whether the
/// hidden type of an `async fn`'s opaque return satisfies `Send` while
/// still inside that type's defining scope. Moving the `tokio::spawn`
/// that forces the `Send` check into a submodule resolves the opaque
/// type's auto traits from outside that scope.
mod reconnect {
    use super::*;

    pub(super) fn spawn_reconnect(inner: Arc<ClientInner>) {
        tokio::spawn(async move {
            inner.set_state(ConnectionState::Disconnected);
            inner.cleanup().await;
            if let Err(e) = ClientInner::start(&inner).await {
                error!(error = %e, "reconnection failed");
            }
        });
    }
}
