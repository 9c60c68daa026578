//! Session Orchestration
//!
//! Ties one signaling channel, one negotiator and the reconnect supervisor
//! into a streaming session for a single endpoint address. Every event of a
//! session (channel lifecycle, inbound messages, peer events, retry timer
//! firings and the shutdown request) is handled by one driver task, so the
//! session state has a single writer.

use super::supervisor::{ReconnectSupervisor, ReconnectTick};
use crate::capture::MediaSource;
use crate::config::{Config, EndpointAddress, ReconnectPolicy, SignalingConfig};
use crate::transport::{ChannelConnector, ChannelEvent, ChannelEventKind, ChannelState, SignalingChannel, WebSocketConnector};
use crate::webrtc::{
    NegotiationPhase, Negotiator, NetworkPathCandidate, PeerBackend, PeerEvent, PeerState, RtcPeerBackend,
    SessionDescription, SessionError, SignalingMessage,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Pause between stop and start when the endpoint address changes
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the driver to finish teardown
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Behaviour knobs of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub reconnect_delay: Duration,
    pub reconnect_policy: ReconnectPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            reconnect_policy: config.reconnect_policy,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

/// Point-in-time view of a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: String,
    pub address: EndpointAddress,
    pub channel: ChannelState,
    pub peer: PeerState,
    pub phase: NegotiationPhase,
    pub reconnect_pending: bool,
    pub reconnect_attempts: u64,
    pub remote_candidates_applied: usize,
}

struct RunningSession {
    address: EndpointAddress,
    cancelled: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    status: Arc<Mutex<SessionStatus>>,
    driver: JoinHandle<()>,
    /// Fires once a driver that died without teardown has been cleaned up
    released: oneshot::Receiver<()>,
}

/// Owns at most one live session and exposes start/stop/restart
pub struct Orchestrator {
    settings: SessionSettings,
    backend: Arc<dyn PeerBackend>,
    connector: Arc<dyn ChannelConnector>,
    media: Arc<dyn MediaSource>,
    running: Option<RunningSession>,
}

impl Orchestrator {
    pub fn new(
        settings: SessionSettings,
        backend: Arc<dyn PeerBackend>,
        connector: Arc<dyn ChannelConnector>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        Self {
            settings,
            backend,
            connector,
            media,
            running: None,
        }
    }

    /// Orchestrator backed by webrtc-rs and a WebSocket signaling channel
    pub fn from_config(config: &Config, media: Arc<dyn MediaSource>) -> Self {
        Self::new(
            SessionSettings::from_config(&config.signaling),
            Arc::new(RtcPeerBackend::new(config.webrtc.clone())),
            Arc::new(WebSocketConnector::new(config.signaling.connect_timeout())),
            media,
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address of the running session
    pub fn address(&self) -> Option<&EndpointAddress> {
        self.running.as_ref().map(|r| &r.address)
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.running.as_ref().map(|r| r.status.lock().clone())
    }

    pub fn peer_state(&self) -> PeerState {
        self.running
            .as_ref()
            .map(|r| r.status.lock().peer)
            .unwrap_or(PeerState::Closed)
    }

    /// Start streaming to `address`.
    ///
    /// Acquires capture and the peer transport, then connects the signaling
    /// channel. Starting again with the same address is a no-op; a different
    /// address requires `stop` first.
    pub async fn start(&mut self, address: EndpointAddress) -> Result<(), SessionError> {
        if let Some(ref running) = self.running {
            if running.address == address {
                debug!("Session for {} already running", address);
                return Ok(());
            }
            return Err(SessionError::Protocol(format!(
                "session for {} still running, stop it before starting {}",
                running.address, address
            )));
        }

        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        info!("[{}] Starting session for {}", id, address);

        let cancelled = Arc::new(AtomicBool::new(false));
        let negotiator =
            Negotiator::create_session(self.backend.as_ref(), self.media.clone(), cancelled.clone()).await?;

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (released_tx, released_rx) = oneshot::channel();
        let status = Arc::new(Mutex::new(SessionStatus {
            id: id.clone(),
            address: address.clone(),
            channel: ChannelState::Idle,
            peer: PeerState::New,
            phase: NegotiationPhase::Idle,
            reconnect_pending: false,
            reconnect_attempts: 0,
            remote_candidates_applied: 0,
        }));

        let session = Session {
            id,
            address: address.clone(),
            policy: self.settings.reconnect_policy,
            backend: self.backend.clone(),
            connector: self.connector.clone(),
            media: self.media.clone(),
            cancelled: cancelled.clone(),
            negotiator: Some(negotiator),
            channel: None,
            open_handled: false,
            last_channel_state: ChannelState::Idle,
            generation: 0,
            channel_events: channel_tx,
            supervisor: ReconnectSupervisor::new(self.settings.reconnect_delay, tick_tx),
            gathered: Vec::new(),
            outbox: Vec::new(),
            peer_state: PeerState::New,
            status: status.clone(),
            released: Some(released_tx),
        };
        let driver = tokio::spawn(session.run(channel_rx, tick_rx, shutdown_rx));

        self.running = Some(RunningSession {
            address,
            cancelled,
            shutdown: shutdown_tx,
            status,
            driver,
            released: released_rx,
        });
        Ok(())
    }

    /// Stop the running session and release everything it holds. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Stop requested with no running session");
            return;
        };
        info!("Stopping session for {}", running.address);

        running.cancelled.store(true, Ordering::SeqCst);
        let _ = running.shutdown.send(true);

        let mut driver = running.driver;
        let clean = match tokio::time::timeout(STOP_TIMEOUT, &mut driver).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Session driver ended abnormally: {}", e);
                false
            }
            Err(_) => {
                warn!("Session teardown exceeded {:?}, aborting", STOP_TIMEOUT);
                driver.abort();
                false
            }
        };
        if !clean {
            // Dropping the driver state hands its negotiator and channel to a release task
            if tokio::time::timeout(STOP_TIMEOUT, running.released).await.is_err() {
                warn!("Session resources were not released within {:?}", STOP_TIMEOUT);
            }
            self.media.stop_capture();
        }
        info!("Session for {} stopped", running.address);
    }

    /// Full stop/start cycle, used when the endpoint address changes
    pub async fn restart(&mut self, address: EndpointAddress) -> Result<(), SessionError> {
        self.stop().await;
        tokio::time::sleep(RESTART_SETTLE_DELAY).await;
        self.start(address).await
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancelled.store(true, Ordering::SeqCst);
            let _ = running.shutdown.send(true);
        }
    }
}

/// State of one session, owned by its driver task
struct Session {
    id: String,
    address: EndpointAddress,
    policy: ReconnectPolicy,
    backend: Arc<dyn PeerBackend>,
    connector: Arc<dyn ChannelConnector>,
    media: Arc<dyn MediaSource>,
    cancelled: Arc<AtomicBool>,
    negotiator: Option<Negotiator>,
    channel: Option<SignalingChannel>,
    /// The current channel's `Open` event has been handled
    open_handled: bool,
    last_channel_state: ChannelState,
    generation: u64,
    channel_events: mpsc::UnboundedSender<ChannelEvent>,
    supervisor: ReconnectSupervisor,
    /// Local candidates gathered for the current offer
    gathered: Vec<NetworkPathCandidate>,
    /// Local candidates not yet transmitted
    outbox: Vec<NetworkPathCandidate>,
    peer_state: PeerState,
    status: Arc<Mutex<SessionStatus>>,
    released: Option<oneshot::Sender<()>>,
}

impl Session {
    async fn run(
        mut self,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut ticks: mpsc::UnboundedReceiver<ReconnectTick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.is_cancelled() {
            self.connect_channel().await;
            self.publish();
        }

        while !self.is_cancelled() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = channel_rx.recv() => self.on_channel_event(event).await,
                Some(tick) = ticks.recv() => self.on_reconnect_tick(tick).await,
                event = next_peer_event(&mut self.negotiator) => self.on_peer_event(event),
            }
            self.publish();
        }

        self.teardown().await;
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn connect_channel(&mut self) {
        self.release_channel().await;
        self.generation += 1;
        self.channel = Some(SignalingChannel::connect(
            self.connector.as_ref(),
            self.address.clone(),
            self.generation,
            self.channel_events.clone(),
        ));
    }

    async fn release_channel(&mut self) {
        self.open_handled = false;
        if let Some(mut channel) = self.channel.take() {
            self.last_channel_state = channel.state();
            channel.close().await;
        }
    }

    /// Open as seen by the session, not just by the I/O side
    fn channel_open(&self) -> bool {
        self.open_handled && self.channel.as_ref().map(|c| c.state() == ChannelState::Open).unwrap_or(false)
    }

    fn send(&self, message: &SignalingMessage) -> bool {
        match self.channel {
            Some(ref channel) => channel.send_message(message),
            None => false,
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        if event.generation != self.generation {
            debug!("[{}] Ignoring event from stale channel #{}", self.id, event.generation);
            return;
        }

        match event.kind {
            ChannelEventKind::Open => self.on_channel_open().await,
            ChannelEventKind::Message(text) => self.on_message(&text).await,
            ChannelEventKind::Closed(reason) => {
                warn!("[{}] Signaling channel closed: {}", self.id, reason);
                self.on_channel_lost().await;
            }
            ChannelEventKind::Failure(cause) => {
                warn!("[{}] Signaling channel failed: {}", self.id, cause);
                self.on_channel_lost().await;
            }
        }
    }

    async fn on_channel_open(&mut self) {
        info!("[{}] Signaling channel #{} open", self.id, self.generation);
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };

        match negotiator.phase() {
            NegotiationPhase::Idle => match negotiator.create_offer().await {
                Ok(offer) => {
                    self.send(&SignalingMessage::offer(&offer));
                }
                Err(e) => {
                    log_failure(&self.id, "offer", &e);
                    return;
                }
            },
            NegotiationPhase::AwaitingAnswer => {
                if let Some(offer) = negotiator.local_offer().cloned() {
                    info!("[{}] Channel resumed before an answer arrived, re-sending offer", self.id);
                    self.send(&SignalingMessage::offer(&offer));
                    self.outbox = self.gathered.clone();
                }
            }
            NegotiationPhase::Established => {
                info!("[{}] Channel resumed, session already negotiated", self.id);
            }
            NegotiationPhase::CreatingOffer | NegotiationPhase::Disposed => {}
        }

        self.open_handled = true;
        for candidate in std::mem::take(&mut self.outbox) {
            self.send(&SignalingMessage::candidate(candidate));
        }
    }

    async fn on_message(&mut self, text: &str) {
        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Dropping signaling message: {}", self.id, e);
                return;
            }
        };
        let kind = message.kind();
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };

        let result = match message {
            SignalingMessage::Answer { sdp } => negotiator.apply_remote_answer(SessionDescription::answer(sdp)).await,
            SignalingMessage::Candidate { candidate } => negotiator.apply_remote_candidate(candidate).await,
            SignalingMessage::Offer { .. } => {
                Err(SessionError::Protocol("this device is the offerer, remote offers are not accepted".to_string()))
            }
        };
        if let Err(e) = result {
            log_failure(&self.id, kind, &e);
        }
    }

    async fn on_channel_lost(&mut self) {
        self.release_channel().await;
        if self.is_cancelled() {
            return;
        }
        self.supervisor.schedule();
    }

    async fn on_reconnect_tick(&mut self, tick: ReconnectTick) {
        if !self.supervisor.on_fire(tick) || self.is_cancelled() {
            return;
        }

        if self.policy == ReconnectPolicy::Renegotiate {
            if let Err(e) = self.renegotiate().await {
                error!("[{}] Could not rebuild peer connection: {}", self.id, e);
                self.supervisor.schedule();
                return;
            }
        }

        info!("[{}] Reconnecting to {} (attempt {})", self.id, self.address, tick.attempt);
        self.connect_channel().await;
    }

    async fn renegotiate(&mut self) -> Result<(), SessionError> {
        if let Some(mut old) = self.negotiator.take() {
            old.dispose().await;
        }
        self.gathered.clear();
        self.outbox.clear();
        self.peer_state = PeerState::New;

        let negotiator =
            Negotiator::create_session(self.backend.as_ref(), self.media.clone(), self.cancelled.clone()).await?;
        self.negotiator = Some(negotiator);
        Ok(())
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.gathered.push(candidate.clone());
                if self.channel_open() {
                    self.send(&SignalingMessage::candidate(candidate));
                } else {
                    debug!("[{}] Holding local candidate until the channel opens", self.id);
                    self.outbox.push(candidate);
                }
            }
            PeerEvent::StateChanged(state) => {
                info!("[{}] Peer connection state: {}", self.id, state);
                self.peer_state = state;
            }
            other => debug!("[{}] Peer event: {:?}", self.id, other),
        }
    }

    async fn teardown(&mut self) {
        self.supervisor.cancel();
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.dispose().await;
        }
        self.release_channel().await;
        self.last_channel_state = ChannelState::Closed;
        self.peer_state = PeerState::Closed;
        self.publish();
        info!("[{}] Session torn down", self.id);
    }

    fn publish(&self) {
        let mut status = self.status.lock();
        status.channel = self.channel.as_ref().map(|c| c.state()).unwrap_or(self.last_channel_state);
        status.peer = self.peer_state;
        status.phase = self.negotiator.as_ref().map(|n| n.phase()).unwrap_or(NegotiationPhase::Disposed);
        status.reconnect_pending = self.supervisor.is_pending();
        status.reconnect_attempts = self.supervisor.attempts();
        status.remote_candidates_applied = self.negotiator.as_ref().map(|n| n.applied_candidates()).unwrap_or(0);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let negotiator = self.negotiator.take();
        let channel = self.channel.take();
        let released = self.released.take();
        if negotiator.is_none() && channel.is_none() {
            return;
        }

        warn!("[{}] Session driver exited without teardown, releasing its resources", self.id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Some(mut negotiator) = negotiator {
                negotiator.dispose().await;
            }
            if let Some(mut channel) = channel {
                channel.close().await;
            }
            if let Some(released) = released {
                let _ = released.send(());
            }
        });
    }
}

async fn next_peer_event(negotiator: &mut Option<Negotiator>) -> PeerEvent {
    match negotiator {
        Some(negotiator) => negotiator.next_event().await,
        None => std::future::pending().await,
    }
}

fn log_failure(id: &str, context: &str, e: &SessionError) {
    match e {
        SessionError::Protocol(_) => warn!("[{}] Ignored {}: {}", id, context, e),
        _ => error!("[{}] Handling {} failed: {}", id, context, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockConnector, MockMediaSource};
    use tokio::time::Instant;

    struct Harness {
        orchestrator: Orchestrator,
        backend: MockBackend,
        connector: MockConnector,
        media: Arc<MockMediaSource>,
    }

    fn harness(policy: ReconnectPolicy) -> Harness {
        harness_with_media(policy, MockMediaSource::new())
    }

    fn harness_with_media(policy: ReconnectPolicy, media: Arc<MockMediaSource>) -> Harness {
        let backend = MockBackend::new();
        let connector = MockConnector::new();
        let settings = SessionSettings {
            reconnect_delay: Duration::from_millis(3000),
            reconnect_policy: policy,
        };
        let orchestrator =
            Orchestrator::new(settings, Arc::new(backend.clone()), Arc::new(connector.clone()), media.clone());
        Harness { orchestrator, backend, connector, media }
    }

    fn endpoint(s: &str) -> EndpointAddress {
        EndpointAddress::parse(s).unwrap()
    }

    fn candidate_json(candidate: &str) -> String {
        SignalingMessage::candidate(NetworkPathCandidate::new(candidate, "0", 0)).to_json().unwrap()
    }

    /// Let every runnable task make progress
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_negotiation_flow() {
        let mut h = harness(ReconnectPolicy::Resume);
        let address = endpoint("ws://192.168.1.20:8080");
        h.orchestrator.start(address.clone()).await.unwrap();
        settle().await;

        assert_eq!(h.connector.connect_count(), 1);
        assert_eq!(h.connector.attempts()[0].address, address);
        assert!(h.connector.sent().is_empty());
        assert!(h.media.is_capturing());

        let reporter = h.connector.last_reporter();
        reporter.opened();
        settle().await;
        assert_eq!(h.connector.sent(), vec![SignalingMessage::Offer { sdp: "v=0 offer-1".to_string() }]);

        reporter.message(candidate_json("candidate:early"));
        settle().await;
        assert!(h.backend.applied_candidates().is_empty());

        reporter.message(r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string());
        settle().await;
        assert_eq!(h.backend.remote_descriptions().len(), 1);
        assert_eq!(h.backend.applied_candidates().len(), 1);

        reporter.message(candidate_json("candidate:late"));
        h.backend.emit(PeerEvent::LocalCandidate(NetworkPathCandidate::new("candidate:local", "0", 0)));
        h.backend.emit(PeerEvent::StateChanged(PeerState::Connected));
        settle().await;

        assert_eq!(h.backend.applied_candidates().len(), 2);
        assert_eq!(
            h.connector.sent()[1],
            SignalingMessage::candidate(NetworkPathCandidate::new("candidate:local", "0", 0))
        );
        assert_eq!(h.orchestrator.peer_state(), PeerState::Connected);
        let status = h.orchestrator.status().unwrap();
        assert_eq!(status.phase, NegotiationPhase::Established);
        assert_eq!(status.channel, ChannelState::Open);
        assert_eq!(status.remote_candidates_applied, 2);

        h.orchestrator.stop().await;
        assert!(!h.orchestrator.is_running());
        assert_eq!(h.backend.closed(), 1);
        assert!(!h.media.is_capturing());
        assert_eq!(h.orchestrator.peer_state(), PeerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_unexpected_messages_are_ignored() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://10.0.0.2:8080")).await.unwrap();
        settle().await;
        let reporter = h.connector.last_reporter();

        reporter.opened();
        reporter.message("not json".to_string());
        reporter.message(r#"{"type":"offer","sdp":"v=0 remote"}"#.to_string());
        reporter.message(r#"{"type":"hello"}"#.to_string());
        settle().await;

        assert!(h.backend.remote_descriptions().is_empty());
        reporter.message(r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string());
        settle().await;
        assert_eq!(h.backend.remote_descriptions().len(), 1);
        h.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_single_retry_after_delay() {
        let mut h = harness(ReconnectPolicy::Resume);
        let address = endpoint("ws://192.168.1.20:8080");
        h.orchestrator.start(address.clone()).await.unwrap();
        settle().await;

        let reporter = h.connector.last_reporter();
        reporter.opened();
        settle().await;

        let failed_at = Instant::now();
        reporter.failed("connection reset");
        reporter.inject(ChannelEventKind::Failure("reset again".to_string()));

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert_eq!(h.connector.connect_count(), 1);
        assert!(h.orchestrator.status().unwrap().reconnect_pending);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].at - failed_at, Duration::from_millis(3000));
        assert_eq!(attempts[1].address, address);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.connect_count(), 2);
        assert_eq!(h.orchestrator.status().unwrap().reconnect_attempts, 1);
        h.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_continue_while_endpoint_is_down() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;

        for expected in 2..=4 {
            h.connector.last_reporter().failed("connection refused");
            tokio::time::sleep(Duration::from_millis(3001)).await;
            assert_eq!(h.connector.connect_count(), expected);
        }
        h.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_channel_events_are_ignored() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;

        let first = h.connector.last_reporter();
        first.failed("gone");
        tokio::time::sleep(Duration::from_millis(3001)).await;
        assert_eq!(h.connector.connect_count(), 2);

        first.inject(ChannelEventKind::Open);
        first.inject(ChannelEventKind::Failure("late".to_string()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.connect_count(), 2);
        assert_eq!(h.backend.offers_created(), 0);
        h.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_resends_unanswered_offer() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;

        h.connector.last_reporter().opened();
        settle().await;
        h.backend.emit(PeerEvent::LocalCandidate(NetworkPathCandidate::new("candidate:l1", "0", 0)));
        settle().await;
        h.connector.last_reporter().closed("server restart");
        tokio::time::sleep(Duration::from_millis(3001)).await;

        h.connector.last_reporter().opened();
        settle().await;

        let offer = SignalingMessage::Offer { sdp: "v=0 offer-1".to_string() };
        let local = SignalingMessage::candidate(NetworkPathCandidate::new("candidate:l1", "0", 0));
        assert_eq!(h.connector.sent(), vec![offer.clone(), local.clone(), offer, local]);
        assert_eq!(h.backend.offers_created(), 1);
        assert_eq!(h.backend.transports_created(), 1);

        h.connector.last_reporter().message(r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string());
        settle().await;
        h.connector.last_reporter().failed("blip");
        tokio::time::sleep(Duration::from_millis(3001)).await;
        h.connector.last_reporter().opened();
        settle().await;

        assert_eq!(h.connector.sent().len(), 4);
        assert_eq!(h.orchestrator.status().unwrap().phase, NegotiationPhase::Established);
        h.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidate_waits_for_resent_offer() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        h.connector.last_reporter().opened();
        settle().await;
        h.connector.last_reporter().failed("reset");
        tokio::time::sleep(Duration::from_millis(3001)).await;
        assert_eq!(h.connector.connect_count(), 2);

        // The I/O side is already open but the session has not seen the event
        let reporter = h.connector.last_reporter();
        reporter.mark_open();
        h.backend.emit(PeerEvent::LocalCandidate(NetworkPathCandidate::new("candidate:l2", "0", 0)));
        settle().await;
        assert_eq!(h.connector.sent().len(), 1);

        reporter.inject(ChannelEventKind::Open);
        settle().await;
        let offer = SignalingMessage::Offer { sdp: "v=0 offer-1".to_string() };
        let local = SignalingMessage::candidate(NetworkPathCandidate::new("candidate:l2", "0", 0));
        assert_eq!(h.connector.sent(), vec![offer.clone(), offer, local]);
        h.orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ascii_candidate_with_debug_logging() {
        log::set_max_level(log::LevelFilter::Debug);
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        let reporter = h.connector.last_reporter();
        reporter.opened();
        settle().await;

        let text = format!("{}\u{e9} tail", "a".repeat(79));
        reporter.message(candidate_json(&text));
        reporter.message(r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string());
        settle().await;

        assert_eq!(h.backend.remote_descriptions().len(), 1);
        assert_eq!(h.backend.applied_candidates()[0].candidate, text);
        h.orchestrator.stop().await;
        assert_eq!(h.backend.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_driver_panic_releases_peer() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        let reporter = h.connector.last_reporter();
        reporter.opened();
        settle().await;
        reporter.message(r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string());
        let fault = NetworkPathCandidate::new("candidate:fault", "crash", 0);
        reporter.message(SignalingMessage::candidate(fault).to_json().unwrap());
        settle().await;

        h.orchestrator.stop().await;
        assert!(!h.orchestrator.is_running());
        assert_eq!(h.backend.closed(), 1);
        assert!(!h.media.is_capturing());
        assert_eq!(reporter.state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_releases_peer() {
        let mut h = harness(ReconnectPolicy::Resume);
        let _gate = h.backend.hold_offers();
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        let reporter = h.connector.last_reporter();
        reporter.opened();
        settle().await;

        let before = Instant::now();
        h.orchestrator.stop().await;
        assert!(before.elapsed() >= STOP_TIMEOUT);
        assert!(h.connector.sent().is_empty());
        assert_eq!(h.backend.closed(), 1);
        assert!(!h.media.is_capturing());
        assert_eq!(reporter.state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renegotiate_policy_rebuilds_peer() {
        let mut h = harness(ReconnectPolicy::Renegotiate);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;

        h.connector.last_reporter().opened();
        settle().await;
        h.connector.last_reporter().failed("reset");
        tokio::time::sleep(Duration::from_millis(3001)).await;

        assert_eq!(h.backend.transports_created(), 2);
        assert_eq!(h.backend.closed(), 1);
        assert_eq!(h.media.starts(), 2);
        assert!(h.media.is_capturing());

        h.connector.last_reporter().opened();
        settle().await;
        assert_eq!(
            h.connector.sent(),
            vec![
                SignalingMessage::Offer { sdp: "v=0 offer-1".to_string() },
                SignalingMessage::Offer { sdp: "v=0 offer-2".to_string() },
            ]
        );

        h.orchestrator.stop().await;
        assert_eq!(h.backend.closed(), 2);
        assert!(!h.media.is_capturing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_open_sends_nothing() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        h.orchestrator.stop().await;

        let reporter = h.connector.last_reporter();
        reporter.inject(ChannelEventKind::Open);
        settle().await;

        assert!(h.connector.sent().is_empty());
        assert_eq!(h.backend.offers_created(), 0);
        assert_eq!(h.backend.closed(), 1);
        assert!(!h.media.is_capturing());
        assert_eq!(reporter.state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_offer_discards_it() {
        let mut h = harness(ReconnectPolicy::Resume);
        let gate = h.backend.hold_offers();
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        h.connector.last_reporter().opened();
        settle().await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            gate.notify_one();
        });
        h.orchestrator.stop().await;
        settle().await;

        assert!(h.connector.sent().is_empty());
        assert_eq!(h.backend.closed(), 1);
        assert!(!h.media.is_capturing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;
        h.connector.last_reporter().failed("down");
        settle().await;

        h.orchestrator.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_failure_is_returned_to_caller() {
        let mut h = harness_with_media(ReconnectPolicy::Resume, MockMediaSource::failing());
        let err = h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap_err();
        assert!(matches!(err, SessionError::ResourceInit(_)));
        assert!(err.is_fatal());
        assert!(!h.orchestrator.is_running());
        assert_eq!(h.connector.connect_count(), 0);

        h.orchestrator.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let mut h = harness(ReconnectPolicy::Resume);
        let address = endpoint("ws://192.168.1.20:8080");
        h.orchestrator.start(address.clone()).await.unwrap();
        h.orchestrator.start(address.clone()).await.unwrap();
        settle().await;
        assert_eq!(h.backend.transports_created(), 1);
        assert_eq!(h.connector.connect_count(), 1);

        let err = h.orchestrator.start(endpoint("ws://192.168.1.21:8080")).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        assert_eq!(h.orchestrator.address(), Some(&address));

        h.orchestrator.stop().await;
        h.orchestrator.stop().await;
        assert_eq!(h.backend.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_moves_to_new_address() {
        let mut h = harness(ReconnectPolicy::Resume);
        h.orchestrator.start(endpoint("ws://192.168.1.20:8080")).await.unwrap();
        settle().await;

        let before = Instant::now();
        let next = endpoint("ws://192.168.1.42:9000");
        h.orchestrator.restart(next.clone()).await.unwrap();
        assert!(before.elapsed() >= RESTART_SETTLE_DELAY);
        settle().await;

        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].address, next);
        assert_eq!(h.backend.closed(), 1);
        assert_eq!(h.backend.transports_created(), 2);
        assert!(h.media.is_capturing());
        h.orchestrator.stop().await;
    }
}
