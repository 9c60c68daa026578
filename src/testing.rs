//! Test doubles for the peer transport, media capture and signaling channel

use crate::capture::MediaSource;
use crate::config::{EndpointAddress, VideoCodec};
use crate::transport::{ChannelConnector, ChannelReporter};
use crate::webrtc::{
    NetworkPathCandidate, PeerBackend, PeerEvent, PeerTransport, SessionDescription, SessionError,
    SignalingMessage,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
struct PeerLog {
    transports_created: usize,
    offers_created: usize,
    remote_descriptions: Vec<SessionDescription>,
    applied_candidates: Vec<NetworkPathCandidate>,
    closed: usize,
}

#[derive(Default)]
struct BackendShared {
    log: Mutex<PeerLog>,
    fail_create: AtomicBool,
    offer_gate: Mutex<Option<Arc<Notify>>>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

/// Peer backend recording every call made on its transports.
///
/// Answers whose SDP contains `reject` and candidates with mid `bogus`
/// are refused with a negotiation error. A candidate with mid `crash`
/// panics the caller.
#[derive(Clone, Default)]
pub struct MockBackend {
    shared: Arc<BackendShared>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.shared.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `create_offer` wait until the returned gate is notified
    pub fn hold_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.shared.offer_gate.lock() = Some(gate.clone());
        gate
    }

    /// Deliver an event as the most recent transport would
    pub fn emit(&self, event: PeerEvent) {
        if let Some(ref tx) = *self.shared.events.lock() {
            let _ = tx.send(event);
        }
    }

    pub fn transports_created(&self) -> usize {
        self.shared.log.lock().transports_created
    }

    pub fn offers_created(&self) -> usize {
        self.shared.log.lock().offers_created
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.shared.log.lock().remote_descriptions.clone()
    }

    pub fn applied_candidates(&self) -> Vec<NetworkPathCandidate> {
        self.shared.log.lock().applied_candidates.clone()
    }

    pub fn closed(&self) -> usize {
        self.shared.log.lock().closed
    }
}

#[async_trait]
impl PeerBackend for MockBackend {
    async fn create_transport(
        &self,
        _codec: VideoCodec,
        _feed: broadcast::Receiver<Bytes>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerTransport>, SessionError> {
        if self.shared.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::ResourceInit("mock transport unavailable".to_string()));
        }
        *self.shared.events.lock() = Some(events);
        self.shared.log.lock().transports_created += 1;
        Ok(Box::new(MockTransport { shared: self.shared.clone() }))
    }
}

struct MockTransport {
    shared: Arc<BackendShared>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let gate = self.shared.offer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut log = self.shared.log.lock();
        log.offers_created += 1;
        Ok(SessionDescription::offer(format!("v=0 offer-{}", log.offers_created)))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        if desc.sdp.contains("reject") {
            return Err(SessionError::Negotiation("remote description refused".to_string()));
        }
        self.shared.log.lock().remote_descriptions.push(desc.clone());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &NetworkPathCandidate) -> Result<(), SessionError> {
        if candidate.sdp_mid == "crash" {
            panic!("transport fault on candidate {}", candidate.candidate);
        }
        if candidate.sdp_mid == "bogus" {
            return Err(SessionError::Negotiation("unknown media section".to_string()));
        }
        self.shared.log.lock().applied_candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.shared.log.lock().closed += 1;
        Ok(())
    }
}

/// Media source that never produces packets
pub struct MockMediaSource {
    capturing: AtomicBool,
    fail: bool,
    starts: AtomicUsize,
    feed: broadcast::Sender<Bytes>,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(true)
    }

    fn build(fail: bool) -> Arc<Self> {
        let (feed, _) = broadcast::channel(16);
        Arc::new(Self {
            capturing: AtomicBool::new(false),
            fail,
            starts: AtomicUsize::new(0),
            feed,
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl MediaSource for MockMediaSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::H264
    }

    fn start_capture(&self) -> Result<broadcast::Receiver<Bytes>, SessionError> {
        if self.fail {
            return Err(SessionError::ResourceInit("camera busy".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.capturing.store(true, Ordering::SeqCst);
        Ok(self.feed.subscribe())
    }

    fn stop_capture(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }
}

/// One recorded connection attempt
#[derive(Clone)]
pub struct ConnectAttempt {
    pub address: EndpointAddress,
    pub at: Instant,
    pub reporter: ChannelReporter,
}

#[derive(Default)]
struct ConnectorShared {
    attempts: Mutex<Vec<ConnectAttempt>>,
    sent: Mutex<Vec<String>>,
}

/// Channel connector that never touches the network.
///
/// Tests drive the channel lifecycle through the recorded reporters and
/// read back everything the session transmitted.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<ConnectorShared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.shared.attempts.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.attempts.lock().len()
    }

    pub fn last_reporter(&self) -> ChannelReporter {
        self.shared.attempts.lock().last().expect("no connection attempt").reporter.clone()
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.shared
            .sent
            .lock()
            .iter()
            .map(|text| SignalingMessage::from_json(text).expect("session sent invalid JSON"))
            .collect()
    }
}

impl ChannelConnector for MockConnector {
    fn spawn(
        &self,
        address: EndpointAddress,
        reporter: ChannelReporter,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        reporter.connecting();
        self.shared.attempts.lock().push(ConnectAttempt {
            address,
            at: Instant::now(),
            reporter: reporter.clone(),
        });

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                shared.sent.lock().push(text);
            }
            reporter.finish_quietly();
        })
    }
}
