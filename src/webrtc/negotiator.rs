//! Offer/answer negotiation for one session
//!
//! The negotiator owns the peer transport and the media capture of a
//! session. It produces exactly one local offer, accepts one remote answer,
//! and holds back remote candidates until that answer has been applied.
//! Operations take `&mut self`, so at most one is outstanding at a time.

use super::peer_connection::{PeerBackend, PeerEvent, PeerTransport};
use super::signaling::{NetworkPathCandidate, SdpType, SessionDescription};
use super::SessionError;
use crate::capture::MediaSource;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Negotiation progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    CreatingOffer,
    AwaitingAnswer,
    Established,
    Disposed,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationPhase::Idle => "idle",
            NegotiationPhase::CreatingOffer => "creating-offer",
            NegotiationPhase::AwaitingAnswer => "awaiting-answer",
            NegotiationPhase::Established => "established",
            NegotiationPhase::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

pub struct Negotiator {
    transport: Box<dyn PeerTransport>,
    media: Arc<dyn MediaSource>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    phase: NegotiationPhase,
    local_offer: Option<SessionDescription>,
    pending_candidates: Vec<NetworkPathCandidate>,
    applied_candidates: usize,
    cancelled: Arc<AtomicBool>,
}

impl Negotiator {
    /// Acquire the media capture and a peer transport carrying it.
    ///
    /// `cancelled` is shared with whoever may tear the session down; once
    /// set, results of in-flight operations are discarded.
    pub async fn create_session(
        backend: &dyn PeerBackend,
        media: Arc<dyn MediaSource>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self, SessionError> {
        let feed = media.start_capture().map_err(into_resource_init)?;
        info!("Capture started on {}", media.name());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match backend.create_transport(media.codec(), feed, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                media.stop_capture();
                return Err(into_resource_init(e));
            }
        };

        Ok(Self {
            transport,
            media,
            events: Some(events_rx),
            phase: NegotiationPhase::Idle,
            local_offer: None,
            pending_candidates: Vec::new(),
            applied_candidates: 0,
            cancelled,
        })
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// The offer produced by `create_offer`, if any
    pub fn local_offer(&self) -> Option<&SessionDescription> {
        self.local_offer.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    /// Next event from the peer transport.
    ///
    /// Never resolves once the event stream has ended.
    pub async fn next_event(&mut self) -> PeerEvent {
        if let Some(ref mut events) = self.events {
            if let Some(event) = events.recv().await {
                return event;
            }
            self.events = None;
        }
        std::future::pending().await
    }

    /// Create the local offer. Allowed once, from `Idle`.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        match self.phase {
            NegotiationPhase::Idle => {}
            NegotiationPhase::Disposed => {
                return Err(SessionError::Protocol("offer requested after dispose".to_string()))
            }
            phase => {
                return Err(SessionError::Protocol(format!("offer already requested (phase {})", phase)))
            }
        }
        self.ensure_live()?;

        self.phase = NegotiationPhase::CreatingOffer;
        let result = self.transport.create_offer().await;
        self.ensure_live()?;

        match result {
            Ok(offer) => {
                info!("Local offer created ({} bytes of SDP)", offer.sdp.len());
                self.local_offer = Some(offer.clone());
                self.phase = NegotiationPhase::AwaitingAnswer;
                Ok(offer)
            }
            Err(e) => {
                self.phase = NegotiationPhase::Idle;
                Err(e)
            }
        }
    }

    /// Apply the remote answer, then flush candidates queued before it
    pub async fn apply_remote_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(SessionError::Protocol(format!(
                "expected an answer, got {}",
                answer.sdp_type.as_str()
            )));
        }
        match self.phase {
            NegotiationPhase::AwaitingAnswer => {}
            NegotiationPhase::Disposed => {
                return Err(SessionError::Protocol("answer received after dispose".to_string()))
            }
            phase => return Err(SessionError::Protocol(format!("unexpected answer in phase {}", phase))),
        }

        let result = self.transport.set_remote_description(&answer).await;
        self.ensure_live()?;
        result?;

        self.phase = NegotiationPhase::Established;
        info!("Remote answer applied");

        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!("Applying {} queued remote candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = self.add_candidate(&candidate).await {
                warn!("Queued candidate rejected: {}", e);
            }
            self.ensure_live()?;
        }
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the answer is applied
    pub async fn apply_remote_candidate(&mut self, candidate: NetworkPathCandidate) -> Result<(), SessionError> {
        match self.phase {
            NegotiationPhase::Disposed => {
                Err(SessionError::Protocol("candidate received after dispose".to_string()))
            }
            NegotiationPhase::Established => self.add_candidate(&candidate).await,
            _ => {
                debug!("Queueing remote candidate until answer: {}", candidate.summary());
                self.pending_candidates.push(candidate);
                Ok(())
            }
        }
    }

    async fn add_candidate(&mut self, candidate: &NetworkPathCandidate) -> Result<(), SessionError> {
        self.transport.add_remote_candidate(candidate).await?;
        self.applied_candidates += 1;
        debug!("Remote candidate applied: {}", candidate.summary());
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.cancelled.load(Ordering::SeqCst) || self.phase == NegotiationPhase::Disposed {
            return Err(SessionError::Protocol("session was stopped".to_string()));
        }
        Ok(())
    }

    /// Release the transport, then the capture. Idempotent.
    pub async fn dispose(&mut self) {
        if self.phase == NegotiationPhase::Disposed {
            return;
        }
        self.phase = NegotiationPhase::Disposed;
        self.pending_candidates.clear();

        if let Err(e) = self.transport.close().await {
            warn!("Error closing peer transport: {}", e);
        }
        self.media.stop_capture();
        info!("Negotiator disposed");
    }
}

fn into_resource_init(e: SessionError) -> SessionError {
    match e {
        SessionError::ResourceInit(_) | SessionError::Config(_) => e,
        other => SessionError::ResourceInit(other.to_string()),
    }
}
