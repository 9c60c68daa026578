//! WebRTC session negotiation
//!
//! This module provides the peer-connection side of a streaming session:
//! - Signaling wire messages (offer/answer/candidate)
//! - Peer connection construction on top of webrtc-rs
//! - RTP forwarding from a media source into the local video track
//! - The offer/answer/candidate state machine (`Negotiator`)

pub mod peer_connection;
pub mod signaling;
pub mod media_track;
pub mod negotiator;

pub use signaling::{NetworkPathCandidate, SdpType, SessionDescription, SignalingMessage};
pub use negotiator::{NegotiationPhase, Negotiator};
pub use peer_connection::{PeerBackend, PeerEvent, PeerState, PeerTransport, RtcPeerBackend};

use std::error::Error;
use std::fmt;

/// Session-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Capture or transport subsystem could not be initialized
    ResourceInit(String),
    /// Message arrived out of the expected sequence
    Protocol(String),
    /// Local or remote description rejected by the transport
    Negotiation(String),
    /// Signaling channel closed or failed
    Channel(String),
    /// Invalid configuration or endpoint address
    Config(String),
}

impl SessionError {
    /// Whether this error ends a `start()` attempt.
    ///
    /// Protocol, negotiation and channel errors are logged and the session
    /// carries on; only initialization and configuration problems are
    /// surfaced to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ResourceInit(_) | SessionError::Config(_))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ResourceInit(msg) => write!(f, "Resource initialization failed: {}", msg),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            SessionError::Channel(msg) => write!(f, "Channel error: {}", msg),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for SessionError {}
