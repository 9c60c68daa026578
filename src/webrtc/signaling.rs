//! WebRTC Signaling Protocol
//!
//! Handles SDP offer/answer exchange and ICE candidate transmission
//! over the signaling channel. One JSON object per text frame:
//!
//! - `{"type":"offer","sdp":"..."}`
//! - `{"type":"answer","sdp":"..."}`
//! - `{"type":"candidate","candidate":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0}}`

use super::SessionError;
use serde::{Deserialize, Serialize};

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// A local or remote session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    /// Build an answer description.
    ///
    /// Some signaling servers double-escape line breaks, so literal `\r\n`
    /// sequences are turned back into CRLF.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: normalize_line_breaks(sdp.into()) }
    }
}

const SUMMARY_CHARS: usize = 80;

/// One ICE candidate as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPathCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl NetworkPathCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }

    /// Short form for log lines, at most `SUMMARY_CHARS` characters
    pub fn summary(&self) -> &str {
        match self.candidate.char_indices().nth(SUMMARY_CHARS) {
            Some((end, _)) => &self.candidate[..end],
            None => &self.candidate,
        }
    }
}

/// Signaling message types for WebRTC negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer from this device
    Offer { sdp: String },

    /// SDP answer from the remote viewer
    Answer { sdp: String },

    /// ICE candidate, either direction
    Candidate { candidate: NetworkPathCandidate },
}

impl SignalingMessage {
    /// Parse a signaling message from a text frame
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json.trim())
            .map_err(|e| SessionError::Protocol(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::Protocol(format!("Failed to serialize message: {}", e)))
    }

    /// Create an offer message from a local description
    pub fn offer(desc: &SessionDescription) -> Self {
        SignalingMessage::Offer { sdp: desc.sdp.clone() }
    }

    /// Create a candidate message
    pub fn candidate(candidate: NetworkPathCandidate) -> Self {
        SignalingMessage::Candidate { candidate }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }
}

fn normalize_line_breaks(sdp: String) -> String {
    if sdp.contains("\\r\\n") {
        sdp.replace("\\r\\n", "\r\n")
    } else {
        sdp
    }
}
