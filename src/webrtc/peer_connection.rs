//! WebRTC PeerConnection management
//!
//! Handles the creation and lifecycle of RTCPeerConnection instances and
//! turns the webrtc-rs observer callbacks into a single `PeerEvent` stream.

use super::media_track::TrackForwarder;
use super::signaling::{NetworkPathCandidate, SdpType, SessionDescription};
use super::SessionError;
use crate::config::{IceServerConfig, VideoCodec, WebRTCConfig};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything the peer connection reports back to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the remote
    LocalCandidate(NetworkPathCandidate),
    /// Candidate gathering finished
    GatheringComplete,
    /// Overall connection state changed
    StateChanged(PeerState),
    /// ICE agent state changed
    IceStateChanged(String),
}

/// The live media transport of one session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;

    async fn add_remote_candidate(&self, candidate: &NetworkPathCandidate) -> Result<(), SessionError>;

    /// Release the transport; must tolerate being called more than once
    async fn close(&self) -> Result<(), SessionError>;
}

/// Factory for peer transports
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Build a transport with the media feed attached as a send-only video
    /// track. Events are delivered on `events` until the transport closes.
    async fn create_transport(
        &self,
        codec: VideoCodec,
        feed: broadcast::Receiver<Bytes>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerTransport>, SessionError>;
}

/// webrtc-rs backed peer transport factory
pub struct RtcPeerBackend {
    config: WebRTCConfig,
}

impl RtcPeerBackend {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        register_video_codecs(&mut media_engine)?;

        // Interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::ResourceInit(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_ice_servers(&self.config.ice_servers),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| SessionError::ResourceInit(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    fn create_video_track(&self, codec: VideoCodec) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            codec_capability(codec),
            self.config.track_id.clone(),
            self.config.stream_id.clone(),
        ))
    }
}

#[async_trait]
impl PeerBackend for RtcPeerBackend {
    async fn create_transport(
        &self,
        codec: VideoCodec,
        feed: broadcast::Receiver<Bytes>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerTransport>, SessionError> {
        let peer_connection = self.create_peer_connection().await?;
        wire_events(&peer_connection, events);

        let video_track = self.create_video_track(codec);
        let transceiver_init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: Vec::new(),
        };
        let track: Arc<dyn TrackLocal + Send + Sync> = video_track.clone();
        if let Err(e) = peer_connection.add_transceiver_from_track(track, Some(transceiver_init)).await {
            let _ = peer_connection.close().await;
            return Err(SessionError::ResourceInit(format!("Failed to add video transceiver: {}", e)));
        }

        let forwarder = TrackForwarder::spawn(video_track, feed);
        info!("Peer connection created with {} video track", codec.as_str());

        Ok(Box::new(RtcPeerTransport { peer_connection, forwarder }))
    }
}

/// A webrtc-rs peer connection with its attached video track
pub struct RtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    forwarder: TrackForwarder,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        let remote = match desc.sdp_type {
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        }
        .map_err(|e| SessionError::Negotiation(format!("Invalid SDP {}: {}", desc.sdp_type.as_str(), e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: &NetworkPathCandidate) -> Result<(), SessionError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.forwarder.stop();
        debug!("Track forwarder stopped after {} packets", self.forwarder.forwarded());
        self.peer_connection
            .close()
            .await
            .map_err(|e| SessionError::ResourceInit(format!("Failed to close connection: {}", e)))
    }
}

/// Route the observer callbacks into the event stream
fn wire_events(peer_connection: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let candidate_tx = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => PeerEvent::LocalCandidate(NetworkPathCandidate::new(
                        init.candidate,
                        init.sdp_mid.unwrap_or_default(),
                        init.sdp_mline_index.unwrap_or(0),
                    )),
                    Err(e) => {
                        debug!("Skipping unserializable local candidate: {}", e);
                        return;
                    }
                },
                None => PeerEvent::GatheringComplete,
            };
            let _ = tx.send(event);
        })
    }));

    let state_tx = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = state_tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::StateChanged(PeerState::from(state)));
        })
    }));

    peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::IceStateChanged(state.to_string()));
        })
    }));
}

fn codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp_line().to_string(),
        rtcp_feedback: vec![],
    }
}

/// Register video codecs in the media engine
fn register_video_codecs(media_engine: &mut MediaEngine) -> Result<(), SessionError> {
    for (mime_type, codec) in [
        (MIME_TYPE_H264, VideoCodec::H264),
        (MIME_TYPE_VP8, VideoCodec::VP8),
        (MIME_TYPE_VP9, VideoCodec::VP9),
    ] {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: mime_type.to_string(),
                        ..codec_capability(codec)
                    },
                    payload_type: codec.rtp_payload_type(),
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| SessionError::ResourceInit(format!("Failed to register {}: {}", mime_type, e)))?;
    }

    Ok(())
}

fn build_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
