//! Configuration management for camlink

use crate::webrtc::SessionError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod endpoint;

pub use endpoint::{EndpointAddress, EndpointStore};

/// Default STUN server used for candidate discovery
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Video codec selection for WebRTC streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    VP8,
    VP9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }

    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 96,
            VideoCodec::VP8 => 97,
            VideoCodec::VP9 => 98,
        }
    }

    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
        }
    }
}

/// What happens to the peer connection when the signaling channel is restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Reconnect the channel only; the existing peer connection and offer are kept
    #[default]
    Resume,
    /// Tear down the peer connection and negotiate from scratch
    Renegotiate,
}

/// Where the media source gets its RTP packets from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureSourceKind {
    /// External encoder pushes RTP over UDP to `rtp_listen`
    #[default]
    Rtp,
    /// Local camera through GStreamer
    Camera,
    /// GStreamer test pattern
    TestPattern,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Persisted endpoint address
    #[serde(default)]
    pub endpoint_store: EndpointStoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Fallback signaling URL when nothing has been stored yet
    #[serde(default)]
    pub url: Option<String>,

    /// Fixed delay before reconnecting a closed channel
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// WebSocket connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect behavior for the peer connection
    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,
}

impl SignalingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_policy: ReconnectPolicy::Resume,
        }
    }
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// ICE servers offered to the peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Video codec selection
    #[serde(default)]
    pub video_codec: VideoCodec,

    /// Local track id
    #[serde(default = "default_track_id")]
    pub track_id: String,

    /// Local stream id
    #[serde(default = "default_stream_id")]
    pub stream_id: String,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            video_codec: VideoCodec::H264,
            track_id: default_track_id(),
            stream_id: default_stream_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Media source kind
    #[serde(default)]
    pub source: CaptureSourceKind,

    /// UDP address the RTP ingest source listens on
    #[serde(default = "default_rtp_listen")]
    pub rtp_listen: String,

    /// Camera device (e.g. /dev/video0)
    #[serde(default = "default_device")]
    pub device: String,

    /// Frame width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height
    #[serde(default = "default_height")]
    pub height: u32,

    /// Target framerate
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Target bitrate in kbps
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSourceKind::Rtp,
            rtp_listen: default_rtp_listen(),
            device: default_device(),
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            bitrate_kbps: default_bitrate_kbps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStoreConfig {
    /// File holding the last scanned signaling URL
    #[serde(default = "default_endpoint_store_path")]
    pub path: PathBuf,
}

impl Default for EndpointStoreConfig {
    fn default() -> Self {
        Self { path: default_endpoint_store_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| SessionError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.signaling.reconnect_delay_ms == 0 {
            return Err(SessionError::Config("reconnect_delay_ms must be non-zero".into()));
        }

        if self.signaling.connect_timeout_ms == 0 {
            return Err(SessionError::Config("connect_timeout_ms must be non-zero".into()));
        }

        if let Some(ref url) = self.signaling.url {
            EndpointAddress::parse(url)?;
        }

        if self.webrtc.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(SessionError::Config("ICE server entry without urls".into()));
        }

        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(SessionError::Config("Capture dimensions must be non-zero".into()));
        }

        if self.capture.framerate == 0 {
            return Err(SessionError::Config("Capture framerate must be non-zero".into()));
        }

        if self.capture.source == CaptureSourceKind::Rtp
            && self.capture.rtp_listen.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(SessionError::Config(format!(
                "Invalid rtp_listen address: {}",
                self.capture.rtp_listen
            )));
        }

        Ok(())
    }
}

fn default_reconnect_delay_ms() -> u64 { 3000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_track_id() -> String { "video".to_string() }
fn default_stream_id() -> String { "camlink-stream".to_string() }
fn default_rtp_listen() -> String { "127.0.0.1:5004".to_string() }
fn default_device() -> String { "/dev/video0".to_string() }
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_framerate() -> u32 { 10 }
fn default_bitrate_kbps() -> u32 { 2000 }
fn default_log_level() -> String { "info".to_string() }

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![DEFAULT_STUN_SERVER.to_string()],
        username: None,
        credential: None,
    }]
}

fn default_endpoint_store_path() -> PathBuf {
    std::env::var_os("CAMLINK_ENDPOINT_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("camlink-endpoint.json"))
}
