//! Media capture sources
//!
//! The streaming core does not encode video itself. A `MediaSource`
//! hands it a feed of RTP packets which is attached to the peer
//! connection's local video track.

mod rtp_ingest;
#[cfg(feature = "gstreamer-capture")]
mod camera;

pub use rtp_ingest::RtpIngestSource;
#[cfg(feature = "gstreamer-capture")]
pub use camera::GstCameraSource;

use crate::config::{CaptureConfig, CaptureSourceKind, VideoCodec};
use crate::webrtc::SessionError;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the RTP fan-out channel between a source and its track
pub const RTP_CHANNEL_CAPACITY: usize = 1024;

/// A capture collaborator producing RTP packets for one video track
pub trait MediaSource: Send + Sync {
    /// Human readable source name for logs
    fn name(&self) -> &str;

    /// Codec of the packets this source produces
    fn codec(&self) -> VideoCodec;

    /// Start capturing and return a receiver for the packet feed.
    ///
    /// Calling this while already capturing returns a new subscription
    /// to the running feed.
    fn start_capture(&self) -> Result<broadcast::Receiver<Bytes>, SessionError>;

    /// Stop capturing; a no-op when not capturing
    fn stop_capture(&self);

    fn is_capturing(&self) -> bool;
}

/// Build the media source selected by the capture configuration
pub fn build_media_source(config: &CaptureConfig, codec: VideoCodec) -> Result<Arc<dyn MediaSource>, SessionError> {
    match config.source {
        CaptureSourceKind::Rtp => {
            let addr = config.rtp_listen.parse().map_err(|e| {
                SessionError::Config(format!("Invalid rtp_listen address {}: {}", config.rtp_listen, e))
            })?;
            Ok(Arc::new(RtpIngestSource::new(addr, codec)))
        }
        #[cfg(feature = "gstreamer-capture")]
        CaptureSourceKind::Camera | CaptureSourceKind::TestPattern => {
            Ok(Arc::new(GstCameraSource::new(config.clone(), codec)))
        }
        #[cfg(not(feature = "gstreamer-capture"))]
        CaptureSourceKind::Camera | CaptureSourceKind::TestPattern => Err(SessionError::ResourceInit(
            "camera capture requires the gstreamer-capture feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rtp_source() {
        let config = CaptureConfig::default();
        let source = build_media_source(&config, VideoCodec::VP8).unwrap();
        assert_eq!(source.codec(), VideoCodec::VP8);
        assert!(!source.is_capturing());
    }

    #[cfg(not(feature = "gstreamer-capture"))]
    #[test]
    fn test_camera_without_gstreamer_is_resource_error() {
        let config = CaptureConfig { source: CaptureSourceKind::Camera, ..Default::default() };
        let err = build_media_source(&config, VideoCodec::H264).err().unwrap();
        assert!(matches!(err, SessionError::ResourceInit(_)));
    }
}
