//! RTP forwarding into the local video track
//!
//! Packets from the media source's broadcast feed are written to the
//! webrtc-rs `TrackLocalStaticRTP`, which rewrites SSRC and payload type
//! for the negotiated binding.

use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// RTP packet parser utilities
pub mod rtp_util {
    /// RTP version carried in the top two bits of the first byte
    pub const RTP_VERSION: u8 = 2;

    /// Minimal sanity check: fixed header present and version 2
    pub fn is_valid(packet: &[u8]) -> bool {
        packet.len() >= 12 && (packet[0] >> 6) == RTP_VERSION
    }

    /// Extract sequence number from RTP packet
    pub fn get_sequence(packet: &[u8]) -> Option<u16> {
        if packet.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([packet[2], packet[3]]))
    }

    /// Extract timestamp from RTP packet
    pub fn get_timestamp(packet: &[u8]) -> Option<u32> {
        if packet.len() < 8 {
            return None;
        }
        Some(u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
    }

    /// Extract payload type from RTP packet
    pub fn get_payload_type(packet: &[u8]) -> Option<u8> {
        if packet.len() < 2 {
            return None;
        }
        Some(packet[1] & 0x7F)
    }

    /// Check if marker bit is set
    pub fn is_marker_set(packet: &[u8]) -> bool {
        if packet.len() < 2 {
            return false;
        }
        (packet[1] & 0x80) != 0
    }
}

/// Background task copying RTP packets from a media feed into a track
pub struct TrackForwarder {
    task: JoinHandle<()>,
    forwarded: Arc<AtomicU64>,
}

impl TrackForwarder {
    pub fn spawn(track: Arc<TrackLocalStaticRTP>, mut feed: broadcast::Receiver<Bytes>) -> Self {
        let forwarded = Arc::new(AtomicU64::new(0));
        let counter = forwarded.clone();
        let track_id = track.id().to_string();

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(packet) => {
                        if !rtp_util::is_valid(&packet) {
                            continue;
                        }
                        match track.write(&packet).await {
                            Ok(_) => {
                                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                                if n == 1 || n % 2000 == 0 {
                                    info!("Track {} forwarded RTP #{}: {} bytes", track_id, n, packet.len());
                                }
                            }
                            Err(e) => debug!("Track {} write failed: {}", track_id, e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Track {} RTP receiver lagged by {}", track_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Track {} media feed closed", track_id);
                        break;
                    }
                }
            }
        });

        Self { task, forwarded }
    }

    /// Number of packets written to the track so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TrackForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
