//! RTP over UDP ingest
//!
//! An external encoder (ffmpeg, gst-launch, a phone camera app) pushes
//! RTP packets to a local UDP port; every valid packet is fanned out to
//! the attached track.

use super::{MediaSource, RTP_CHANNEL_CAPACITY};
use crate::config::VideoCodec;
use crate::webrtc::media_track::rtp_util;
use crate::webrtc::SessionError;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// First pause after a failed receive; doubles per consecutive failure
const RECV_RETRY_BASE: Duration = Duration::from_millis(10);
const RECV_RETRY_MAX: Duration = Duration::from_secs(1);

struct Running {
    sender: broadcast::Sender<Bytes>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// UDP RTP ingest media source
pub struct RtpIngestSource {
    name: String,
    listen: SocketAddr,
    codec: VideoCodec,
    running: Mutex<Option<Running>>,
}

impl RtpIngestSource {
    pub fn new(listen: SocketAddr, codec: VideoCodec) -> Self {
        Self {
            name: format!("rtp-ingest({})", listen),
            listen,
            codec,
            running: Mutex::new(None),
        }
    }

    /// Bound address while capturing (useful when listening on port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    fn bind(&self) -> Result<UdpSocket, SessionError> {
        let socket = std::net::UdpSocket::bind(self.listen).map_err(|e| {
            SessionError::ResourceInit(format!("Failed to bind RTP ingest socket {}: {}", self.listen, e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| SessionError::ResourceInit(format!("Failed to configure RTP socket: {}", e)))?;
        UdpSocket::from_std(socket)
            .map_err(|e| SessionError::ResourceInit(format!("Failed to register RTP socket: {}", e)))
    }
}

impl MediaSource for RtpIngestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn codec(&self) -> VideoCodec {
        self.codec
    }

    fn start_capture(&self) -> Result<broadcast::Receiver<Bytes>, SessionError> {
        let mut running = self.running.lock();
        if let Some(ref r) = *running {
            return Ok(r.sender.subscribe());
        }

        let socket = self.bind()?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SessionError::ResourceInit(format!("RTP socket has no local address: {}", e)))?;
        let (sender, receiver) = broadcast::channel(RTP_CHANNEL_CAPACITY);
        let task = tokio::spawn(ingest_loop(socket, sender.clone()));

        info!("RTP ingest listening on {}", local_addr);
        *running = Some(Running { sender, task, local_addr });
        Ok(receiver)
    }

    fn stop_capture(&self) {
        if let Some(r) = self.running.lock().take() {
            r.task.abort();
            info!("RTP ingest on {} stopped", r.local_addr);
        }
    }

    fn is_capturing(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for RtpIngestSource {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

async fn ingest_loop(socket: UdpSocket, sender: broadcast::Sender<Bytes>) {
    let mut buf = vec![0u8; 65535];
    let mut packet_count: u64 = 0;
    let mut dropped: u64 = 0;
    let mut recv_errors: u32 = 0;

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => {
                recv_errors = 0;
                r
            }
            Err(e) => {
                recv_errors = recv_errors.saturating_add(1);
                if recv_errors <= 5 || recv_errors % 100 == 0 {
                    warn!("RTP ingest receive error ({} in a row): {}", recv_errors, e);
                }
                tokio::time::sleep(recv_retry_delay(recv_errors)).await;
                continue;
            }
        };

        let packet = &buf[..len];
        if !rtp_util::is_valid(packet) {
            dropped += 1;
            if dropped <= 5 || dropped % 1000 == 0 {
                debug!("Dropping non-RTP datagram from {} ({} bytes, {} dropped)", peer, len, dropped);
            }
            continue;
        }

        packet_count += 1;
        if packet_count == 1 {
            info!("First RTP packet from {} ({} bytes)", peer, len);
        }

        // No subscribers just means no track is attached right now
        let _ = sender.send(Bytes::copy_from_slice(packet));
    }
}

/// Backoff before retrying after `failures` consecutive receive errors
fn recv_retry_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    RECV_RETRY_BASE.saturating_mul(1 << shift).min(RECV_RETRY_MAX)
}
