//! camlink - camera streaming core
//!
//! Publishes a local video feed to a remote viewer over WebRTC. The device
//! is always the offerer; offers, answers and candidates travel over a
//! WebSocket signaling channel that is re-established after failures.

pub mod capture;
pub mod config;
pub mod session;
pub mod transport;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{Config, EndpointAddress, EndpointStore, VideoCodec};
pub use session::Orchestrator;
pub use webrtc::{SessionError, SignalingMessage};
