//! Streaming session lifecycle
//!
//! - `orchestrator`: start/stop/restart of a session for one endpoint
//! - `supervisor`: reconnect timer and its single-pending guard

pub mod orchestrator;
pub mod supervisor;

pub use orchestrator::{Orchestrator, SessionSettings, SessionStatus, RESTART_SETTLE_DELAY};
pub use supervisor::{ReconnectSupervisor, ReconnectTick, SupervisorState};
