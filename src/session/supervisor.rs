//! Reconnect scheduling
//!
//! Holds the reconnect guard: at most one retry timer is pending per
//! session. The session driver is the only caller, so failure reports and
//! timer firings are serialized through it.

use log::{debug, info};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    #[default]
    Idle,
    ReconnectScheduled,
}

/// Delivered to the driver when a scheduled retry is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectTick {
    pub attempt: u64,
}

pub struct ReconnectSupervisor {
    delay: Duration,
    state: SupervisorState,
    attempt: u64,
    timer: Option<JoinHandle<()>>,
    ticks: mpsc::UnboundedSender<ReconnectTick>,
}

impl ReconnectSupervisor {
    pub fn new(delay: Duration, ticks: mpsc::UnboundedSender<ReconnectTick>) -> Self {
        Self {
            delay,
            state: SupervisorState::Idle,
            attempt: 0,
            timer: None,
            ticks,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == SupervisorState::ReconnectScheduled
    }

    /// Number of retries scheduled so far
    pub fn attempts(&self) -> u64 {
        self.attempt
    }

    /// Arm the retry timer. Returns false if one is already pending.
    pub fn schedule(&mut self) -> bool {
        if self.state == SupervisorState::ReconnectScheduled {
            debug!("Reconnect already scheduled, ignoring");
            return false;
        }

        self.state = SupervisorState::ReconnectScheduled;
        self.attempt += 1;
        let tick = ReconnectTick { attempt: self.attempt };
        let delay = self.delay;
        let ticks = self.ticks.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ticks.send(tick);
        }));

        info!("Reconnecting in {:?} (attempt {})", self.delay, self.attempt);
        true
    }

    /// Accept a timer firing. Stale ticks from a cancelled timer return false.
    pub fn on_fire(&mut self, tick: ReconnectTick) -> bool {
        if self.state != SupervisorState::ReconnectScheduled || tick.attempt != self.attempt {
            debug!("Ignoring stale reconnect tick {}", tick.attempt);
            return false;
        }
        self.state = SupervisorState::Idle;
        self.timer = None;
        true
    }

    /// Drop any pending retry
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            debug!("Pending reconnect cancelled");
        }
        self.state = SupervisorState::Idle;
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
