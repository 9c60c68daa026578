//! Signaling channel
//!
//! One duplex text-message connection to the signaling endpoint. The I/O
//! side runs in its own task and reports lifecycle events through a
//! `ChannelReporter`; the owning session only sees `ChannelEvent`s tagged
//! with the generation of the connection attempt that produced them.

use crate::config::EndpointAddress;
use crate::webrtc::SignalingMessage;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// How long `close()` waits for the I/O task before aborting it
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection state of one signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    Open,
    Message(String),
    Closed(String),
    Failure(String),
}

/// A channel lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    /// Connection attempt that produced the event
    pub generation: u64,
    pub kind: ChannelEventKind,
}

/// Event sink handed to the I/O side of a channel.
///
/// Enforces the channel lifecycle: nothing is reported after the first
/// `closed`/`failed`, and only the I/O side writes the state.
#[derive(Clone)]
pub struct ChannelReporter {
    generation: u64,
    state: Arc<Mutex<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelReporter {
    fn new(generation: u64, state: Arc<Mutex<ChannelState>>, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { generation, state, events }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn connecting(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Idle {
            *state = ChannelState::Connecting;
        }
    }

    pub fn opened(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() || *state == ChannelState::Open {
                return false;
            }
            *state = ChannelState::Open;
        }
        self.emit(ChannelEventKind::Open)
    }

    pub fn message(&self, text: String) -> bool {
        if *self.state.lock() != ChannelState::Open {
            return false;
        }
        self.emit(ChannelEventKind::Message(text))
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        if !self.terminate(ChannelState::Closed) {
            return false;
        }
        self.emit(ChannelEventKind::Closed(reason.into()))
    }

    pub fn failed(&self, cause: impl Into<String>) -> bool {
        if !self.terminate(ChannelState::Failed) {
            return false;
        }
        self.emit(ChannelEventKind::Failure(cause.into()))
    }

    /// Local shutdown: the channel ends without an event
    pub fn finish_quietly(&self) {
        self.terminate(ChannelState::Closed);
    }

    fn terminate(&self, terminal: ChannelState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = terminal;
        true
    }

    fn emit(&self, kind: ChannelEventKind) -> bool {
        self.events.send(ChannelEvent { generation: self.generation, kind }).is_ok()
    }

    /// Flip the shared state to `Open` without reporting it yet
    #[cfg(test)]
    pub(crate) fn mark_open(&self) {
        *self.state.lock() = ChannelState::Open;
    }

    /// Push a raw event past the lifecycle checks
    #[cfg(test)]
    pub(crate) fn inject(&self, kind: ChannelEventKind) {
        let _ = self.emit(kind);
    }
}

/// Opens the I/O side of a signaling channel
pub trait ChannelConnector: Send + Sync {
    /// Spawn the connection task. The task reports through `reporter` and
    /// transmits every string received on `outbound`; when `outbound` is
    /// closed the task shuts the connection down quietly.
    fn spawn(
        &self,
        address: EndpointAddress,
        reporter: ChannelReporter,
        outbound: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()>;
}

/// Session-side handle of one signaling connection
pub struct SignalingChannel {
    address: EndpointAddress,
    generation: u64,
    state: Arc<Mutex<ChannelState>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Start a connection attempt to `address`
    pub fn connect(
        connector: &dyn ChannelConnector,
        address: EndpointAddress,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ChannelState::Idle));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let reporter = ChannelReporter::new(generation, state.clone(), events);

        info!("Signaling channel #{} connecting to {}", generation, address);
        let task = connector.spawn(address.clone(), reporter, outbound_rx);

        Self {
            address,
            generation,
            state,
            outbound: Some(outbound_tx),
            task: Some(task),
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Best-effort send; dropped with a warning unless the channel is open
    pub fn send(&self, text: String) -> bool {
        let state = self.state();
        if state != ChannelState::Open {
            warn!("Signaling channel #{} is {}, dropping outgoing message", self.generation, state);
            return false;
        }
        match self.outbound {
            Some(ref tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    pub fn send_message(&self, message: &SignalingMessage) -> bool {
        match message.to_json() {
            Ok(text) => {
                let sent = self.send(text);
                if sent {
                    debug!("Sent {} on signaling channel #{}", message.kind(), self.generation);
                }
                sent
            }
            Err(e) => {
                warn!("Failed to encode {} message: {}", message.kind(), e);
                false
            }
        }
    }

    /// Close the connection and wait for the I/O task. Idempotent.
    pub async fn close(&mut self) {
        self.outbound.take();
        let Some(mut task) = self.task.take() else {
            return;
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            warn!("Signaling channel #{} did not shut down in time, aborting", self.generation);
            task.abort();
        }

        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = ChannelState::Closed;
        }
        info!("Signaling channel #{} closed", self.generation);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// WebSocket implementation of the channel I/O side
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ChannelConnector for WebSocketConnector {
    fn spawn(
        &self,
        address: EndpointAddress,
        reporter: ChannelReporter,
        outbound: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_websocket(address, reporter, outbound, self.connect_timeout))
    }
}

async fn run_websocket(
    address: EndpointAddress,
    reporter: ChannelReporter,
    mut outbound: mpsc::UnboundedReceiver<String>,
    connect_timeout: Duration,
) {
    reporter.connecting();
    let generation = reporter.generation();

    let connected = tokio::select! {
        result = tokio::time::timeout(connect_timeout, connect_async(address.as_str())) => result,
        _ = wait_closed(&mut outbound) => {
            debug!("Signaling channel #{} closed while connecting", generation);
            reporter.finish_quietly();
            return;
        }
    };

    let ws_stream = match connected {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!("Signaling channel #{} failed to connect: {}", generation, e);
            reporter.failed(e.to_string());
            return;
        }
        Err(_) => {
            warn!("Signaling channel #{} connect timed out after {:?}", generation, connect_timeout);
            reporter.failed(format!("connect timed out after {:?}", connect_timeout));
            return;
        }
    };

    info!("Signaling channel #{} open", generation);
    reporter.opened();
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    reporter.message(text.to_string());
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame on signaling channel #{}", data.len(), generation);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    info!("Signaling channel #{} closed by remote: {}", generation, reason);
                    reporter.closed(reason);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Signaling channel #{} error: {}", generation, e);
                    reporter.failed(e.to_string());
                    break;
                }
                None => {
                    reporter.closed("connection ended");
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!("Signaling channel #{} send failed: {}", generation, e);
                        reporter.failed(e.to_string());
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    reporter.finish_quietly();
                    break;
                }
            },
        }
    }
}

/// Resolves once the session side dropped its sender
async fn wait_closed(outbound: &mut mpsc::UnboundedReceiver<String>) {
    while outbound.recv().await.is_some() {
        warn!("Dropping message queued before the signaling channel opened");
    }
}
