//! Transport layer
//!
//! Client side of the WebSocket signaling connection.

pub mod signaling_channel;

pub use signaling_channel::{
    ChannelConnector, ChannelEvent, ChannelEventKind, ChannelReporter, ChannelState, SignalingChannel,
    WebSocketConnector,
};
