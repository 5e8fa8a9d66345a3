//! Realtime client for the issue-agent chat room.
//!
//! The crate is organized by concern:
//! - `realtime`: reconnecting websocket client, wire envelope, and consumer
//!   callback dispatch.
//! - `retry`: reconnect policy and timeout utilities.

/// Realtime websocket client, protocol types, and callback dispatch.
pub mod realtime;
/// Reconnect policy and timeout helpers.
pub mod retry;

pub use realtime::client::{
    ConnectionState, PendingConnect, RealtimeClient, RealtimeClientOptions, RealtimeError,
};
pub use realtime::handlers::DisconnectEvent;
pub use realtime::proto::{Envelope, MessageKind};
pub use realtime::queue::OverflowPolicy;
pub use retry::ReconnectPolicy;
