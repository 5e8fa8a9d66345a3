//! Realtime chat modules.
//!
//! - `client`: consumer handle, options, and errors.
//! - `worker`: background task owning the socket, send queue, and reconnect
//!   timer.
//! - `proto`: wire envelope shared with the chat service.
//! - `handlers`: single-slot consumer callbacks and inbound dispatch.
//! - `queue`: outbound envelopes held while disconnected.

/// Client handle and connection options.
pub mod client;
/// Single-slot event callbacks.
pub mod handlers;
/// Wire envelope and message kinds.
pub mod proto;
/// Pending outbound queue.
pub mod queue;
mod worker;
