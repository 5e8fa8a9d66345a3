//! Consumer callback slots and inbound frame dispatch.
//!
//! Every event has exactly one slot. Registering a callback for an event that
//! already has one replaces it; listeners do not accumulate.

use std::fmt;

use serde_json::Value;
use tracing::{debug, warn};

use crate::realtime::proto::{Envelope, InboundEvent};

/// Callback receiving an inbound payload.
pub type PayloadCallback = Box<dyn FnMut(Value) + Send + 'static>;
/// Callback invoked once per successful open.
pub type ConnectCallback = Box<dyn FnMut() + Send + 'static>;
/// Callback invoked when an established connection closes.
pub type DisconnectCallback = Box<dyn FnMut(&DisconnectEvent) + Send + 'static>;
/// Callback invoked with the attempt count when automatic reconnects stop.
pub type ExhaustedCallback = Box<dyn FnMut(u32) + Send + 'static>;

/// Details of a connection closing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// Close code from the close frame, `None` when the transport dropped
    /// without one.
    pub code: Option<u16>,
    /// Close reason or transport error description.
    pub reason: String,
    /// Whether a reconnect attempt has been scheduled.
    pub reconnecting: bool,
    /// Attempt number of the scheduled reconnect.
    pub retry_attempt: Option<u32>,
}

/// Registration for a single event slot.
pub(crate) enum Handler {
    Message(PayloadCallback),
    Connect(ConnectCallback),
    Disconnect(DisconnectCallback),
    FileReceived(PayloadCallback),
    TraceUpdate(PayloadCallback),
    RetriesExhausted(ExhaustedCallback),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = match self {
            Self::Message(_) => "message",
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::FileReceived(_) => "file_received",
            Self::TraceUpdate(_) => "trace_update",
            Self::RetriesExhausted(_) => "retries_exhausted",
        };
        f.debug_tuple("Handler").field(&slot).finish()
    }
}

/// What happened to an inbound text frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered,
    /// Known kind, but nobody registered for it.
    NoHandler,
    /// Kind with no consumer slot.
    Ignored,
    /// Frame was not a valid envelope.
    Malformed,
}

#[derive(Default)]
pub(crate) struct EventHandlers {
    message: Option<PayloadCallback>,
    connect: Option<ConnectCallback>,
    disconnect: Option<DisconnectCallback>,
    file_received: Option<PayloadCallback>,
    trace_update: Option<PayloadCallback>,
    retries_exhausted: Option<ExhaustedCallback>,
}

impl EventHandlers {
    pub(crate) fn install(&mut self, handler: Handler) {
        debug!(event = "handler_installed", handler = ?handler);
        match handler {
            Handler::Message(callback) => self.message = Some(callback),
            Handler::Connect(callback) => self.connect = Some(callback),
            Handler::Disconnect(callback) => self.disconnect = Some(callback),
            Handler::FileReceived(callback) => self.file_received = Some(callback),
            Handler::TraceUpdate(callback) => self.trace_update = Some(callback),
            Handler::RetriesExhausted(callback) => self.retries_exhausted = Some(callback),
        }
    }

    /// Parses a text frame and routes it to the slot for its kind.
    pub(crate) fn dispatch(&mut self, text: &str) -> DispatchOutcome {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    event = "inbound_frame_malformed",
                    error = %err,
                    len = text.len()
                );
                return DispatchOutcome::Malformed;
            }
        };

        let (slot, payload) = match InboundEvent::from(envelope) {
            InboundEvent::ChatMessage(payload) => (&mut self.message, payload),
            InboundEvent::FileUpdate(payload) => (&mut self.file_received, payload),
            InboundEvent::TraceUpdate(payload) => (&mut self.trace_update, payload),
            InboundEvent::Unhandled(envelope) => {
                debug!(event = "inbound_kind_unhandled", kind = %envelope.kind);
                return DispatchOutcome::Ignored;
            }
        };

        match slot {
            Some(callback) => {
                callback(payload);
                DispatchOutcome::Delivered
            }
            None => DispatchOutcome::NoHandler,
        }
    }

    pub(crate) fn connected(&mut self) {
        if let Some(callback) = self.connect.as_mut() {
            callback();
        }
    }

    pub(crate) fn disconnected(&mut self, event: &DisconnectEvent) {
        if let Some(callback) = self.disconnect.as_mut() {
            callback(event);
        }
    }

    pub(crate) fn retries_exhausted(&mut self, attempts: u32) {
        if let Some(callback) = self.retries_exhausted.as_mut() {
            callback(attempts);
        }
    }
}
