//! Consumer handle for the realtime chat connection.
//!
//! [`RealtimeClient`] is a cheap, cloneable handle. All connection state lives
//! in a background worker task; the handle only posts commands to it, so none
//! of its methods block.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

use crate::realtime::handlers::{DisconnectEvent, Handler};
use crate::realtime::proto::{Envelope, MessageKind};
use crate::realtime::queue::OverflowPolicy;
use crate::realtime::worker::{Command, Worker};
use crate::retry::ReconnectPolicy;

/// Default chat service endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8787";
/// Close code marking an intentional shutdown. Any other close is abnormal.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close reason sent by [`RealtimeClient::disconnect`].
pub const INTENTIONAL_DISCONNECT_REASON: &str = "Intentional disconnect";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = ReconnectPolicy::DEFAULT_MAX_ATTEMPTS;
    pub const RECONNECT_DELAY: Duration = ReconnectPolicy::DEFAULT_DELAY;
}

/// Connection settings for a [`RealtimeClient`].
#[derive(Clone, Debug)]
pub struct RealtimeClientOptions {
    /// Endpoint used by [`RealtimeClient::connect`].
    pub endpoint: String,
    /// Automatic reconnect behavior after an abnormal close.
    pub reconnect: ReconnectPolicy,
    /// Upper bound for a single connect attempt, handshake included.
    pub connect_timeout: Duration,
    /// Maximum number of queued outbound envelopes. `None` is unbounded.
    pub max_pending: Option<usize>,
    /// Which envelope to discard when the pending queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect: ReconnectPolicy {
                max_attempts: RealtimeDefaults::MAX_RECONNECT_ATTEMPTS,
                delay: RealtimeDefaults::RECONNECT_DELAY,
            },
            connect_timeout: RealtimeDefaults::CONNECT_TIMEOUT,
            max_pending: None,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl RealtimeClientOptions {
    /// Sets the default endpoint. Trailing whitespace is dropped.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds the pending queue, discarding per `overflow` once full.
    pub fn with_pending_limit(mut self, max_pending: usize, overflow: OverflowPolicy) -> Self {
        self.max_pending = Some(max_pending);
        self.overflow = overflow;
        self
    }
}

/// Lifecycle of the underlying connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Errors produced by the realtime client.
///
/// Socket-side failures never reach consumers directly; they are logged by the
/// worker. These errors surface through [`PendingConnect::wait`] and client
/// construction.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connect attempt failed before the socket opened.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// Connect attempt did not finish within the configured timeout.
    #[error("connect to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// Attempt was aborted by [`RealtimeClient::disconnect`].
    #[error("connect attempt cancelled by disconnect")]
    Cancelled,

    /// Background worker is no longer running.
    #[error("realtime worker stopped")]
    WorkerStopped,

    /// Client was created outside a Tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Outcome of a connect request.
///
/// Dropping it leaves the attempt running; awaiting [`PendingConnect::wait`]
/// reports whether the socket opened.
#[derive(Debug)]
pub struct PendingConnect {
    reply: oneshot::Receiver<Result<(), RealtimeError>>,
}

impl PendingConnect {
    /// Waits for the attempt to open, fail, or be cancelled.
    pub async fn wait(self) -> Result<(), RealtimeError> {
        self.reply
            .await
            .unwrap_or(Err(RealtimeError::WorkerStopped))
    }
}

/// Handle to a reconnecting chat connection.
///
/// Clones share the same connection. The worker closes the socket with
/// [`NORMAL_CLOSURE`] and stops once every clone is dropped.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl RealtimeClient {
    /// Creates a client with default options.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self, RealtimeError> {
        Self::with_options(RealtimeClientOptions::default())
    }

    /// Creates a client and spawns its worker on the current runtime.
    ///
    /// No connection is attempted until [`connect`](Self::connect) is called.
    pub fn with_options(options: RealtimeClientOptions) -> Result<Self, RealtimeError> {
        let runtime = Handle::try_current()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker::new(&options, commands_rx, state_tx);
        runtime.spawn(worker.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
        })
    }

    /// Connects to the configured endpoint.
    ///
    /// Joins an in-flight attempt and resolves immediately when already
    /// connected. Cancels a scheduled reconnect.
    pub fn connect(&self) -> PendingConnect {
        self.request_connect(None)
    }

    /// Connects to `url`, which also becomes the target of later reconnects.
    ///
    /// While already connected or connecting, the current socket is kept
    /// and `url` only takes effect on the next open.
    pub fn connect_to(&self, url: impl Into<String>) -> PendingConnect {
        self.request_connect(Some(url.into()))
    }

    fn request_connect(&self, url: Option<String>) -> PendingConnect {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(Command::Connect {
            url,
            reply: reply_tx,
        });
        PendingConnect { reply: reply_rx }
    }

    /// Closes the connection with [`NORMAL_CLOSURE`].
    ///
    /// No automatic reconnect follows, including one already scheduled.
    /// Queued envelopes are kept for the next successful connect.
    pub fn disconnect(&self) {
        self.post(Command::Disconnect);
    }

    /// Sends an envelope now if connected, otherwise queues it.
    pub fn send(&self, kind: impl Into<MessageKind>, payload: Value) {
        self.post(Command::Send(Envelope::new(kind, payload)));
    }

    pub fn send_chat_message(&self, message: Value) {
        self.send(MessageKind::ChatMessage, message);
    }

    /// Sends file metadata.
    pub fn upload_file(&self, file: Value) {
        self.send(MessageKind::FileUpload, file);
    }

    pub fn update_trace_selection(&self, trace: Value) {
        self.send(MessageKind::TraceSelection, trace);
    }

    /// Sets the callback for inbound `chat_message` payloads.
    ///
    /// Each event holds one callback; registering again replaces it.
    pub fn on_message<F>(&self, callback: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.register(Handler::Message(Box::new(callback)));
    }

    /// Sets the callback invoked after each successful open.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.register(Handler::Connect(Box::new(callback)));
    }

    /// Sets the callback invoked when an established connection closes.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnMut(&DisconnectEvent) + Send + 'static,
    {
        self.register(Handler::Disconnect(Box::new(callback)));
    }

    /// Sets the callback for inbound `file_update` payloads.
    pub fn on_file_received<F>(&self, callback: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.register(Handler::FileReceived(Box::new(callback)));
    }

    /// Sets the callback for inbound `trace_update` payloads.
    pub fn on_trace_update<F>(&self, callback: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.register(Handler::TraceUpdate(Box::new(callback)));
    }

    /// Sets the callback invoked when automatic reconnects give up.
    pub fn on_retries_exhausted<F>(&self, callback: F)
    where
        F: FnMut(u32) + Send + 'static,
    {
        self.register(Handler::RetriesExhausted(Box::new(callback)));
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn register(&self, handler: Handler) {
        self.post(Command::Register(handler));
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(event = "realtime_worker_gone");
        }
    }
}
