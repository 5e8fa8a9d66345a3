//! Background task owning the websocket, pending queue, retry counter and
//! consumer callbacks.
//!
//! The reconnect timer is a deadline polled by the same `select!` loop that
//! reads commands and frames, so a `Disconnect` command clears it before it
//! can fire.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::realtime::client::{
    ConnectionState, RealtimeClientOptions, RealtimeError, INTENTIONAL_DISCONNECT_REASON,
    NORMAL_CLOSURE,
};
use crate::realtime::handlers::{DisconnectEvent, EventHandlers, Handler};
use crate::realtime::proto::Envelope;
use crate::realtime::queue::PendingQueue;
use crate::retry::{with_timeout, RetryCounter};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectReply = oneshot::Sender<Result<(), RealtimeError>>;

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        url: Option<String>,
        reply: ConnectReply,
    },
    Disconnect,
    Send(Envelope),
    Register(Handler),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttemptOrigin {
    Manual,
    Reconnect,
}

enum AttemptFailure {
    Refused(String),
    TimedOut,
}

impl AttemptFailure {
    fn to_error(&self, url: &str, timeout: Duration) -> RealtimeError {
        match self {
            Self::Refused(reason) => RealtimeError::Connect {
                url: url.to_string(),
                reason: reason.clone(),
            },
            Self::TimedOut => RealtimeError::ConnectTimeout {
                url: url.to_string(),
                timeout,
            },
        }
    }
}

enum Establish {
    Open(Box<Socket>),
    Failed { url: String, failure: AttemptFailure },
    Cancelled,
    Shutdown,
}

enum Closed {
    /// `disconnect()` was called.
    Intentional,
    /// Peer close frame, transport error, or failed write.
    Lost { code: Option<u16>, reason: String },
    /// Every client handle was dropped.
    Shutdown,
}

pub(crate) struct Worker {
    endpoint: String,
    connect_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    handlers: EventHandlers,
    pending: PendingQueue,
    retry: RetryCounter,
    reconnect_at: Option<Instant>,
    waiters: Vec<ConnectReply>,
}

impl Worker {
    pub(crate) fn new(
        options: &RealtimeClientOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            endpoint: options.endpoint.clone(),
            connect_timeout: options.connect_timeout,
            commands,
            state,
            handlers: EventHandlers::default(),
            pending: PendingQueue::new(options.max_pending, options.overflow),
            retry: RetryCounter::new(options.reconnect),
            reconnect_at: None,
            waiters: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(origin) = self.idle().await {
            let socket = match self.establish(origin).await {
                Establish::Open(socket) => socket,
                Establish::Failed { url, failure } => {
                    self.attempt_failed(origin, &url, &failure);
                    continue;
                }
                Establish::Cancelled => continue,
                Establish::Shutdown => break,
            };

            let closed = self.serve(*socket).await;
            if !self.connection_closed(closed) {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!(event = "realtime_worker_stopped", dropped = self.pending.len());
    }

    /// Waits while disconnected for a connect request or the reconnect timer.
    async fn idle(&mut self) -> Option<AttemptOrigin> {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => return None,
                    Some(Command::Connect { url, reply }) => {
                        if let Some(url) = url {
                            self.endpoint = url;
                        }
                        if self.reconnect_at.take().is_some() {
                            debug!(event = "reconnect_superseded_by_connect");
                        }
                        self.waiters.push(reply);
                        return Some(AttemptOrigin::Manual);
                    }
                    Some(Command::Disconnect) => {
                        if self.reconnect_at.take().is_some() {
                            info!(event = "reconnect_cancelled", url = %self.endpoint);
                        }
                    }
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                    Some(Command::Register(handler)) => self.handlers.install(handler),
                },
                () = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    return Some(AttemptOrigin::Reconnect);
                }
            }
        }
    }

    /// Opens the socket while still serving commands.
    async fn establish(&mut self, origin: AttemptOrigin) -> Establish {
        self.set_state(ConnectionState::Connecting);
        let url = self.endpoint.clone();
        info!(
            event = "realtime_connecting",
            url = %url,
            origin = ?origin,
            attempt = self.retry.attempts()
        );

        let attempt = with_timeout(self.connect_timeout, connect_async(url.clone()));
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(Ok((socket, _response))) => Establish::Open(Box::new(socket)),
                        Ok(Err(err)) => Establish::Failed {
                            url,
                            failure: AttemptFailure::Refused(err.to_string()),
                        },
                        Err(_elapsed) => Establish::Failed {
                            url,
                            failure: AttemptFailure::TimedOut,
                        },
                    };
                }
                command = self.commands.recv() => match command {
                    None => return Establish::Shutdown,
                    Some(Command::Connect { url: requested, reply }) => {
                        if let Some(requested) = requested.filter(|requested| *requested != url) {
                            info!(
                                event = "reconnect_target_changed",
                                connecting = %url,
                                next = %requested
                            );
                            self.endpoint = requested;
                        }
                        self.waiters.push(reply);
                    }
                    Some(Command::Disconnect) => {
                        info!(event = "realtime_connect_cancelled", url = %url);
                        self.reconnect_at = None;
                        self.set_state(ConnectionState::Disconnected);
                        self.reply_waiters(|| Err(RealtimeError::Cancelled));
                        return Establish::Cancelled;
                    }
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                    Some(Command::Register(handler)) => self.handlers.install(handler),
                },
            }
        }
    }

    fn attempt_failed(&mut self, origin: AttemptOrigin, url: &str, failure: &AttemptFailure) {
        self.set_state(ConnectionState::Disconnected);
        let timeout = self.connect_timeout;
        warn!(
            event = "realtime_connect_failed",
            url = %url,
            origin = ?origin,
            error = %failure.to_error(url, timeout)
        );
        self.reply_waiters(|| Err(failure.to_error(url, timeout)));

        // A failed reconnect is another abnormal close; a failed manual
        // connect is left to the caller.
        if origin == AttemptOrigin::Reconnect {
            self.connection_lost(None, failure.to_error(url, timeout).to_string());
        }
    }

    /// Runs an open connection until it closes.
    async fn serve(&mut self, mut socket: Socket) -> Closed {
        self.retry.reset();
        self.set_state(ConnectionState::Connected);
        info!(
            event = "realtime_connected",
            url = %self.endpoint,
            queued = self.pending.len()
        );

        let flushed = self.flush_pending(&mut socket).await;
        self.reply_waiters(|| Ok(()));
        self.handlers.connected();
        if let Err(err) = flushed {
            return Closed::Lost {
                code: None,
                reason: err.to_string(),
            };
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        close_normally(&mut socket).await;
                        return Closed::Shutdown;
                    }
                    Some(Command::Connect { url, reply }) => {
                        if let Some(url) = url.filter(|url| *url != self.endpoint) {
                            info!(
                                event = "reconnect_target_changed",
                                connected = %self.endpoint,
                                next = %url
                            );
                            self.endpoint = url;
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Disconnect) => {
                        close_normally(&mut socket).await;
                        return Closed::Intentional;
                    }
                    Some(Command::Send(envelope)) => {
                        if let Err(err) = self.deliver(&mut socket, envelope).await {
                            return Closed::Lost { code: None, reason: err.to_string() };
                        }
                    }
                    Some(Command::Register(handler)) => self.handlers.install(handler),
                },
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handlers.dispatch(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        warn!(event = "inbound_binary_frame_dropped", len = bytes.len());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return Closed::Lost { code: None, reason: err.to_string() };
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let closed = match frame {
                            Some(frame) => Closed::Lost {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.into_owned(),
                            },
                            None => Closed::Lost {
                                code: None,
                                reason: "close frame without status".to_string(),
                            },
                        };
                        finish_peer_close(&mut socket, self.connect_timeout).await;
                        return closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "realtime_transport_error", error = %err);
                        return Closed::Lost { code: None, reason: err.to_string() };
                    }
                    None => {
                        return Closed::Lost {
                            code: None,
                            reason: "connection ended without close frame".to_string(),
                        };
                    }
                },
            }
        }
    }

    /// Applies the close policy. Returns `false` when the worker should stop.
    fn connection_closed(&mut self, closed: Closed) -> bool {
        self.set_state(ConnectionState::Disconnected);

        let (code, reason) = match closed {
            Closed::Shutdown => {
                info!(event = "realtime_client_dropped", url = %self.endpoint);
                return false;
            }
            Closed::Intentional => (
                Some(NORMAL_CLOSURE),
                INTENTIONAL_DISCONNECT_REASON.to_string(),
            ),
            Closed::Lost {
                code: Some(NORMAL_CLOSURE),
                reason,
            } => (Some(NORMAL_CLOSURE), reason),
            Closed::Lost { code, reason } => {
                self.connection_lost(code, reason);
                return true;
            }
        };

        self.notify_disconnected(&DisconnectEvent {
            code,
            reason,
            reconnecting: false,
            retry_attempt: None,
        });
        true
    }

    /// Abnormal close of a connection or of a reconnect attempt: schedules
    /// the next attempt, or gives up once the counter is spent.
    fn connection_lost(&mut self, code: Option<u16>, reason: String) {
        let reconnecting = self.schedule_reconnect();
        self.notify_disconnected(&DisconnectEvent {
            code,
            reason,
            reconnecting,
            retry_attempt: reconnecting.then(|| self.retry.attempts()),
        });
        if !reconnecting {
            self.handlers.retries_exhausted(self.retry.attempts());
        }
    }

    fn notify_disconnected(&mut self, event: &DisconnectEvent) {
        info!(
            event = "realtime_disconnected",
            url = %self.endpoint,
            code = ?event.code,
            reason = %event.reason,
            reconnecting = event.reconnecting
        );
        self.handlers.disconnected(event);
    }

    fn schedule_reconnect(&mut self) -> bool {
        let Some(delay) = self.retry.next_delay() else {
            warn!(
                event = "reconnect_gave_up",
                url = %self.endpoint,
                attempts = self.retry.attempts()
            );
            return false;
        };

        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            event = "reconnect_scheduled",
            url = %self.endpoint,
            attempt = self.retry.attempts(),
            max_attempts = self.retry.max_attempts(),
            delay_ms = delay.as_millis() as u64
        );
        true
    }

    async fn flush_pending(&mut self, socket: &mut Socket) -> Result<(), RealtimeError> {
        let queued = self.pending.len();
        while let Some(envelope) = self.pending.pop() {
            self.deliver(socket, envelope).await?;
        }
        if queued > 0 {
            debug!(event = "pending_queue_flushed", sent = queued);
        }
        Ok(())
    }

    /// Writes one envelope. A transport failure puts it back at the head of
    /// the pending queue; an unencodable envelope is dropped.
    async fn deliver(&mut self, socket: &mut Socket, envelope: Envelope) -> Result<(), RealtimeError> {
        match send_envelope(socket, &envelope).await {
            Ok(()) => Ok(()),
            Err(RealtimeError::Json(err)) => {
                warn!(event = "outbound_envelope_unencodable", kind = %envelope.kind, error = %err);
                Ok(())
            }
            Err(err) => {
                self.pending.requeue_front(envelope);
                Err(err)
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        let kind = envelope.kind.clone();
        let dropped = self.pending.push(envelope);
        debug!(
            event = "outbound_envelope_queued",
            kind = %kind,
            queued = self.pending.len(),
            dropped = dropped.is_some()
        );
    }

    fn reply_waiters<F>(&mut self, result: F)
    where
        F: Fn() -> Result<(), RealtimeError>,
    {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send_envelope(socket: &mut Socket, envelope: &Envelope) -> Result<(), RealtimeError> {
    let text = envelope.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

/// Reads until the peer ends the stream so the automatic close reply is
/// written before the socket is dropped.
async fn finish_peer_close(socket: &mut Socket, limit: Duration) {
    let drained = with_timeout(limit, async {
        while let Some(Ok(_)) = socket.next().await {}
    })
    .await;
    if drained.is_err() {
        debug!(event = "peer_close_drain_timed_out");
    }
}

async fn close_normally(socket: &mut Socket) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: INTENTIONAL_DISCONNECT_REASON.into(),
    };
    if let Err(err) = socket.close(Some(frame)).await {
        debug!(event = "realtime_close_failed", error = %err);
    }
}
