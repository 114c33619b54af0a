//! One acknowledged-messaging session over a byte stream.
//!
//! A [`Connection`] is a cheap handle. The transport, the frame codec and the
//! message ledger live in a single task that processes handle commands and
//! inbound frames strictly in order; see [`actor`].

mod actor;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ipcwire_frame::Identifier;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info_span, Instrument};

use crate::config::ConnectionConfig;
use crate::error::{PeerError, Result};
use crate::ledger::{AckCallback, MessageKind};
use crate::responder::{
    ErrorHandler, ErrorSource, HandlerError, MessageHandler, Reply, Responder,
};

use actor::Actor;

/// Lifecycle of a connection. Only moves forward, except that an outbound
/// connection goes back to `Connecting` while it reconnects and to `Idle`
/// when an explicit connect fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Destroyed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Destroyed => "destroyed",
        })
    }
}

pub(crate) enum Command {
    Connect {
        path: PathBuf,
        timeout: Duration,
        done: oneshot::Sender<Result<()>>,
    },
    Send {
        kind: MessageKind,
        payload: Bytes,
        on_ack: Option<AckCallback>,
        outcome: oneshot::Sender<Result<Bytes>>,
    },
    Respond {
        id: Identifier,
        reply: Reply,
        delivery: oneshot::Sender<Result<Bytes>>,
    },
    SetMessageHandler(MessageHandler),
    SetErrorHandler(ErrorHandler),
    Close {
        done: oneshot::Sender<Result<()>>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect { path, timeout, .. } => f
                .debug_struct("Connect")
                .field("path", path)
                .field("timeout", timeout)
                .finish(),
            Command::Send { kind, payload, .. } => f
                .debug_struct("Send")
                .field("kind", kind)
                .field("size", &payload.len())
                .finish(),
            Command::Respond { id, reply, .. } => f
                .debug_struct("Respond")
                .field("id", id)
                .field("reply", reply)
                .finish(),
            Command::SetMessageHandler(_) => f.write_str("SetMessageHandler"),
            Command::SetErrorHandler(_) => f.write_str("SetErrorHandler"),
            Command::Close { .. } => f.write_str("Close"),
        }
    }
}

/// Handle to a connection task.
///
/// Clones share the same connection. When every handle and every
/// outstanding [`Responder`] is gone, the connection closes itself
/// gracefully.
#[derive(Clone)]
pub struct Connection {
    id: Identifier,
    config: Arc<ConnectionConfig>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Create an idle outbound connection. Call [`connect`](Self::connect)
    /// next.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ConnectionConfig) -> Self {
        let (connection, actor) = Self::build(config, ConnectionState::Idle);
        connection.spawn(actor);
        connection
    }

    /// Wrap an already connected stream, e.g. one half of
    /// `tokio::io::duplex`. The connection behaves like an accepted one and
    /// never reconnects.
    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::accepted(stream, config, None, None, |_| {})
    }

    /// Set up an inbound connection. `on_connect` runs before the task
    /// starts, so handlers it installs see every frame.
    pub(crate) fn accepted<S>(
        stream: S,
        config: ConnectionConfig,
        message_handler: Option<MessageHandler>,
        error_handler: Option<ErrorHandler>,
        on_connect: impl FnOnce(&Connection),
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (connection, mut actor) = Self::build(config, ConnectionState::Connected);
        actor.set_handlers(message_handler, error_handler);
        actor.install(stream);
        on_connect(&connection);
        connection.spawn(actor);
        connection
    }

    fn build(config: ConnectionConfig, initial: ConnectionState) -> (Self, Actor) {
        let id = Identifier::new();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(initial);
        let config = Arc::new(config);
        let actor = Actor::new(id, Arc::clone(&config), rx, commands.downgrade(), state_tx);
        (
            Self {
                id,
                config,
                commands,
                state,
            },
            actor,
        )
    }

    fn spawn(&self, actor: Actor) {
        tokio::spawn(actor.run().instrument(info_span!("connection", id = %self.id)));
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect to a listener at `path` using the configured connect timeout.
    ///
    /// The path is remembered; if the transport later fails, the connection
    /// reconnects on its own with exponential backoff.
    pub async fn connect(&self, path: impl AsRef<Path>) -> Result<()> {
        self.connect_timeout(path, self.config.connect_timeout())
            .await
    }

    /// Connect, giving up after `timeout`. On failure the connection returns
    /// to `Idle`. A zero timeout fails without dialing.
    pub async fn connect_timeout(&self, path: impl AsRef<Path>, timeout: Duration) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Connect {
            path: path.as_ref().to_path_buf(),
            timeout,
            done,
        })?;
        rx.await.map_err(|_| task_stopped())?
    }

    /// Send a fire-and-forget message. Resolves once the peer acks it.
    pub async fn send_message(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(MessageKind::Message, payload.into(), None)
            .await
            .map(|_| ())
    }

    /// Send a request and wait for its reply.
    ///
    /// `on_ack` runs once when the peer first acknowledges the request. It
    /// runs on the connection task and must not block.
    pub async fn send_request<F>(&self, payload: impl Into<Bytes>, on_ack: F) -> Result<Bytes>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(MessageKind::Request, payload.into(), Some(Box::new(on_ack)))
            .await
    }

    /// [`send_request`](Self::send_request) without an ack callback.
    pub async fn request(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.send(MessageKind::Request, payload.into(), None).await
    }

    async fn send(
        &self,
        kind: MessageKind,
        payload: Bytes,
        on_ack: Option<AckCallback>,
    ) -> Result<Bytes> {
        if payload.is_empty() {
            return Err(PeerError::EmptyPayload);
        }
        let (outcome, rx) = oneshot::channel();
        self.command(Command::Send {
            kind,
            payload,
            on_ack,
            outcome,
        })?;
        rx.await.map_err(|_| task_stopped())?
    }

    /// Install the handler for inbound messages and requests.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(Bytes, Responder) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self
            .command(Command::SetMessageHandler(Arc::new(handler)))
            .is_err()
        {
            debug!(connection = %self.id, "message handler not installed; connection is gone");
        }
    }

    /// Install the handler for framing errors, unsolicited responses and
    /// transport failures.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(ErrorSource, &PeerError) + Send + Sync + 'static,
    {
        if self
            .command(Command::SetErrorHandler(Arc::new(handler)))
            .is_err()
        {
            debug!(connection = %self.id, "error handler not installed; connection is gone");
        }
    }

    /// Stop accepting work, then drop the transport on the next drain tick.
    ///
    /// Sends still waiting on the peer at that point fail with
    /// [`PeerError::Disconnected`].
    pub async fn close(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.command(Command::Close { done }).is_err() {
            return Ok(());
        }
        // A stopped task has already destroyed the connection.
        rx.await.unwrap_or(Ok(()))
    }

    /// Wait until the connection is destroyed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Destroyed)
            .await;
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| task_stopped())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn task_stopped() -> PeerError {
    PeerError::Disconnected("connection task has stopped".to_string())
}

#[cfg(test)]
mod tests;
