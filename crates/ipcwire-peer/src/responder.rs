use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use ipcwire_frame::Identifier;
use tokio::sync::{mpsc, oneshot};

use crate::connection::Command;
use crate::error::{PeerError, Result};

/// Error type message handlers and deferred replies fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A reply still being computed.
pub type BoxReplyFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Bytes, HandlerError>> + Send>>;

/// Application handler for inbound messages and requests.
///
/// Runs on the connection task, so it must not block. Slow work belongs in a
/// [`Reply::Deferred`] or in a task that holds on to the [`Responder`].
pub type MessageHandler =
    Arc<dyn Fn(Bytes, Responder) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Receives errors that are not tied to a single caller.
pub type ErrorHandler = Arc<dyn Fn(ErrorSource, &PeerError) + Send + Sync>;

/// Where an error reported to an [`ErrorHandler`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    Connection(Identifier),
    Listener(Identifier),
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Connection(id) => write!(f, "connection {id}"),
            ErrorSource::Listener(id) => write!(f, "listener {id}"),
        }
    }
}

/// How an inbound message is answered.
pub enum Reply {
    /// Acknowledge only.
    None,
    /// Answer with a Reply frame right away. An empty payload is sent as a
    /// plain Ack.
    Immediate(Bytes),
    /// Ack now, then send the result as a Reply, or a Nak if it fails.
    Deferred(BoxReplyFuture),
}

impl Reply {
    pub fn immediate(payload: impl Into<Bytes>) -> Self {
        Reply::Immediate(payload.into())
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<Bytes, HandlerError>> + Send + 'static,
    {
        Reply::Deferred(Box::pin(future))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::None => f.write_str("None"),
            Reply::Immediate(payload) => f.debug_tuple("Immediate").field(&payload.len()).finish(),
            Reply::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Answers one inbound message.
///
/// Handed to the [`MessageHandler`] together with the payload. It may be
/// moved to another task and used later; it keeps the connection alive until
/// it is consumed or dropped.
pub struct Responder {
    id: Identifier,
    commands: mpsc::UnboundedSender<Command>,
}

impl Responder {
    pub(crate) fn new(id: Identifier, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, commands }
    }

    /// Identifier of the message being answered.
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Send `reply`. The returned [`Delivery`] may be awaited or dropped.
    pub fn respond(self, reply: Reply) -> Delivery {
        let (delivery, rx) = oneshot::channel();
        // A closed channel drops `delivery`, which the receiver reports.
        let _ = self.commands.send(Command::Respond {
            id: self.id,
            reply,
            delivery,
        });
        Delivery { rx }
    }

    /// Shorthand for `respond(Reply::None)`.
    pub fn ack(self) -> Delivery {
        self.respond(Reply::None)
    }

    /// Shorthand for `respond(Reply::immediate(payload))`.
    pub fn reply(self, payload: impl Into<Bytes>) -> Delivery {
        self.respond(Reply::immediate(payload))
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

/// Completion of a [`Responder::respond`] call.
///
/// Resolves once the Ack has been written (for [`Reply::None`]) or once the
/// peer acknowledged our Reply. Nak, retry exhaustion and failed deferred
/// replies resolve with an error.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl IntoFuture for Delivery {
    type Output = Result<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.rx.await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(PeerError::Disconnected(
                    "connection task has stopped".to_string(),
                )),
            }
        })
    }
}
