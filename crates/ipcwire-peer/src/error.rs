use std::time::Duration;

use bytes::Bytes;
use ipcwire_frame::{FrameKind, Identifier};

/// Errors that can occur in connection and listener operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] ipcwire_transport::TransportError),

    /// Frame encoding error.
    #[error("frame error: {0}")]
    Frame(#[from] ipcwire_frame::FrameError),

    /// Inbound bytes were discarded while resynchronizing.
    #[error("framing error: discarded {} bytes", .discarded.len())]
    Framing { discarded: Bytes },

    /// An Ack, Nak, Reply or ReplyQuery arrived for an identifier we never sent.
    #[error("unsolicited {kind} {id} received")]
    Unsolicited { kind: FrameKind, id: Identifier },

    /// The peer answered with Nak.
    #[error("message {id} rejected by peer")]
    Rejected { id: Identifier },

    /// No Ack or Reply arrived after every retry.
    #[error("message {id} timed out after {retries} retries")]
    TimedOut { id: Identifier, retries: u32 },

    /// The application handler failed.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// An inbound message arrived with no handler installed.
    #[error("no message handler installed")]
    NoMessageHandler,

    /// Empty payloads are indistinguishable from query frames.
    #[error("payload must not be empty")]
    EmptyPayload,

    /// The connection has no transport.
    #[error("connection is not connected")]
    NotConnected,

    /// `connect` was called on a connection that already has a transport.
    #[error("connection is already connected")]
    AlreadyConnected,

    /// The connection is draining and accepts no new work.
    #[error("connection is closing")]
    Closing,

    /// The inbound message already has an outcome.
    #[error("message {id} already has a response")]
    AlreadyResponded { id: Identifier },

    /// The inbound record was evicted before a response was sent.
    #[error("message {id} expired before a response was sent")]
    Expired { id: Identifier },

    /// The connection went away with the operation still pending.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// Connecting took longer than allowed.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Graceful shutdown failed.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PeerError>;
