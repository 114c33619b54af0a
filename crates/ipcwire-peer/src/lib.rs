//! Acknowledged messaging over ipcwire frames.
//!
//! A [`Connection`] sends fire-and-forget messages and requests, retries them
//! until the peer acknowledges, correlates replies, and answers duplicate
//! inbound frames from its ledger instead of running the handler twice. A
//! [`Listener`] accepts connections on a Unix domain socket.
//!
//! ```no_run
//! # async fn demo() -> ipcwire_peer::Result<()> {
//! use ipcwire_peer::{connect, Listener};
//!
//! let mut listener = Listener::bind("/tmp/demo.sock")?
//!     .with_message_handler(|payload, responder| {
//!         responder.reply(payload);
//!         Ok(())
//!     });
//! listener.start();
//!
//! let client = connect("/tmp/demo.sock").await?;
//! let reply = client.request("ping").await?;
//! assert_eq!(&reply[..], b"ping");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod ledger;
pub mod listener;
pub mod responder;

pub use config::{ConnectionConfig, ProtocolConfig};
pub use connection::{Connection, ConnectionState};
pub use connector::{connect, connect_with_config};
pub use error::{PeerError, Result};
pub use ledger::{
    AckCallback, Deadline, MessageKind, ReceivedMessage, ReceivedState, SentMessage, SentState,
};
pub use listener::{ConnectHandler, Listener};
pub use responder::{
    BoxReplyFuture, Delivery, ErrorHandler, ErrorSource, HandlerError, MessageHandler, Reply,
    Responder,
};
