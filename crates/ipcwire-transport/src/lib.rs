//! Byte-stream transport for ipcwire.
//!
//! Unix domain sockets on tokio. The stream carries bytes in order and
//! nothing else; framing lives in `ipcwire-frame`.

pub mod error;
pub mod stream;
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::IpcStream;
pub use uds::UnixDomainSocket;
