//! Acknowledged duplex messaging over Unix domain sockets.
//!
//! Every message is retried until the peer acknowledges it, requests are
//! correlated with their replies, and duplicate deliveries are answered from
//! a ledger instead of reaching the application twice.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket listener and stream
//! - [`frame`]: wire codec (SOH/STX/ETX/EOT frames, identifiers)
//! - [`peer`]: connections, listener and message ledger (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use ipcwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ipcwire_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use ipcwire_peer::*;
}
