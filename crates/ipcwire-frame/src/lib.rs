//! Frame codec for the ipcwire protocol.
//!
//! Every frame starts with SOH and a 16-byte identifier, followed either by a
//! single ACK/NAK byte or by a payload section:
//!
//! ```text
//! SOH | id (16B) | ACK
//! SOH | id (16B) | NAK
//! SOH | id (16B) | STX | len | payload | ETX | EOT
//! ```
//!
//! `len` is one byte for lengths below 128, otherwise `0x80 | k` followed by
//! `k` (1..=4) big-endian bytes. The reader is incremental and recovers from
//! malformed input; the writer encodes into a fixed buffer.

pub mod codec;
pub mod error;
pub mod id;
pub mod reader;
pub mod writer;

pub use codec::{
    encoded_len, length_prefix_len, Frame, FrameConfig, FrameKind, ACK, DEFAULT_READ_BUFFER,
    DEFAULT_WRITE_BUFFER, EOT, ETX, MAX_PAYLOAD, NAK, SOH, STX,
};
pub use error::{FrameError, Result};
pub use id::{Identifier, ID_LEN};
pub use reader::{FrameEvent, FrameHandler, FrameReader};
pub use writer::FrameWriter;
