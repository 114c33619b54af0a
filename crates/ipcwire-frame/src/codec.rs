use std::fmt;

use bytes::Bytes;

use crate::id::{Identifier, ID_LEN};

/// Start of a frame.
pub const SOH: u8 = 0x01;
/// Start of a payload section.
pub const STX: u8 = 0x02;
/// Ends a Message payload.
pub const ETX: u8 = 0x03;
/// Ends a Reply payload.
pub const EOT: u8 = 0x04;
/// Positive acknowledgment; replaces the payload section.
pub const ACK: u8 = 0x06;
/// Negative acknowledgment; replaces the payload section.
pub const NAK: u8 = 0x15;

/// Set on the first length byte when the length does not fit in 7 bits.
pub const LENGTH_FLAG: u8 = 0x80;
/// Most length bytes a long-form length may use.
pub const MAX_LENGTH_BYTES: usize = 4;
/// Largest payload the length encoding can express.
pub const MAX_PAYLOAD: usize = u32::MAX as usize;
/// Default reader scratch capacity: 1 MiB.
pub const DEFAULT_READ_BUFFER: usize = 1024 * 1024;
/// Default writer buffer capacity: 1 KiB.
pub const DEFAULT_WRITE_BUFFER: usize = 1024;

/// SOH followed by the identifier.
pub const HEADER_SIZE: usize = 1 + ID_LEN;
/// Wire size of an ACK or NAK frame.
pub const SIGNAL_FRAME_SIZE: usize = HEADER_SIZE + 1;

/// The six frame shapes.
///
/// A query is a Message or Reply frame with an empty payload. It asks the
/// peer to resend whatever outcome it already produced for the identifier.
///
/// ```text
/// SOH | id (16B) | ACK
/// SOH | id (16B) | NAK
/// SOH | id (16B) | STX | len | payload | ETX   (Message / MessageQuery)
/// SOH | id (16B) | STX | len | payload | EOT   (Reply / ReplyQuery)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Message,
    MessageQuery,
    Reply,
    ReplyQuery,
    Ack,
    Nak,
}

impl FrameKind {
    /// Classify a payload frame from its terminator and payload length.
    pub fn from_terminator(terminator: u8, payload_len: usize) -> Option<Self> {
        match (terminator, payload_len) {
            (ETX, 0) => Some(FrameKind::MessageQuery),
            (ETX, _) => Some(FrameKind::Message),
            (EOT, 0) => Some(FrameKind::ReplyQuery),
            (EOT, _) => Some(FrameKind::Reply),
            _ => None,
        }
    }

    /// The byte that closes this kind of frame.
    pub fn terminator(self) -> u8 {
        match self {
            FrameKind::Message | FrameKind::MessageQuery => ETX,
            FrameKind::Reply | FrameKind::ReplyQuery => EOT,
            FrameKind::Ack => ACK,
            FrameKind::Nak => NAK,
        }
    }

    /// Whether frames of this kind carry a payload section.
    pub fn has_payload_section(self) -> bool {
        !matches!(self, FrameKind::Ack | FrameKind::Nak)
    }

    pub fn is_query(self) -> bool {
        matches!(self, FrameKind::MessageQuery | FrameKind::ReplyQuery)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Message => "message",
            FrameKind::MessageQuery => "message-query",
            FrameKind::Reply => "reply",
            FrameKind::ReplyQuery => "reply-query",
            FrameKind::Ack => "ack",
            FrameKind::Nak => "nak",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: Identifier,
    /// Empty for queries and signals.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, id: Identifier, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            id,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        encoded_len(self.kind, self.payload.len())
    }
}

/// Limits shared by the reader and the writer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Declared lengths above this are framing errors. Default: 2^32 - 1.
    pub max_payload_size: usize,
    /// Initial reader scratch capacity. Default: 1 MiB.
    pub read_buffer_size: usize,
    /// Writer buffer capacity. Default: 1 KiB.
    pub write_buffer_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD,
            read_buffer_size: DEFAULT_READ_BUFFER,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        }
    }
}

/// Number of bytes the length prefix takes for `len`.
pub fn length_prefix_len(len: usize) -> usize {
    if len < LENGTH_FLAG as usize {
        1
    } else {
        1 + significant_bytes(len)
    }
}

/// Exact wire size of a frame of `kind` with a payload of `payload_len` bytes.
pub fn encoded_len(kind: FrameKind, payload_len: usize) -> usize {
    if kind.has_payload_section() {
        // STX + length + payload + terminator
        HEADER_SIZE + 1 + length_prefix_len(payload_len) + payload_len + 1
    } else {
        SIGNAL_FRAME_SIZE
    }
}

/// Write the length prefix for `len` into `dst`.
///
/// Lengths below 128 take one byte. Longer ones take `0x80 | k` followed by
/// `k` big-endian bytes. `dst` must have room for [`length_prefix_len`] bytes
/// and `len` must not exceed [`MAX_PAYLOAD`].
pub fn put_length(dst: &mut impl bytes::BufMut, len: usize) {
    if len < LENGTH_FLAG as usize {
        dst.put_u8(len as u8);
        return;
    }
    let k = significant_bytes(len);
    dst.put_u8(LENGTH_FLAG | k as u8);
    let be = (len as u64).to_be_bytes();
    dst.put_slice(&be[be.len() - k..]);
}

fn significant_bytes(len: usize) -> usize {
    let bits = usize::BITS - len.leading_zeros();
    bits.div_ceil(8) as usize
}

/// Whether `byte` can end a complete frame.
///
/// ETX is left out: payload bytes equal to ETX are common, and only these
/// three are trusted as resynchronization anchors.
pub(crate) fn is_restart_anchor(byte: u8) -> bool {
    matches!(byte, ACK | NAK | EOT)
}
