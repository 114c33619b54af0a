/// Errors raised while encoding frames or parsing identifiers.
///
/// Malformed inbound bytes are not errors at this level; the reader reports
/// them to its handler and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A payload frame was asked to end with something other than ETX or EOT,
    /// or a signal frame with something other than ACK or NAK.
    #[error("invalid frame terminator 0x{0:02x}")]
    InvalidTerminator(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The writer buffer cannot hold the frame.
    #[error("write buffer full ({required} bytes required, {available} available)")]
    BufferFull { required: usize, available: usize },

    /// A textual identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;
