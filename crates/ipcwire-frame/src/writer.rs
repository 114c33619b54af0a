use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    encoded_len, put_length, FrameConfig, FrameKind, ACK, DEFAULT_WRITE_BUFFER, EOT, ETX,
    MAX_PAYLOAD, NAK, SOH, STX,
};
use crate::error::{FrameError, Result};
use crate::id::Identifier;

/// Encodes frames into a fixed-capacity buffer.
///
/// Each `write_*` call appends one frame and returns the new write position.
/// [`flush`](Self::flush) hands the accumulated bytes out and resets the
/// position. The buffer never grows: a frame that does not fit fails with
/// [`FrameError::BufferFull`] and leaves the buffer untouched, so the caller
/// can flush, resize and retry.
pub struct FrameWriter {
    buf: BytesMut,
    capacity: usize,
    max_payload_size: usize,
}

impl FrameWriter {
    /// Create a writer with the default 1 KiB buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WRITE_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            max_payload_size: MAX_PAYLOAD,
        }
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size.min(MAX_PAYLOAD),
            ..Self::with_capacity(config.write_buffer_size)
        }
    }

    /// Total buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current write position.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Bytes left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn write_message(&mut self, id: &Identifier, payload: &[u8]) -> Result<usize> {
        self.write_payload(id, payload, ETX)
    }

    pub fn write_message_query(&mut self, id: &Identifier) -> Result<usize> {
        self.write_payload(id, &[], ETX)
    }

    pub fn write_reply(&mut self, id: &Identifier, payload: &[u8]) -> Result<usize> {
        self.write_payload(id, payload, EOT)
    }

    pub fn write_reply_query(&mut self, id: &Identifier) -> Result<usize> {
        self.write_payload(id, &[], EOT)
    }

    pub fn write_ack(&mut self, id: &Identifier) -> Result<usize> {
        self.write_signal(id, ACK)
    }

    pub fn write_nak(&mut self, id: &Identifier) -> Result<usize> {
        self.write_signal(id, NAK)
    }

    /// Encode a frame of `kind`. The payload is ignored for queries and
    /// signals.
    pub fn write_frame(
        &mut self,
        kind: FrameKind,
        id: &Identifier,
        payload: &[u8],
    ) -> Result<usize> {
        match kind {
            FrameKind::Message => self.write_message(id, payload),
            FrameKind::MessageQuery => self.write_message_query(id),
            FrameKind::Reply => self.write_reply(id, payload),
            FrameKind::ReplyQuery => self.write_reply_query(id),
            FrameKind::Ack => self.write_ack(id),
            FrameKind::Nak => self.write_nak(id),
        }
    }

    /// Encode `SOH id STX len payload terminator`.
    ///
    /// `terminator` must be ETX or EOT.
    pub fn write_payload(
        &mut self,
        id: &Identifier,
        payload: &[u8],
        terminator: u8,
    ) -> Result<usize> {
        if terminator != ETX && terminator != EOT {
            return Err(FrameError::InvalidTerminator(terminator));
        }
        if payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }
        self.reserve(encoded_len(FrameKind::Message, payload.len()))?;

        self.buf.put_u8(SOH);
        self.buf.put_slice(id.as_bytes());
        self.buf.put_u8(STX);
        put_length(&mut self.buf, payload.len());
        self.buf.put_slice(payload);
        self.buf.put_u8(terminator);
        Ok(self.buf.len())
    }

    /// Encode `SOH id signal`. `signal` must be ACK or NAK.
    pub fn write_signal(&mut self, id: &Identifier, signal: u8) -> Result<usize> {
        if signal != ACK && signal != NAK {
            return Err(FrameError::InvalidTerminator(signal));
        }
        self.reserve(encoded_len(FrameKind::Ack, 0))?;

        self.buf.put_u8(SOH);
        self.buf.put_slice(id.as_bytes());
        self.buf.put_u8(signal);
        Ok(self.buf.len())
    }

    /// Take the encoded bytes and reset the position to zero.
    pub fn flush(&mut self) -> Bytes {
        let out = self.buf.split().freeze();
        self.buf.reserve(self.capacity);
        out
    }

    fn reserve(&self, required: usize) -> Result<()> {
        let available = self.remaining();
        if required > available {
            return Err(FrameError::BufferFull {
                required,
                available,
            });
        }
        Ok(())
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}
