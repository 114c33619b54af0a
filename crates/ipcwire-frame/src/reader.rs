use bytes::Bytes;
use tracing::{debug, trace};

use crate::codec::{
    is_restart_anchor, Frame, FrameConfig, FrameKind, ACK, LENGTH_FLAG, MAX_LENGTH_BYTES, NAK,
    SOH, STX,
};
use crate::id::{Identifier, ID_LEN};

/// Receives the events produced by [`FrameReader::read`].
///
/// Every method has a no-op default so implementors only override what they
/// care about.
pub trait FrameHandler {
    fn on_message(&mut self, _id: Identifier, _payload: Bytes) {}
    fn on_message_query(&mut self, _id: Identifier) {}
    fn on_reply(&mut self, _id: Identifier, _payload: Bytes) {}
    fn on_reply_query(&mut self, _id: Identifier) {}
    fn on_ack(&mut self, _id: Identifier) {}
    fn on_nak(&mut self, _id: Identifier) {}
    /// Bytes dropped while resynchronizing.
    fn on_framing_error(&mut self, _discarded: Bytes) {}
}

/// Event form of the [`FrameHandler`] callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Frame),
    FramingError(Bytes),
}

/// Collects events so they can be dispatched after `read` returns.
impl FrameHandler for Vec<FrameEvent> {
    fn on_message(&mut self, id: Identifier, payload: Bytes) {
        self.push(FrameEvent::Frame(Frame::new(FrameKind::Message, id, payload)));
    }

    fn on_message_query(&mut self, id: Identifier) {
        self.push(FrameEvent::Frame(Frame::new(
            FrameKind::MessageQuery,
            id,
            Bytes::new(),
        )));
    }

    fn on_reply(&mut self, id: Identifier, payload: Bytes) {
        self.push(FrameEvent::Frame(Frame::new(FrameKind::Reply, id, payload)));
    }

    fn on_reply_query(&mut self, id: Identifier) {
        self.push(FrameEvent::Frame(Frame::new(
            FrameKind::ReplyQuery,
            id,
            Bytes::new(),
        )));
    }

    fn on_ack(&mut self, id: Identifier) {
        self.push(FrameEvent::Frame(Frame::new(FrameKind::Ack, id, Bytes::new())));
    }

    fn on_nak(&mut self, id: Identifier) {
        self.push(FrameEvent::Frame(Frame::new(FrameKind::Nak, id, Bytes::new())));
    }

    fn on_framing_error(&mut self, discarded: Bytes) {
        self.push(FrameEvent::FramingError(discarded));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Soh,
    Id,
    Stx,
    LengthOfLength,
    Length,
    Payload,
    Error,
}

/// Incremental frame parser.
///
/// Chunks may split frames anywhere; parser state carries over between calls
/// to [`read`](Self::read). Feeding a stream whole or in pieces produces the
/// same events.
///
/// On malformed input the reader looks for a restart point: an SOH byte that
/// directly follows ACK, NAK or EOT inside the broken frame. If one exists the
/// bytes before it are reported as discarded and parsing resumes there.
/// Otherwise the rest of the chunk is discarded and the next chunk starts
/// fresh.
pub struct FrameReader {
    state: State,
    id: [u8; ID_LEN],
    id_pos: usize,
    length: usize,
    length_bytes_left: usize,
    scratch: Vec<u8>,
    max_payload_size: usize,
    error_reason: &'static str,
}

impl FrameReader {
    /// Create a reader with default configuration.
    pub fn new() -> Self {
        Self::with_config(&FrameConfig::default())
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            state: State::Soh,
            id: [0; ID_LEN],
            id_pos: 0,
            length: 0,
            length_bytes_left: 0,
            scratch: Vec::with_capacity(config.read_buffer_size),
            max_payload_size: config.max_payload_size,
            error_reason: "",
        }
    }

    /// Current scratch capacity.
    pub fn capacity(&self) -> usize {
        self.scratch.capacity()
    }

    /// Whether the reader sits between frames.
    pub fn is_idle(&self) -> bool {
        self.state == State::Soh
    }

    /// Drop any partially parsed frame.
    pub fn reset(&mut self) {
        self.state = State::Soh;
        self.id_pos = 0;
        self.scratch.clear();
    }

    /// Consume one chunk, reporting every completed frame to `handler`.
    pub fn read(&mut self, data: &[u8], handler: &mut impl FrameHandler) {
        // Start of the frame being parsed, relative to this chunk.
        let mut frame_start = 0usize;
        let mut restart: Option<usize> = None;
        let mut i = 0usize;

        while i < data.len() {
            let byte = data[i];

            if self.state != State::Soh
                && restart.is_none()
                && i > frame_start
                && byte == SOH
                && is_restart_anchor(data[i - 1])
            {
                restart = Some(i);
            }

            match self.state {
                State::Soh => {
                    if byte == SOH {
                        frame_start = i;
                        restart = None;
                        self.id_pos = 0;
                        self.state = State::Id;
                    } else {
                        self.fail("expected SOH");
                        continue;
                    }
                }
                State::Id => {
                    self.id[self.id_pos] = byte;
                    self.id_pos += 1;
                    if self.id_pos == ID_LEN {
                        self.state = State::Stx;
                    }
                }
                State::Stx => match byte {
                    STX => self.state = State::LengthOfLength,
                    ACK | NAK => {
                        let id = Identifier::from_bytes(self.id);
                        if byte == ACK {
                            handler.on_ack(id);
                        } else {
                            handler.on_nak(id);
                        }
                        self.state = State::Soh;
                        frame_start = i + 1;
                    }
                    _ => {
                        self.fail("expected STX, ACK or NAK");
                        continue;
                    }
                },
                State::LengthOfLength => {
                    if byte < LENGTH_FLAG {
                        if !self.begin_payload(byte as usize) {
                            continue;
                        }
                    } else {
                        let k = (byte & !LENGTH_FLAG) as usize;
                        if k == 0 || k > MAX_LENGTH_BYTES {
                            self.fail("invalid length-of-length");
                            continue;
                        }
                        self.length = 0;
                        self.length_bytes_left = k;
                        self.state = State::Length;
                    }
                }
                State::Length => {
                    self.length = (self.length << 8) | byte as usize;
                    self.length_bytes_left -= 1;
                    if self.length_bytes_left == 0 && !self.begin_payload(self.length) {
                        continue;
                    }
                }
                State::Payload => {
                    let missing = self.length - self.scratch.len();
                    if missing > 0 {
                        let end = i + missing.min(data.len() - i);
                        if restart.is_none() {
                            restart = (i.max(frame_start + 1)..end).find(|&j| {
                                data[j] == SOH && is_restart_anchor(data[j - 1])
                            });
                        }
                        self.scratch.extend_from_slice(&data[i..end]);
                        i = end;
                        continue;
                    }

                    let payload_len = self.scratch.len();
                    match FrameKind::from_terminator(byte, payload_len) {
                        Some(kind) => {
                            self.dispatch(kind, handler);
                            self.state = State::Soh;
                            frame_start = i + 1;
                        }
                        None => {
                            self.fail("invalid terminator");
                            continue;
                        }
                    }
                }
                State::Error => {
                    if let Some(at) = restart.take().filter(|&at| at > frame_start) {
                        self.discard(&data[frame_start..at], handler);
                        self.state = State::Soh;
                        frame_start = at;
                        i = at;
                        continue;
                    }
                }
            }

            i += 1;
        }

        if self.state == State::Error {
            self.discard(&data[frame_start..], handler);
            self.state = State::Soh;
        }
    }

    /// Enter the payload state, or fail when the declared length is too big.
    fn begin_payload(&mut self, length: usize) -> bool {
        if length > self.max_payload_size {
            self.fail("declared length exceeds maximum payload size");
            return false;
        }
        self.length = length;
        self.scratch.clear();
        if length > self.scratch.capacity() {
            // Grown only as payload bytes arrive; the header alone is not trusted.
            debug!(
                declared = length,
                capacity = self.scratch.capacity(),
                "payload exceeds read buffer"
            );
        }
        self.state = State::Payload;
        true
    }

    fn dispatch(&mut self, kind: FrameKind, handler: &mut impl FrameHandler) {
        let id = Identifier::from_bytes(self.id);
        trace!(%id, %kind, size = self.scratch.len(), "frame decoded");
        match kind {
            FrameKind::Message => handler.on_message(id, Bytes::copy_from_slice(&self.scratch)),
            FrameKind::Reply => handler.on_reply(id, Bytes::copy_from_slice(&self.scratch)),
            FrameKind::MessageQuery => handler.on_message_query(id),
            FrameKind::ReplyQuery => handler.on_reply_query(id),
            FrameKind::Ack => handler.on_ack(id),
            FrameKind::Nak => handler.on_nak(id),
        }
        self.scratch.clear();
    }

    fn fail(&mut self, reason: &'static str) {
        self.error_reason = reason;
        self.state = State::Error;
    }

    fn discard(&mut self, bytes: &[u8], handler: &mut impl FrameHandler) {
        debug!(
            reason = self.error_reason,
            discarded = bytes.len(),
            "framing error"
        );
        self.scratch.clear();
        self.id_pos = 0;
        handler.on_framing_error(Bytes::copy_from_slice(bytes));
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EOT, ETX};
    use crate::writer::FrameWriter;

    fn encode(frames: &[Frame]) -> Vec<u8> {
        let total: usize = frames.iter().map(Frame::wire_size).sum();
        let mut writer = FrameWriter::with_capacity(total);
        for frame in frames {
            writer
                .write_frame(frame.kind, &frame.id, &frame.payload)
                .unwrap();
        }
        writer.flush().to_vec()
    }

    fn read_all(chunks: &[&[u8]]) -> Vec<FrameEvent> {
        let mut reader = FrameReader::with_config(&FrameConfig {
            read_buffer_size: 64,
            ..FrameConfig::default()
        });
        let mut events = Vec::new();
        for chunk in chunks {
            reader.read(chunk, &mut events);
        }
        events
    }

    fn frames(events: &[FrameEvent]) -> Vec<Frame> {
        events
            .iter()
            .filter_map(|event| match event {
                FrameEvent::Frame(frame) => Some(frame.clone()),
                FrameEvent::FramingError(_) => None,
            })
            .collect()
    }

    // Error-path tests use fixed ids so no id byte pair looks like a restart point.
    fn fixed_id(fill: u8) -> Identifier {
        Identifier::from_bytes([fill; ID_LEN])
    }

    fn sample_stream() -> (Vec<Frame>, Vec<u8>) {
        let frames = vec![
            Frame::new(FrameKind::Message, Identifier::new(), "hello"),
            Frame::new(FrameKind::Ack, Identifier::new(), Bytes::new()),
            Frame::new(FrameKind::Reply, Identifier::new(), vec![SOH; 200]),
            Frame::new(FrameKind::MessageQuery, Identifier::new(), Bytes::new()),
            Frame::new(FrameKind::Nak, Identifier::new(), Bytes::new()),
            Frame::new(FrameKind::ReplyQuery, Identifier::new(), Bytes::new()),
        ];
        let wire = encode(&frames);
        (frames, wire)
    }

    #[test]
    fn decodes_every_length_boundary() {
        for len in [0usize, 1, 127, 128, 65535, 65536, 16_777_215, 16_777_216] {
            let id = Identifier::new();
            let payload: Vec<u8> = (0..len).map(|n| (n % 251) as u8).collect();
            let kind = if len == 0 {
                FrameKind::MessageQuery
            } else {
                FrameKind::Message
            };
            let wire = encode(&[Frame::new(kind, id, payload.clone())]);

            let events = read_all(&[&wire]);
            assert_eq!(events.len(), 1, "len {len}");
            assert_eq!(
                events[0],
                FrameEvent::Frame(Frame::new(kind, id, payload)),
                "len {len}"
            );
        }
    }

    #[test]
    fn split_chunks_match_whole_stream() {
        let (expected, wire) = sample_stream();
        let whole = read_all(&[&wire]);
        assert_eq!(frames(&whole), expected);

        for split in [1usize, 2, 3, 7, 17, 18, 19, 64] {
            let chunks: Vec<&[u8]> = wire.chunks(split).collect();
            assert_eq!(read_all(&chunks), whole, "chunk size {split}");
        }

        for cut in 0..wire.len() {
            let (left, right) = wire.split_at(cut);
            assert_eq!(read_all(&[left, right]), whole, "cut at {cut}");
        }
    }

    #[test]
    fn ack_and_nak_have_no_payload_section() {
        let id = Identifier::new();
        let mut wire = vec![SOH];
        wire.extend_from_slice(id.as_bytes());
        wire.push(ACK);
        wire.push(SOH);
        wire.extend_from_slice(id.as_bytes());
        wire.push(NAK);

        let events = read_all(&[&wire]);
        assert_eq!(
            frames(&events),
            vec![
                Frame::new(FrameKind::Ack, id, Bytes::new()),
                Frame::new(FrameKind::Nak, id, Bytes::new()),
            ]
        );
    }

    #[test]
    fn two_and_four_byte_lengths_are_big_endian() {
        let id = Identifier::new();
        let mut wire = vec![SOH];
        wire.extend_from_slice(id.as_bytes());
        wire.extend_from_slice(&[STX, 0x82, 0x01, 0x02]);
        wire.extend(std::iter::repeat_n(0xAA, 0x0102));
        wire.push(EOT);

        let events = read_all(&[&wire]);
        assert_eq!(
            frames(&events),
            vec![Frame::new(FrameKind::Reply, id, vec![0xAA; 0x0102])]
        );

        let mut wire = vec![SOH];
        wire.extend_from_slice(id.as_bytes());
        wire.extend_from_slice(&[STX, 0x84, 0x00, 0x00, 0x01, 0x00]);
        wire.extend(std::iter::repeat_n(0x55, 0x0100));
        wire.push(ETX);

        let events = read_all(&[&wire]);
        assert_eq!(
            frames(&events),
            vec![Frame::new(FrameKind::Message, id, vec![0x55; 0x0100])]
        );
    }

    #[test]
    fn invalid_length_of_length_is_framing_error() {
        for bad in [0x80u8, 0x85, 0xFF] {
            let mut wire = vec![SOH];
            wire.extend_from_slice(fixed_id(0x42).as_bytes());
            wire.extend_from_slice(&[STX, bad, 0x00]);

            let events = read_all(&[&wire]);
            assert_eq!(
                events,
                vec![FrameEvent::FramingError(Bytes::from(wire.clone()))],
                "length byte 0x{bad:02x}"
            );
        }
    }

    #[test]
    fn bad_terminator_discards_chunk_and_recovers_next_chunk() {
        let id = fixed_id(0x42);
        let mut broken = vec![SOH];
        broken.extend_from_slice(id.as_bytes());
        broken.extend_from_slice(&[STX, 2, b'h', b'i', 0x7F]);

        let good = encode(&[Frame::new(FrameKind::Message, id, "ok")]);
        let events = read_all(&[&broken, &good]);

        assert_eq!(
            events,
            vec![
                FrameEvent::FramingError(Bytes::from(broken.clone())),
                FrameEvent::Frame(Frame::new(FrameKind::Message, id, "ok")),
            ]
        );
    }

    #[test]
    fn resyncs_on_soh_after_terminator() {
        let id = fixed_id(0x42);
        let mut wire = b"zz".to_vec();
        wire.push(ACK);
        let good = encode(&[Frame::new(FrameKind::Message, id, "after garbage")]);
        wire.extend_from_slice(&good);

        let events = read_all(&[&wire]);
        assert_eq!(
            events,
            vec![
                FrameEvent::FramingError(Bytes::from_static(&[b'z', b'z', ACK])),
                FrameEvent::Frame(Frame::new(FrameKind::Message, id, "after garbage")),
            ]
        );
    }

    #[test]
    fn resyncs_inside_overlong_payload() {
        // The declared length swallows the next frame; its terminator never
        // lines up, so the reader restarts at the embedded SOH that follows
        // the ACK frame's last byte.
        let first = fixed_id(0x42);
        let second = fixed_id(0x43);
        let mut wire = vec![SOH];
        wire.extend_from_slice(first.as_bytes());
        wire.extend_from_slice(&[STX, 3, b'a', ACK]);
        let ack = encode(&[Frame::new(FrameKind::Ack, second, Bytes::new())]);
        let discarded_len = wire.len();
        wire.extend_from_slice(&ack);

        let events = read_all(&[&wire]);
        assert_eq!(
            events,
            vec![
                FrameEvent::FramingError(Bytes::copy_from_slice(&wire[..discarded_len])),
                FrameEvent::Frame(Frame::new(FrameKind::Ack, second, Bytes::new())),
            ]
        );
    }

    #[test]
    fn soh_inside_payload_is_not_a_restart_point() {
        let id = Identifier::new();
        let payload = vec![b'x', SOH, b'y', SOH, SOH];
        let wire = encode(&[Frame::new(FrameKind::Reply, id, payload.clone())]);

        let events = read_all(&[&wire]);
        assert_eq!(
            events,
            vec![FrameEvent::Frame(Frame::new(FrameKind::Reply, id, payload))]
        );
    }

    #[test]
    fn declared_length_over_limit_is_framing_error() {
        let mut reader = FrameReader::with_config(&FrameConfig {
            max_payload_size: 16,
            read_buffer_size: 16,
            ..FrameConfig::default()
        });
        let mut wire = vec![SOH];
        wire.extend_from_slice(fixed_id(0x42).as_bytes());
        wire.extend_from_slice(&[STX, 17]);

        let mut events = Vec::new();
        reader.read(&wire, &mut events);
        assert_eq!(events, vec![FrameEvent::FramingError(Bytes::from(wire))]);
        assert!(reader.is_idle());
    }

    #[test]
    fn scratch_grows_for_large_declared_length() {
        let mut reader = FrameReader::with_config(&FrameConfig {
            read_buffer_size: 8,
            ..FrameConfig::default()
        });
        let id = Identifier::new();
        let wire = encode(&[Frame::new(FrameKind::Message, id, vec![7u8; 4096])]);

        let mut events = Vec::new();
        reader.read(&wire, &mut events);
        assert!(reader.capacity() >= 4096);
        assert_eq!(frames(&events).len(), 1);
    }

    #[test]
    fn declared_length_alone_does_not_allocate() {
        let mut reader = FrameReader::with_config(&FrameConfig {
            read_buffer_size: 64,
            ..FrameConfig::default()
        });
        let mut wire = vec![SOH];
        wire.extend_from_slice(fixed_id(0x17).as_bytes());
        // 1 GiB declared, 32 bytes delivered.
        wire.extend_from_slice(&[STX, 0x84, 0x40, 0x00, 0x00, 0x00]);
        wire.extend_from_slice(&[9u8; 32]);

        let mut events = Vec::new();
        reader.read(&wire, &mut events);
        assert!(events.is_empty());
        assert!(!reader.is_idle());
        assert!(reader.capacity() < 4096, "capacity {}", reader.capacity());
    }

    #[test]
    fn handler_defaults_ignore_events() {
        struct AckCounter(usize);
        impl FrameHandler for AckCounter {
            fn on_ack(&mut self, _id: Identifier) {
                self.0 += 1;
            }
        }

        let (_, wire) = sample_stream();
        let mut counter = AckCounter(0);
        FrameReader::new().read(&wire, &mut counter);
        assert_eq!(counter.0, 1);
    }
}
