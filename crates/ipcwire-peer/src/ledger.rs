//! Per-message state kept by a connection.
//!
//! [`SentMessage`] tracks one outbound frame until it is acknowledged,
//! rejected, answered or given up on. [`ReceivedMessage`] remembers the
//! outcome produced for one inbound identifier so a retransmitted duplicate
//! can be answered without running the handler again.
//!
//! Timers are deadlines on the entry. Every transition takes the current
//! instant, and the owning connection calls [`SentMessage::on_deadline`] once
//! a deadline passes.

use std::fmt;

use bytes::Bytes;
use ipcwire_frame::{FrameKind, Identifier};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::ProtocolConfig;
use crate::error::{PeerError, Result};

/// Called once when a request is first acknowledged.
pub type AckCallback = Box<dyn FnOnce() + Send>;

/// Completion channel of a sent message. Messages and replies resolve with an
/// empty payload; requests resolve with the reply.
pub(crate) type Outcome = oneshot::Sender<Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Fire-and-forget; complete once acked.
    Message,
    /// Awaits a Reply after the Ack.
    Request,
    /// Our answer to a peer's request; complete once acked.
    Reply,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Message => "message",
            MessageKind::Request => "request",
            MessageKind::Reply => "reply",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentState {
    New,
    Sent,
    Acked,
    Naked,
    Replied,
    TimedOut,
    Errored,
}

/// What a passed deadline asks the connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Nothing due yet.
    Pending,
    /// Retransmit using this frame kind.
    Retry(FrameKind),
    /// Retries exhausted; the entry is now `TimedOut`.
    TimedOut,
}

/// One outbound frame and its completion.
pub struct SentMessage {
    id: Identifier,
    payload: Bytes,
    kind: MessageKind,
    state: SentState,
    retries: u32,
    last_modified: Instant,
    deadline: Option<Instant>,
    reply: Option<Bytes>,
    on_ack: Option<AckCallback>,
    outcome: Option<Outcome>,
}

impl SentMessage {
    pub fn new(id: Identifier, payload: Bytes, kind: MessageKind, now: Instant) -> Self {
        Self {
            id,
            payload,
            kind,
            state: SentState::New,
            retries: 0,
            last_modified: now,
            deadline: None,
            reply: None,
            on_ack: None,
            outcome: None,
        }
    }

    pub(crate) fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_ack_callback(mut self, on_ack: AckCallback) -> Self {
        self.on_ack = Some(on_ack);
        self
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn state(&self) -> SentState {
        self.state
    }

    /// Retransmissions so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_modified(&self) -> Instant {
        self.last_modified
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reply payload, once one arrived.
    pub fn reply(&self) -> Option<&Bytes> {
        self.reply.as_ref()
    }

    /// Whether no further frame can change this entry.
    ///
    /// An acked request is still waiting for its reply.
    pub fn is_complete(&self) -> bool {
        match self.state {
            SentState::Naked | SentState::TimedOut | SentState::Errored | SentState::Replied => {
                true
            }
            SentState::Acked => self.kind != MessageKind::Request,
            SentState::New | SentState::Sent => false,
        }
    }

    /// The frame has been handed to the transport. Arms the ack timer.
    pub fn sent(&mut self, now: Instant, config: &ProtocolConfig) -> bool {
        if self.state != SentState::New {
            return false;
        }
        self.state = SentState::Sent;
        self.touch(now);
        self.deadline = Some(now + config.ack_timeout());
        true
    }

    /// Apply an inbound Ack. Only the first Ack after sending counts.
    pub fn ack(&mut self, now: Instant, config: &ProtocolConfig) -> bool {
        if self.state != SentState::Sent {
            return false;
        }
        self.state = SentState::Acked;
        self.touch(now);
        self.fire_ack_callback();
        if self.kind == MessageKind::Request {
            self.deadline = Some(now + config.reply_timeout());
        } else {
            self.deadline = None;
            self.resolve(Ok(Bytes::new()));
        }
        true
    }

    /// Apply an inbound Nak.
    pub fn nak(&mut self, now: Instant) -> bool {
        let rejectable = match self.state {
            SentState::Sent => true,
            SentState::Acked => self.kind == MessageKind::Request,
            _ => false,
        };
        if !rejectable {
            return false;
        }
        self.state = SentState::Naked;
        self.touch(now);
        self.deadline = None;
        self.resolve(Err(PeerError::Rejected { id: self.id }));
        true
    }

    /// Apply an inbound Reply.
    ///
    /// A reply implies the request was received, so an ack callback that has
    /// not fired yet fires first.
    pub fn reply_with(&mut self, payload: Bytes, now: Instant) -> bool {
        if self.is_complete() {
            return false;
        }
        self.fire_ack_callback();
        self.state = SentState::Replied;
        self.touch(now);
        self.deadline = None;
        self.reply = Some(payload.clone());
        self.resolve(Ok(payload));
        true
    }

    /// Give up on the entry with `error`.
    pub fn error(&mut self, error: PeerError, now: Instant) -> bool {
        if self.is_complete() {
            return false;
        }
        self.state = SentState::Errored;
        self.touch(now);
        self.deadline = None;
        self.resolve(Err(error));
        true
    }

    /// Advance the timer.
    ///
    /// With `max_retries = N` the entry is retransmitted N + 1 times before
    /// it times out.
    pub fn on_deadline(&mut self, now: Instant, config: &ProtocolConfig) -> Deadline {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Deadline::Pending,
        }

        let within_limit = config.max_retries.is_none_or(|max| self.retries <= max);
        if !within_limit {
            self.state = SentState::TimedOut;
            self.touch(now);
            self.deadline = None;
            self.resolve(Err(PeerError::TimedOut {
                id: self.id,
                retries: self.retries,
            }));
            return Deadline::TimedOut;
        }

        self.retries += 1;
        self.touch(now);
        let wait = if self.state == SentState::Acked {
            config.reply_timeout()
        } else {
            config.ack_timeout()
        };
        self.deadline = Some(now + wait);
        Deadline::Retry(self.retry_frame(config))
    }

    /// Frame used to retransmit this entry.
    pub fn retry_frame(&self, config: &ProtocolConfig) -> FrameKind {
        match (self.kind, config.retry_with_query) {
            (MessageKind::Reply, false) => FrameKind::Reply,
            (MessageKind::Reply, true) => FrameKind::ReplyQuery,
            (_, false) => FrameKind::Message,
            (_, true) => FrameKind::MessageQuery,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_modified = now;
    }

    fn fire_ack_callback(&mut self) {
        if let Some(on_ack) = self.on_ack.take() {
            on_ack();
        }
    }

    fn resolve(&mut self, result: Result<Bytes>) {
        if let Some(outcome) = self.outcome.take() {
            // The caller may have stopped waiting.
            let _ = outcome.send(result);
        }
    }
}

impl fmt::Debug for SentMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentMessage")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("size", &self.payload.len())
            .field("retries", &self.retries)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceivedState {
    /// Handed to the handler; no outcome yet.
    Received,
    Acked,
    Naked,
    Replied,
}

/// Outcome record for one inbound identifier.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    id: Identifier,
    state: ReceivedState,
    reply: Option<Bytes>,
    error: Option<String>,
    last_modified: Instant,
}

impl ReceivedMessage {
    pub fn new(id: Identifier, now: Instant) -> Self {
        Self {
            id,
            state: ReceivedState::Received,
            reply: None,
            error: None,
            last_modified: now,
        }
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn state(&self) -> ReceivedState {
        self.state
    }

    /// The reply payload to replay for duplicates.
    pub fn reply(&self) -> Option<&Bytes> {
        self.reply.as_ref()
    }

    /// Handler error text, if the handler failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn last_modified(&self) -> Instant {
        self.last_modified
    }

    pub fn is_complete(&self) -> bool {
        self.state != ReceivedState::Received
    }

    pub fn ack(&mut self, now: Instant) {
        self.set(ReceivedState::Acked, now);
    }

    pub fn nak(&mut self, now: Instant) {
        self.set(ReceivedState::Naked, now);
    }

    pub fn replied(&mut self, payload: Bytes, now: Instant) {
        self.reply = Some(payload);
        self.set(ReceivedState::Replied, now);
    }

    /// Keep the handler error and settle on Nak.
    pub fn record_error(&mut self, error: impl Into<String>, now: Instant) {
        self.error = Some(error.into());
        self.set(ReceivedState::Naked, now);
    }

    fn set(&mut self, state: ReceivedState, now: Instant) {
        self.state = state;
        self.last_modified = now;
    }
}
