//! The task that owns one connection.
//!
//! Everything that touches the codec or the ledger happens here, one event
//! at a time. The loop polls, in priority order: handle commands, results of
//! deferred replies, the transport, the earliest retry deadline, a pending
//! reconnect and the ledger sweep.
//!
//! Encoded frames are queued to a separate writer task, so a peer that is
//! slow to read never stops this loop from reading.

use std::collections::HashMap;
use std::future::pending;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ipcwire_frame::{
    encoded_len, FrameConfig, FrameError, FrameEvent, FrameKind, FrameReader, FrameWriter,
    Identifier,
};
use ipcwire_transport::{TransportError, UnixDomainSocket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{Command, ConnectionState};
use crate::config::ConnectionConfig;
use crate::error::{PeerError, Result};
use crate::ledger::{
    AckCallback, Deadline, MessageKind, Outcome, ReceivedMessage, ReceivedState, SentMessage,
};
use crate::responder::{ErrorHandler, ErrorSource, MessageHandler, Reply, Responder};

const READ_CHUNK: usize = 64 * 1024;

struct Transport {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    frames: mpsc::UnboundedSender<Bytes>,
    write_failed: oneshot::Receiver<io::Error>,
}

/// Result of a `Reply::Deferred` computation, posted back by its task.
struct DeferredDone {
    id: Identifier,
    result: std::result::Result<Bytes, String>,
    delivery: Outcome,
}

struct Draining {
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

pub(crate) struct Actor {
    id: Identifier,
    config: Arc<ConnectionConfig>,
    commands: mpsc::UnboundedReceiver<Command>,
    weak_commands: mpsc::WeakUnboundedSender<Command>,
    handles_gone: bool,
    deferred_tx: mpsc::UnboundedSender<DeferredDone>,
    deferred_rx: mpsc::UnboundedReceiver<DeferredDone>,
    state: watch::Sender<ConnectionState>,

    transport: Option<Transport>,
    chunk: BytesMut,
    reader: FrameReader,
    writer: FrameWriter,

    messages: HashMap<Identifier, SentMessage>,
    requests: HashMap<Identifier, SentMessage>,
    replies: HashMap<Identifier, SentMessage>,
    received: HashMap<Identifier, ReceivedMessage>,

    message_handler: Option<MessageHandler>,
    error_handler: Option<ErrorHandler>,

    target: Option<PathBuf>,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    gc: Option<Interval>,
    draining: Option<Draining>,
}

impl Actor {
    pub(crate) fn new(
        id: Identifier,
        config: Arc<ConnectionConfig>,
        commands: mpsc::UnboundedReceiver<Command>,
        weak_commands: mpsc::WeakUnboundedSender<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let frame_config = config.frame_config();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        Self {
            id,
            commands,
            weak_commands,
            handles_gone: false,
            deferred_tx,
            deferred_rx,
            state,
            transport: None,
            chunk: BytesMut::with_capacity(READ_CHUNK),
            reader: FrameReader::with_config(&frame_config),
            writer: FrameWriter::with_config(&frame_config),
            messages: HashMap::new(),
            requests: HashMap::new(),
            replies: HashMap::new(),
            received: HashMap::new(),
            message_handler: None,
            error_handler: None,
            target: None,
            reconnect_attempts: 0,
            reconnect_at: None,
            gc: None,
            draining: None,
            config,
        }
    }

    pub(crate) fn set_handlers(
        &mut self,
        message_handler: Option<MessageHandler>,
        error_handler: Option<ErrorHandler>,
    ) {
        self.message_handler = message_handler;
        self.error_handler = error_handler;
    }

    /// Take ownership of a connected stream, start its writer task and the
    /// ledger sweep.
    pub(crate) fn install<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frames, queued) = mpsc::unbounded_channel();
        let (failed, write_failed) = oneshot::channel();
        tokio::spawn(
            write_frames(writer, queued, failed)
                .instrument(debug_span!("writer", connection = %self.id)),
        );
        self.transport = Some(Transport {
            reader: Box::new(reader),
            frames,
            write_failed,
        });
        self.reader.reset();
        if self.gc.is_none() {
            self.gc = Some(sweep_interval(self.config.gc_interval()));
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(state = %self.current_state(), "connection task started");
        while self.current_state() != ConnectionState::Destroyed {
            let deadline = self.next_deadline();
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                biased;
                command = self.commands.recv(), if !self.handles_gone => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all handles dropped; closing");
                        self.handles_gone = true;
                        self.begin_close(None);
                    }
                },
                Some(done) = self.deferred_rx.recv() => self.on_deferred(done),
                read = next_input(&mut self.transport, &mut self.chunk) => self.on_read(read),
                _ = sleep_until(deadline) => self.on_deadlines(),
                _ = sleep_until(reconnect_at) => self.reconnect().await,
                _ = tick(&mut self.gc) => self.sweep(),
            }
        }
        debug!("connection task finished");
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "state changed");
        }
    }

    fn report(&self, error: PeerError) {
        match &self.error_handler {
            Some(handler) => handler(ErrorSource::Connection(self.id), &error),
            None => warn!(error = %error, "unhandled connection error"),
        }
    }

    // ---- commands ------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        trace!(?command, "command");
        match command {
            Command::Connect {
                path,
                timeout,
                done,
            } => {
                let result = self.on_connect(path, timeout).await;
                let _ = done.send(result);
            }
            Command::Send {
                kind,
                payload,
                on_ack,
                outcome,
            } => self.on_send(kind, payload, on_ack, outcome),
            Command::Respond {
                id,
                reply,
                delivery,
            } => self.on_respond(id, reply, delivery),
            Command::SetMessageHandler(handler) => self.message_handler = Some(handler),
            Command::SetErrorHandler(handler) => self.error_handler = Some(handler),
            Command::Close { done } => self.begin_close(Some(done)),
        }
    }

    async fn on_connect(&mut self, path: PathBuf, timeout: Duration) -> Result<()> {
        match self.current_state() {
            ConnectionState::Idle => {}
            ConnectionState::Connecting if self.transport.is_none() => {}
            ConnectionState::Connecting | ConnectionState::Connected => {
                return Err(PeerError::AlreadyConnected)
            }
            ConnectionState::Closing => return Err(PeerError::Closing),
            ConnectionState::Destroyed => {
                return Err(PeerError::Disconnected("connection destroyed".to_string()))
            }
        }

        // No budget, no dial: an already-listening socket would accept
        // before a zero-length timer could fire.
        if timeout.is_zero() {
            return Err(PeerError::ConnectTimeout(timeout));
        }

        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.target = Some(path.clone());
        self.set_state(ConnectionState::Connecting);

        match time::timeout(timeout, UnixDomainSocket::connect(&path)).await {
            Ok(Ok(stream)) => {
                self.install(stream);
                self.set_state(ConnectionState::Connected);
                info!(?path, "connected");
                Ok(())
            }
            Ok(Err(err)) => {
                self.set_state(ConnectionState::Idle);
                Err(err.into())
            }
            Err(_) => {
                self.set_state(ConnectionState::Idle);
                Err(PeerError::ConnectTimeout(timeout))
            }
        }
    }

    fn on_send(
        &mut self,
        kind: MessageKind,
        payload: Bytes,
        on_ack: Option<AckCallback>,
        outcome: Outcome,
    ) {
        let refused = match self.current_state() {
            ConnectionState::Connected | ConnectionState::Connecting => None,
            ConnectionState::Idle => Some(PeerError::NotConnected),
            ConnectionState::Closing => Some(PeerError::Closing),
            ConnectionState::Destroyed => {
                Some(PeerError::Disconnected("connection destroyed".to_string()))
            }
        };
        if let Some(err) = refused {
            let _ = outcome.send(Err(err));
            return;
        }
        if payload.len() > self.config.max_payload_size {
            let _ = outcome.send(Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            }
            .into()));
            return;
        }

        let id = Identifier::new();
        let mut entry =
            SentMessage::new(id, payload.clone(), kind, Instant::now()).with_outcome(outcome);
        if let Some(on_ack) = on_ack {
            entry = entry.with_ack_callback(on_ack);
        }
        debug!(%id, %kind, bytes = payload.len(), "sending");
        match kind {
            MessageKind::Request => self.requests.insert(id, entry),
            _ => self.messages.insert(id, entry),
        };

        self.transmit(FrameKind::Message, id, &payload);
        self.mark_sent(id);
    }

    fn on_respond(&mut self, id: Identifier, reply: Reply, delivery: Outcome) {
        let state = match self.received.get(&id) {
            Some(record) => record.state(),
            None => {
                let _ = delivery.send(Err(PeerError::Expired { id }));
                return;
            }
        };
        if state != ReceivedState::Received {
            let _ = delivery.send(Err(PeerError::AlreadyResponded { id }));
            return;
        }

        match reply {
            Reply::Immediate(payload) if !payload.is_empty() => {
                self.send_reply(id, payload, delivery);
            }
            Reply::None | Reply::Immediate(_) => {
                let written = self.send_ack(id);
                let _ = delivery.send(if written {
                    Ok(Bytes::new())
                } else {
                    Err(PeerError::NotConnected)
                });
            }
            Reply::Deferred(future) => {
                self.send_ack(id);
                let done = self.deferred_tx.clone();
                tokio::spawn(async move {
                    let result = future.await.map_err(|err| err.to_string());
                    let _ = done.send(DeferredDone {
                        id,
                        result,
                        delivery,
                    });
                });
            }
        }
    }

    fn on_deferred(&mut self, done: DeferredDone) {
        let DeferredDone {
            id,
            result,
            delivery,
        } = done;
        match result {
            Ok(payload) if !payload.is_empty() => self.send_reply(id, payload, delivery),
            Ok(_) => {
                let _ = delivery.send(Ok(Bytes::new()));
            }
            Err(message) => {
                warn!(%id, error = %message, "deferred reply failed");
                self.transmit(FrameKind::Nak, id, &[]);
                if let Some(record) = self.received.get_mut(&id) {
                    record.record_error(message.clone(), Instant::now());
                }
                let _ = delivery.send(Err(PeerError::Handler(message)));
            }
        }
    }

    /// Write an Ack for an inbound message and record it.
    fn send_ack(&mut self, id: Identifier) -> bool {
        let written = self.transmit(FrameKind::Ack, id, &[]);
        if let Some(record) = self.received.get_mut(&id) {
            record.ack(Instant::now());
        }
        written
    }

    fn send_reply(&mut self, id: Identifier, payload: Bytes, delivery: Outcome) {
        let entry = SentMessage::new(id, payload.clone(), MessageKind::Reply, Instant::now())
            .with_outcome(delivery);
        self.replies.insert(id, entry);
        debug!(%id, bytes = payload.len(), "replying");
        self.transmit(FrameKind::Reply, id, &payload);
        self.mark_sent(id);
    }

    fn mark_sent(&mut self, id: Identifier) {
        let now = Instant::now();
        let protocol = &self.config.protocol;
        let entry = self
            .messages
            .get_mut(&id)
            .or_else(|| self.requests.get_mut(&id))
            .or_else(|| self.replies.get_mut(&id));
        if let Some(entry) = entry {
            entry.sent(now, protocol);
        }
    }

    // ---- inbound -------------------------------------------------------

    fn on_read(&mut self, read: io::Result<usize>) {
        match read {
            Ok(0) => {
                debug!("peer closed the stream");
                self.transport_lost(TransportError::Closed);
            }
            Ok(n) => {
                trace!(bytes = n, "read");
                let mut events = Vec::new();
                self.reader.read(&self.chunk, &mut events);
                self.chunk.clear();
                for event in events {
                    self.dispatch(event);
                }
            }
            Err(err) => self.transport_lost(TransportError::Io(err)),
        }
    }

    fn dispatch(&mut self, event: FrameEvent) {
        let frame = match event {
            FrameEvent::Frame(frame) => frame,
            FrameEvent::FramingError(discarded) => {
                warn!(bytes = discarded.len(), "discarded malformed input");
                self.report(PeerError::Framing { discarded });
                return;
            }
        };
        trace!(id = %frame.id, kind = %frame.kind, bytes = frame.payload.len(), "frame");
        match frame.kind {
            FrameKind::Message => self.on_message(frame.id, frame.payload),
            FrameKind::MessageQuery => self.on_message_query(frame.id),
            FrameKind::Reply => self.on_reply(frame.id, frame.payload),
            FrameKind::ReplyQuery => self.on_reply_query(frame.id),
            FrameKind::Ack => self.on_ack(frame.id),
            FrameKind::Nak => self.on_nak(frame.id),
        }
    }

    fn on_message(&mut self, id: Identifier, payload: Bytes) {
        if self.received.contains_key(&id) {
            self.replay(id);
            return;
        }

        let now = Instant::now();
        let mut record = ReceivedMessage::new(id, now);

        let commands = match self.weak_commands.upgrade() {
            Some(commands) if self.draining.is_none() => commands,
            _ => {
                debug!(%id, "closing; rejecting message");
                record.nak(now);
                self.received.insert(id, record);
                self.transmit(FrameKind::Nak, id, &[]);
                return;
            }
        };
        let Some(handler) = self.message_handler.clone() else {
            warn!(%id, "no message handler installed; rejecting message");
            record.record_error(PeerError::NoMessageHandler.to_string(), now);
            self.received.insert(id, record);
            self.transmit(FrameKind::Nak, id, &[]);
            return;
        };

        self.received.insert(id, record);
        if let Err(err) = handler(payload, Responder::new(id, commands)) {
            warn!(%id, error = %err, "message handler failed");
            if let Some(record) = self.received.get_mut(&id) {
                record.record_error(err.to_string(), Instant::now());
            }
            self.transmit(FrameKind::Nak, id, &[]);
        }
    }

    fn on_message_query(&mut self, id: Identifier) {
        if self.received.contains_key(&id) {
            self.replay(id);
        } else {
            debug!(%id, "query for unknown message");
            self.transmit(FrameKind::Nak, id, &[]);
        }
    }

    /// Answer a duplicate with the outcome already produced for it.
    fn replay(&mut self, id: Identifier) {
        let Some((state, reply)) = self
            .received
            .get(&id)
            .map(|record| (record.state(), record.reply().cloned()))
        else {
            return;
        };
        match state {
            ReceivedState::Received => trace!(%id, "duplicate of pending message dropped"),
            ReceivedState::Acked => {
                self.transmit(FrameKind::Ack, id, &[]);
            }
            ReceivedState::Naked => {
                self.transmit(FrameKind::Nak, id, &[]);
            }
            ReceivedState::Replied => {
                let payload = reply.unwrap_or_default();
                self.transmit(FrameKind::Reply, id, &payload);
            }
        }
    }

    fn on_reply(&mut self, id: Identifier, payload: Bytes) {
        let known = match self.requests.get_mut(&id) {
            Some(request) => {
                if !request.reply_with(payload, Instant::now()) {
                    trace!(%id, "duplicate reply");
                }
                true
            }
            None => false,
        };
        if known {
            self.transmit(FrameKind::Ack, id, &[]);
        } else {
            self.unsolicited(FrameKind::Reply, id);
            self.transmit(FrameKind::Nak, id, &[]);
        }
    }

    fn on_reply_query(&mut self, id: Identifier) {
        let answered = self
            .requests
            .get(&id)
            .is_some_and(|request| request.reply().is_some());
        if answered {
            self.transmit(FrameKind::Ack, id, &[]);
        } else {
            self.unsolicited(FrameKind::ReplyQuery, id);
            self.transmit(FrameKind::Nak, id, &[]);
        }
    }

    fn on_ack(&mut self, id: Identifier) {
        let now = Instant::now();
        let protocol = &self.config.protocol;
        if let Some(entry) = self.messages.get_mut(&id) {
            entry.ack(now, protocol);
        } else if let Some(entry) = self.requests.get_mut(&id) {
            entry.ack(now, protocol);
        } else if let Some(entry) = self.replies.get_mut(&id) {
            if entry.ack(now, protocol) {
                let payload = entry.payload().clone();
                if let Some(record) = self.received.get_mut(&id) {
                    record.replied(payload, now);
                }
            }
        } else {
            self.unsolicited(FrameKind::Ack, id);
        }
    }

    fn on_nak(&mut self, id: Identifier) {
        let now = Instant::now();
        if let Some(entry) = self.messages.get_mut(&id) {
            entry.nak(now);
        } else if let Some(entry) = self.requests.get_mut(&id) {
            entry.nak(now);
        } else if let Some(entry) = self.replies.get_mut(&id) {
            if entry.nak(now) {
                if let Some(record) = self.received.get_mut(&id) {
                    record.nak(now);
                }
            }
        } else {
            self.unsolicited(FrameKind::Nak, id);
        }
    }

    fn unsolicited(&self, kind: FrameKind, id: Identifier) {
        warn!(%id, %kind, "unsolicited response");
        if self.config.protocol.throw_on_unsolicited_response {
            self.report(PeerError::Unsolicited { kind, id });
        }
    }

    // ---- output --------------------------------------------------------

    /// Encode one frame and queue it for the writer task. Returns whether a
    /// live transport took it.
    fn transmit(&mut self, kind: FrameKind, id: Identifier, payload: &[u8]) -> bool {
        let Some(transport) = self.transport.as_ref() else {
            trace!(%id, %kind, "no transport; frame not written");
            return false;
        };
        let frame_config = self.config.frame_config();
        let bytes = match encode(&mut self.writer, &frame_config, kind, &id, payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%id, %kind, error = %err, "failed to encode frame");
                self.report(err.into());
                return false;
            }
        };
        let size = bytes.len();
        if transport.frames.send(bytes).is_err() {
            // The failure itself arrives through `next_input`.
            trace!(%id, %kind, "writer stopped; frame not written");
            return false;
        }
        trace!(%id, %kind, bytes = size, "queued frame");
        true
    }

    // ---- timers --------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        self.messages
            .values()
            .chain(self.requests.values())
            .chain(self.replies.values())
            .filter_map(SentMessage::deadline)
            .min()
    }

    fn on_deadlines(&mut self) {
        let now = Instant::now();
        let protocol = &self.config.protocol;
        let mut retries = Vec::new();
        for cache in [&mut self.messages, &mut self.requests, &mut self.replies] {
            for entry in cache.values_mut() {
                match entry.on_deadline(now, protocol) {
                    Deadline::Retry(kind) => {
                        let payload = if kind.is_query() {
                            Bytes::new()
                        } else {
                            entry.payload().clone()
                        };
                        retries.push((kind, entry.id(), entry.retries(), payload));
                    }
                    Deadline::TimedOut => {
                        warn!(id = %entry.id(), kind = %entry.kind(), retries = entry.retries(), "message timed out");
                    }
                    Deadline::Pending => {}
                }
            }
        }
        for (kind, id, attempt, payload) in retries {
            debug!(%id, %kind, attempt, "retrying");
            self.transmit(kind, id, &payload);
        }
    }

    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        let Some(path) = self.target.clone() else {
            return;
        };
        self.reconnect_attempts += 1;
        let timeout = self.config.connect_timeout();
        match time::timeout(timeout, UnixDomainSocket::connect(&path)).await {
            Ok(Ok(stream)) => {
                self.install(stream);
                self.set_state(ConnectionState::Connected);
                info!(?path, attempt = self.reconnect_attempts, "reconnected");
            }
            Ok(Err(err)) => self.transport_lost(err),
            Err(_) => {
                let err = io::Error::new(io::ErrorKind::TimedOut, "reconnect timed out");
                self.transport_lost(TransportError::Io(err));
            }
        }
    }

    fn transport_lost(&mut self, error: TransportError) {
        self.transport = None;
        self.reader.reset();

        if matches!(error, TransportError::Closed) {
            debug!("transport closed");
        } else {
            warn!(error = %error, "transport failed");
            self.report(PeerError::Transport(error));
        }

        if self.draining.is_some() {
            self.destroy("transport closed while draining");
            return;
        }
        let outbound = self.target.is_some();
        if outbound && self.reconnect_attempts < self.config.max_reconnect_attempts {
            let delay = self.config.reconnect_delay(self.reconnect_attempts);
            info!(attempt = self.reconnect_attempts + 1, ?delay, "scheduling reconnect");
            self.reconnect_at = Some(Instant::now() + delay);
            self.set_state(ConnectionState::Connecting);
        } else {
            self.destroy("transport lost");
        }
    }

    // ---- sweep and shutdown -------------------------------------------

    /// Evict idle ledger entries. While closing, every entry is evicted on
    /// each drain tick and the connection is destroyed once nothing is left.
    fn sweep(&mut self) {
        let now = Instant::now();
        let draining = self.draining.is_some();
        let expiry = if draining {
            Duration::ZERO
        } else {
            self.config.gc_expiry()
        };

        let evicted = sweep_sent(&mut self.messages, now, expiry)
            + sweep_sent(&mut self.requests, now, expiry)
            + sweep_sent(&mut self.replies, now, expiry)
            + sweep_received(&mut self.received, now, expiry);
        if evicted > 0 {
            debug!(evicted, draining, "swept ledger");
        }

        if draining && self.is_drained() {
            self.destroy("connection closed");
        }
    }

    fn is_drained(&self) -> bool {
        self.messages.is_empty()
            && self.requests.is_empty()
            && self.replies.is_empty()
            && self.received.is_empty()
    }

    fn begin_close(&mut self, done: Option<oneshot::Sender<Result<()>>>) {
        if let Some(draining) = self.draining.as_mut() {
            draining.waiters.extend(done);
            return;
        }
        self.draining = Some(Draining {
            waiters: done.into_iter().collect(),
        });

        if self.transport.is_none() {
            self.destroy("closed without a transport");
            return;
        }
        info!("closing; draining ledger");
        self.reconnect_at = None;
        self.set_state(ConnectionState::Closing);
        self.gc = Some(sweep_interval(self.config.drain_interval()));
    }

    /// Drop the transport, fail everything still in flight and end the task.
    fn destroy(&mut self, reason: &str) {
        // The writer task flushes what is queued, then shuts the stream down.
        self.transport = None;
        let now = Instant::now();
        for cache in [&mut self.messages, &mut self.requests, &mut self.replies] {
            for (_, mut entry) in cache.drain() {
                entry.error(PeerError::Disconnected(reason.to_string()), now);
            }
        }
        self.received.clear();
        self.gc = None;
        self.reconnect_at = None;
        self.reader.reset();
        info!(reason, "connection destroyed");
        self.set_state(ConnectionState::Destroyed);

        if let Some(draining) = self.draining.take() {
            for waiter in draining.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }
}

/// Encode one frame, falling back to a one-off writer when the frame does
/// not fit the connection's buffer.
fn encode(
    writer: &mut FrameWriter,
    config: &FrameConfig,
    kind: FrameKind,
    id: &Identifier,
    payload: &[u8],
) -> std::result::Result<Bytes, FrameError> {
    match writer.write_frame(kind, id, payload) {
        Ok(_) => Ok(writer.flush()),
        Err(FrameError::BufferFull { .. }) => {
            let mut larger = FrameWriter::with_config(&FrameConfig {
                write_buffer_size: encoded_len(kind, payload.len()),
                ..config.clone()
            });
            larger.write_frame(kind, id, payload)?;
            Ok(larger.flush())
        }
        Err(err) => Err(err),
    }
}

fn sweep_sent(
    cache: &mut HashMap<Identifier, SentMessage>,
    now: Instant,
    expiry: Duration,
) -> usize {
    let before = cache.len();
    cache.retain(|_, entry| {
        if now.saturating_duration_since(entry.last_modified()) < expiry {
            return true;
        }
        if !entry.is_complete() {
            let reason = if expiry.is_zero() {
                "connection closed before a response arrived".to_string()
            } else {
                format!("evicted after {expiry:?} idle")
            };
            entry.error(PeerError::Disconnected(reason), now);
        }
        false
    });
    before - cache.len()
}

fn sweep_received(
    cache: &mut HashMap<Identifier, ReceivedMessage>,
    now: Instant,
    expiry: Duration,
) -> usize {
    let before = cache.len();
    cache.retain(|_, record| now.saturating_duration_since(record.last_modified()) < expiry);
    before - cache.len()
}

/// First tick one period from now.
fn sweep_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Drains queued frames onto the stream, then shuts its write side down.
async fn write_frames<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    failed: oneshot::Sender<io::Error>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = frames.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            let _ = failed.send(err);
            return;
        }
        trace!(bytes = bytes.len(), "wrote frame");
    }
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "transport shutdown failed");
    }
}

/// Next chunk from the transport. A failed write surfaces here as an error.
async fn next_input(transport: &mut Option<Transport>, chunk: &mut BytesMut) -> io::Result<usize> {
    let Some(transport) = transport else {
        return pending().await;
    };
    tokio::select! {
        read = transport.reader.read_buf(chunk) => read,
        Ok(err) = &mut transport.write_failed => Err(err),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
