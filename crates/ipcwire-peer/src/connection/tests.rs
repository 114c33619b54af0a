use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ipcwire_frame::{Frame, FrameEvent, FrameKind, FrameReader, FrameWriter, Identifier};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::*;
use crate::config::{ConnectionConfig, ProtocolConfig};
use crate::error::PeerError;
use crate::responder::{HandlerError, Reply};

/// Speaks the wire protocol by hand against a [`Connection`].
struct RawPeer {
    stream: DuplexStream,
    reader: FrameReader,
    writer: FrameWriter,
    events: VecDeque<FrameEvent>,
}

impl RawPeer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            reader: FrameReader::new(),
            writer: FrameWriter::with_capacity(64 * 1024),
            events: VecDeque::new(),
        }
    }

    async fn send(&mut self, kind: FrameKind, id: Identifier, payload: &[u8]) {
        self.writer
            .write_frame(kind, &id, payload)
            .expect("frame should encode");
        let bytes = self.writer.flush();
        self.stream
            .write_all(&bytes)
            .await
            .expect("write should succeed");
    }

    async fn next_frame(&mut self) -> Frame {
        loop {
            if let Some(event) = self.events.pop_front() {
                match event {
                    FrameEvent::Frame(frame) => return frame,
                    FrameEvent::FramingError(bytes) => panic!("unexpected framing error: {bytes:?}"),
                }
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.expect("read should succeed");
            assert!(n > 0, "connection closed the stream");
            let mut events = Vec::new();
            self.reader.read(&buf[..n], &mut events);
            self.events.extend(events);
        }
    }

    async fn expect_frame(&mut self, kind: FrameKind, id: Identifier) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!((frame.kind, frame.id), (kind, id), "unexpected frame");
        frame
    }

    async fn expect_eof(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn pair(config: ConnectionConfig) -> (Connection, RawPeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    (Connection::from_stream(local, config), RawPeer::new(remote))
}

fn fast_retries(max_retries: Option<u32>, retry_with_query: bool) -> ConnectionConfig {
    ConnectionConfig {
        protocol: ProtocolConfig {
            ack_timeout_ms: 100,
            reply_timeout_ms: 300,
            max_retries,
            retry_with_query,
            ..ProtocolConfig::default()
        },
        ..ConnectionConfig::default()
    }
}

fn counting_handler(
    connection: &Connection,
    reply: Option<&'static [u8]>,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    connection.set_message_handler(move |_payload, responder| {
        seen.fetch_add(1, Ordering::SeqCst);
        match reply {
            Some(payload) => responder.reply(Bytes::from_static(payload)),
            None => responder.ack(),
        };
        Ok(())
    });
    calls
}

fn collect_errors(connection: &Connection) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    connection.set_error_handler(move |source, err| {
        assert!(matches!(source, ErrorSource::Connection(_)));
        sink.lock().unwrap().push(err.to_string());
    });
    errors
}

#[tokio::test]
async fn request_resolves_with_reply_after_ack_callback() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Connection::from_stream(a, ConnectionConfig::default());
    let server = Connection::from_stream(b, ConnectionConfig::default());
    server.set_message_handler(|payload, responder| {
        let mut reply = payload.to_vec();
        reply.extend_from_slice(b" REPLY");
        responder.reply(reply);
        Ok(())
    });

    let order = Arc::new(Mutex::new(Vec::new()));
    let acked = Arc::clone(&order);
    let reply = client
        .send_request("REQUEST_SYNC", move || acked.lock().unwrap().push("ack"))
        .await
        .expect("request should succeed");
    order.lock().unwrap().push("resolved");

    assert_eq!(reply, Bytes::from_static(b"REQUEST_SYNC REPLY"));
    assert_eq!(*order.lock().unwrap(), ["ack", "resolved"]);
}

#[tokio::test]
async fn message_resolves_on_ack() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let send = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("MESSAGE").await }
    });

    let frame = peer.next_frame().await;
    assert_eq!(frame.kind, FrameKind::Message);
    assert_eq!(frame.payload, Bytes::from_static(b"MESSAGE"));
    peer.send(FrameKind::Ack, frame.id, &[]).await;

    send.await.unwrap().expect("message should be acked");
}

#[tokio::test]
async fn bare_respond_sends_only_an_ack() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let calls = counting_handler(&server, None);

    let first = Identifier::new();
    peer.send(FrameKind::Message, first, b"MESSAGE").await;
    peer.expect_frame(FrameKind::Ack, first).await;

    // Nothing else was written in between.
    let second = Identifier::new();
    peer.send(FrameKind::Message, second, b"MESSAGE").await;
    peer.expect_frame(FrameKind::Ack, second).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn duplicate_message_replays_ack() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let calls = counting_handler(&server, None);

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"once").await;
    peer.expect_frame(FrameKind::Ack, id).await;
    peer.send(FrameKind::Message, id, b"once").await;
    peer.expect_frame(FrameKind::Ack, id).await;
    peer.send(FrameKind::MessageQuery, id, &[]).await;
    peer.expect_frame(FrameKind::Ack, id).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_request_replays_reply_once_acked() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let calls = counting_handler(&server, Some(b"pong"));

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"ping").await;
    let reply = peer.expect_frame(FrameKind::Reply, id).await;
    assert_eq!(reply.payload, Bytes::from_static(b"pong"));

    // Still waiting for our Ack of the reply: duplicate is dropped.
    peer.send(FrameKind::Message, id, b"ping").await;
    peer.send(FrameKind::Ack, id, &[]).await;

    peer.send(FrameKind::Message, id, b"ping").await;
    let replayed = peer.expect_frame(FrameKind::Reply, id).await;
    assert_eq!(replayed.payload, Bytes::from_static(b"pong"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsolicited_reply_is_reported_and_naked() {
    let (connection, mut peer) = pair(ConnectionConfig::default());
    let errors = collect_errors(&connection);

    let id = Identifier::new();
    peer.send(FrameKind::Reply, id, b"who asked").await;
    peer.expect_frame(FrameKind::Nak, id).await;

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("unsolicited reply"), "{}", errors[0]);
}

#[tokio::test]
async fn unsolicited_ack_is_not_reported_when_disabled() {
    let mut config = ConnectionConfig::default();
    config.protocol.throw_on_unsolicited_response = false;
    let (connection, mut peer) = pair(config);
    let errors = collect_errors(&connection);
    let _calls = counting_handler(&connection, None);

    peer.send(FrameKind::Ack, Identifier::new(), &[]).await;
    let probe = Identifier::new();
    peer.send(FrameKind::Message, probe, b"probe").await;
    peer.expect_frame(FrameKind::Ack, probe).await;

    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reply_query_for_answered_request_is_acked() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let request = tokio::spawn({
        let client = client.clone();
        async move { client.request("question").await }
    });

    let frame = peer.next_frame().await;
    peer.send(FrameKind::Reply, frame.id, b"answer").await;
    peer.expect_frame(FrameKind::Ack, frame.id).await;
    assert_eq!(
        request.await.unwrap().unwrap(),
        Bytes::from_static(b"answer")
    );

    peer.send(FrameKind::ReplyQuery, frame.id, &[]).await;
    peer.expect_frame(FrameKind::Ack, frame.id).await;
    // A retransmitted reply is acked again without surfacing twice.
    peer.send(FrameKind::Reply, frame.id, b"answer").await;
    peer.expect_frame(FrameKind::Ack, frame.id).await;
}

#[tokio::test]
async fn message_query_for_unknown_id_is_naked() {
    let (_connection, mut peer) = pair(ConnectionConfig::default());
    let id = Identifier::new();
    peer.send(FrameKind::MessageQuery, id, &[]).await;
    peer.expect_frame(FrameKind::Nak, id).await;
}

#[tokio::test]
async fn nak_rejects_pending_message() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let send = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("refuse me").await }
    });

    let frame = peer.next_frame().await;
    peer.send(FrameKind::Nak, frame.id, &[]).await;
    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, PeerError::Rejected { id } if id == frame.id));
}

#[tokio::test(start_paused = true)]
async fn unanswered_message_retries_then_times_out() {
    let (client, mut peer) = pair(fast_retries(Some(2), false));
    let send = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("hello?").await }
    });

    let first = peer.next_frame().await;
    for _ in 0..3 {
        let retry = peer.expect_frame(FrameKind::Message, first.id).await;
        assert_eq!(retry.payload, Bytes::from_static(b"hello?"));
    }

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, PeerError::TimedOut { retries: 3, .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn query_retries_carry_no_payload() {
    let (client, mut peer) = pair(fast_retries(Some(0), true));
    let send = tokio::spawn({
        let client = client.clone();
        async move { client.request("slow").await }
    });

    let first = peer.next_frame().await;
    assert_eq!(first.kind, FrameKind::Message);
    let retry = peer.expect_frame(FrameKind::MessageQuery, first.id).await;
    assert!(retry.payload.is_empty());

    assert!(matches!(
        send.await.unwrap(),
        Err(PeerError::TimedOut { retries: 1, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn acked_request_retries_after_reply_timeout() {
    let (client, mut peer) = pair(fast_retries(None, false));
    let request = tokio::spawn({
        let client = client.clone();
        async move { client.request("work").await }
    });

    let frame = peer.next_frame().await;
    peer.send(FrameKind::Ack, frame.id, &[]).await;
    let started = tokio::time::Instant::now();
    peer.expect_frame(FrameKind::Message, frame.id).await;
    assert!(started.elapsed() >= Duration::from_millis(300));

    peer.send(FrameKind::Reply, frame.id, b"done").await;
    assert_eq!(request.await.unwrap().unwrap(), Bytes::from_static(b"done"));
}

#[tokio::test(start_paused = true)]
async fn completed_entries_are_evicted_after_expiry() {
    let config = ConnectionConfig {
        gc_interval_ms: 100,
        gc_expiry_ms: 1_000,
        ..ConnectionConfig::default()
    };
    let (server, mut peer) = pair(config);
    let calls = counting_handler(&server, None);

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"remember me").await;
    peer.expect_frame(FrameKind::Ack, id).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    peer.send(FrameKind::Message, id, b"remember me").await;
    peer.expect_frame(FrameKind::Ack, id).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    peer.send(FrameKind::Message, id, b"remember me").await;
    peer.expect_frame(FrameKind::Ack, id).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn deferred_reply_sends_ack_then_reply() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.set_message_handler(move |payload, responder| {
        let delivery = responder.respond(Reply::deferred(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut reply = payload.to_vec();
            reply.extend_from_slice(b" REPLY");
            Ok(Bytes::from(reply))
        }));
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(delivery.await.is_ok());
        });
        Ok(())
    });

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"REQUEST_ASYNC").await;
    peer.expect_frame(FrameKind::Ack, id).await;
    let reply = peer.expect_frame(FrameKind::Reply, id).await;
    assert_eq!(reply.payload, Bytes::from_static(b"REQUEST_ASYNC REPLY"));
    peer.send(FrameKind::Ack, id, &[]).await;

    assert_eq!(rx.recv().await, Some(true));
}

#[tokio::test]
async fn failed_deferred_reply_sends_ack_then_nak() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.set_message_handler(move |_payload, responder| {
        let delivery = responder.respond(Reply::deferred(async {
            Err::<Bytes, HandlerError>("backend unavailable".into())
        }));
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(delivery.await);
        });
        Ok(())
    });

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"REQUEST_FAIL").await;
    peer.expect_frame(FrameKind::Ack, id).await;
    peer.expect_frame(FrameKind::Nak, id).await;

    let outcome = rx.recv().await.expect("delivery should resolve");
    assert!(matches!(outcome, Err(PeerError::Handler(msg)) if msg == "backend unavailable"));

    // The recorded outcome is now Nak.
    peer.send(FrameKind::Message, id, b"REQUEST_FAIL").await;
    peer.expect_frame(FrameKind::Nak, id).await;
}

#[tokio::test]
async fn handler_error_naks_and_replays_nak() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    server.set_message_handler(move |_payload, _responder| {
        seen.fetch_add(1, Ordering::SeqCst);
        Err("bad input".into())
    });

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"garbage").await;
    peer.expect_frame(FrameKind::Nak, id).await;
    peer.send(FrameKind::Message, id, b"garbage").await;
    peer.expect_frame(FrameKind::Nak, id).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_respond_after_handler_error_is_refused() {
    let (server, mut peer) = pair(ConnectionConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.set_message_handler(move |_payload, responder| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(responder.reply("too late").await);
        });
        Err("failed first".into())
    });

    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"x").await;
    peer.expect_frame(FrameKind::Nak, id).await;
    let outcome = rx.recv().await.expect("delivery should resolve");
    assert!(matches!(outcome, Err(PeerError::AlreadyResponded { .. })));
}

#[tokio::test]
async fn missing_handler_naks() {
    let (_connection, mut peer) = pair(ConnectionConfig::default());
    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"anyone?").await;
    peer.expect_frame(FrameKind::Nak, id).await;
}

#[tokio::test]
async fn framing_errors_are_reported() {
    let (connection, mut peer) = pair(ConnectionConfig::default());
    let errors = collect_errors(&connection);
    let _calls = counting_handler(&connection, None);

    // Noise ending in EOT, so the next SOH is a restart point.
    peer.stream.write_all(&[0xAA, 0xBB, 0x04]).await.unwrap();
    let id = Identifier::new();
    peer.send(FrameKind::Message, id, b"after noise").await;
    peer.expect_frame(FrameKind::Ack, id).await;

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("framing error"), "{}", errors[0]);
}

#[tokio::test]
async fn empty_payloads_are_rejected() {
    let (client, _peer) = pair(ConnectionConfig::default());
    assert!(matches!(
        client.send_message(Bytes::new()).await,
        Err(PeerError::EmptyPayload)
    ));
    assert!(matches!(
        client.request(Vec::<u8>::new()).await,
        Err(PeerError::EmptyPayload)
    ));
}

#[tokio::test]
async fn oversized_payload_is_refused() {
    let config = ConnectionConfig {
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (client, _peer) = pair(config);
    let err = client.send_message("nine bytes").await.unwrap_err();
    assert!(matches!(err, PeerError::Frame(_)), "{err}");
}

#[tokio::test]
async fn large_payload_outgrows_write_buffer() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let payload = Bytes::from(vec![0x5Au8; 10_000]);
    let send = tokio::spawn({
        let client = client.clone();
        let payload = payload.clone();
        async move { client.send_message(payload).await }
    });

    let frame = peer.next_frame().await;
    assert_eq!(frame.payload, payload);
    peer.send(FrameKind::Ack, frame.id, &[]).await;
    send.await.unwrap().unwrap();
}

#[tokio::test]
async fn close_drains_then_destroys() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let send = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("last words").await }
    });
    let frame = peer.next_frame().await;
    peer.send(FrameKind::Ack, frame.id, &[]).await;
    send.await.unwrap().unwrap();

    client.close().await.expect("close should drain");
    assert_eq!(client.state(), ConnectionState::Destroyed);
    peer.expect_eof().await;

    assert!(client.send_message("too late").await.is_err());
    client.close().await.expect("closing twice is fine");
}

#[tokio::test]
async fn closing_connection_refuses_new_sends() {
    let config = ConnectionConfig {
        drain_timeout_ms: 60_000,
        ..ConnectionConfig::default()
    };
    let (client, mut peer) = pair(config);
    let pending_send = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("in flight").await }
    });
    let frame = peer.next_frame().await;

    let closing = tokio::spawn({
        let client = client.clone();
        async move { client.close().await }
    });
    let mut state = client.state.clone();
    state
        .wait_for(|state| *state == ConnectionState::Closing)
        .await
        .unwrap();
    assert!(matches!(
        client.send_message("new").await,
        Err(PeerError::Closing)
    ));

    peer.send(FrameKind::Ack, frame.id, &[]).await;
    pending_send.await.unwrap().unwrap();
    closing.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Destroyed);
}

#[tokio::test(start_paused = true)]
async fn close_rejects_unanswered_request() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let request = tokio::spawn({
        let client = client.clone();
        async move { client.request("never answered").await }
    });
    peer.next_frame().await;

    client.close().await.expect("close should not wait on the peer");
    assert!(matches!(
        request.await.unwrap(),
        Err(PeerError::Disconnected(_))
    ));
    assert_eq!(client.state(), ConnectionState::Destroyed);
    peer.expect_eof().await;
}

#[tokio::test]
async fn simultaneous_large_sends_complete_both_ways() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let left = Connection::from_stream(left, ConnectionConfig::default());
    let right = Connection::from_stream(right, ConnectionConfig::default());
    let left_calls = counting_handler(&left, None);
    let right_calls = counting_handler(&right, None);

    let payload = Bytes::from(vec![0xA5u8; 1024 * 1024]);
    let (from_left, from_right) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(
            left.send_message(payload.clone()),
            right.send_message(payload.clone())
        )
    })
    .await
    .expect("sends should not stall on a full stream");

    from_left.expect("left send should be acked");
    from_right.expect("right send should be acked");
    assert_eq!(left_calls.load(Ordering::SeqCst), 1);
    assert_eq!(right_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn peer_disconnect_rejects_pending_requests() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    let request = tokio::spawn({
        let client = client.clone();
        async move { client.request("are you there").await }
    });
    peer.next_frame().await;
    drop(peer);

    client.closed().await;
    assert_eq!(client.state(), ConnectionState::Destroyed);
    assert!(matches!(
        request.await.unwrap(),
        Err(PeerError::Disconnected(_))
    ));
}

#[tokio::test]
async fn dropping_every_handle_closes_the_connection() {
    let (client, mut peer) = pair(ConnectionConfig::default());
    drop(client);
    peer.expect_eof().await;
}

#[tokio::test]
async fn idle_connection_refuses_sends() {
    let connection = Connection::new(ConnectionConfig::default());
    assert_eq!(connection.state(), ConnectionState::Idle);
    assert!(matches!(
        connection.send_message("nowhere").await,
        Err(PeerError::NotConnected)
    ));
}

#[tokio::test]
async fn connect_to_missing_socket_fails_and_stays_idle() {
    let connection = Connection::new(ConnectionConfig::default());
    let path = std::env::temp_dir().join(format!("ipcwire-missing-{}.sock", std::process::id()));
    let err = connection.connect(&path).await.unwrap_err();
    assert!(matches!(err, PeerError::Transport(_)), "{err}");
    assert_eq!(connection.state(), ConnectionState::Idle);
}
