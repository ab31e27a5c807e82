//! End-to-end tests of the client connection against a scripted peer

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use bus_protocol::core::message::MessageFlags;
use bus_protocol::{BusError, Connection, Message, MessageType, SignalFilter, Value};
use common::{accept_auth, connect_pair, read_line, test_config, FakePeer, GUID};
use futures::StreamExt;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

fn call_to(member: &str) -> Message {
    Message::method_call("/org/example/Obj", member)
        .unwrap()
        .with_interface("org.example.Iface")
        .unwrap()
        .with_destination("org.example.Service")
        .unwrap()
}

#[tokio::test]
async fn test_hello_records_unique_name() {
    let (conn, mut peer) = connect_pair(&test_config()).await;
    assert_eq!(conn.server_guid(), GUID);
    assert_eq!(conn.unique_name(), None);

    let client = conn.clone();
    let hello = tokio::spawn(async move { client.hello().await });

    let call = peer.recv().await;
    assert_eq!(call.member.as_deref(), Some("Hello"));
    assert_eq!(call.destination.as_deref(), Some("org.freedesktop.DBus"));
    assert_eq!(call.interface.as_deref(), Some("org.freedesktop.DBus"));
    assert_eq!(call.serial, 1);
    peer.reply(&call, vec![":1.42".into()]).await;

    assert_eq!(hello.await.unwrap().unwrap(), ":1.42");
    assert_eq!(conn.unique_name(), Some(":1.42"));
    // Already registered: answered locally
    assert_eq!(conn.hello().await.unwrap(), ":1.42");
}

#[tokio::test]
async fn test_call_returns_reply_body() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let client = conn.clone();
    let call = tokio::spawn(async move {
        client
            .call(
                Some("org.example.Service"),
                "/org/example/Obj",
                Some("org.example.Iface"),
                "Add",
                vec![Value::Int32(2), Value::Int32(3)],
                None,
            )
            .await
    });

    let request = peer.recv().await;
    assert_eq!(request.body, vec![Value::Int32(2), Value::Int32(3)]);
    assert_eq!(request.signature.as_str(), "ii");
    peer.reply(&request, vec![Value::Int32(5)]).await;

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert_eq!(reply.body, vec![Value::Int32(5)]);
    assert_eq!(conn.metrics().snapshot().calls_completed, 1);
}

#[tokio::test]
async fn test_error_reply_becomes_remote_error() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let client = conn.clone();
    let call = tokio::spawn(async move { client.call_message(call_to("Fail"), None).await });

    let request = peer.recv().await;
    peer.reply_error(&request, "org.example.Error.Nope", "not today")
        .await;

    match call.await.unwrap() {
        Err(BusError::Remote { name, message }) => {
            assert_eq!(name, "org.example.Error.Nope");
            assert_eq!(message, "not today");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(conn.metrics().snapshot().remote_errors, 1);
}

#[tokio::test]
async fn test_send_then_await_reply() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let serial = conn.send(call_to("Get")).await.unwrap();
    let request = peer.recv().await;
    assert_eq!(request.serial, serial);
    peer.reply(&request, vec!["value".into()]).await;

    let reply = conn
        .await_reply(serial, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.reply_serial, Some(serial));
    assert_eq!(reply.body[0].as_str(), Some("value"));

    // The slot is gone once claimed
    assert!(conn.await_reply(serial, Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn test_reply_read_before_await_reply_is_kept() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let serial = conn.send(call_to("Quick")).await.unwrap();
    let request = peer.recv().await;
    peer.reply(&request, vec![Value::UInt32(7)]).await;
    // Give the receive loop time to read the reply before anyone waits for it
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply = conn
        .await_reply(serial, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply.reply_serial, Some(serial));
    assert_eq!(reply.body, vec![Value::UInt32(7)]);
    assert_eq!(conn.metrics().snapshot().replies_discarded, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fast_replies_on_multi_thread_runtime() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let answer = tokio::spawn(async move {
        for _ in 0..20 {
            let request = peer.recv().await;
            peer.reply(&request, vec![]).await;
        }
    });
    for _ in 0..20 {
        let pending = conn.send_call(call_to("Echo")).await.unwrap();
        pending.wait(Some(Duration::from_secs(5))).await.unwrap();
    }
    answer.await.unwrap();
    assert_eq!(conn.metrics().snapshot().replies_discarded, 0);
}

#[tokio::test]
async fn test_await_reply_timeout_outlasts_call_timeout() {
    let mut config = test_config();
    config.client.call_timeout = Duration::from_millis(50);
    let (conn, mut peer) = connect_pair(&config).await;

    let serial = conn.send(call_to("Slow")).await.unwrap();
    let client = conn.clone();
    let waiter = tokio::spawn(async move {
        client.await_reply(serial, Duration::from_secs(5)).await
    });

    let request = peer.recv().await;
    // Several sweeps pass the configured call timeout before the answer
    tokio::time::sleep(Duration::from_millis(200)).await;
    peer.reply(&request, vec![Value::Bool(true)]).await;

    let reply = waiter.await.unwrap().unwrap();
    assert_eq!(reply.body, vec![Value::Bool(true)]);
    assert_eq!(conn.metrics().snapshot().calls_timed_out, 0);
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_discarded() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let client = conn.clone();
    let slow = tokio::spawn(async move {
        client
            .call_message(call_to("Slow"), Some(Duration::from_millis(50)))
            .await
    });
    let request = peer.recv().await;
    assert!(matches!(slow.await.unwrap(), Err(BusError::Timeout)));

    // Late reply, then a normal exchange to prove the connection survived
    peer.reply(&request, vec![]).await;
    let client = conn.clone();
    let next = tokio::spawn(async move { client.call_message(call_to("Fast"), None).await });
    let request = peer.recv().await;
    peer.reply(&request, vec![Value::Bool(true)]).await;

    assert_eq!(next.await.unwrap().unwrap().body, vec![Value::Bool(true)]);
    let snapshot = conn.metrics().snapshot();
    assert_eq!(snapshot.calls_timed_out, 1);
    assert_eq!(snapshot.replies_discarded, 1);
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let pending = conn.send_call(call_to("Hang")).await.unwrap();
    let cancel = pending.cancel_handle();
    let waiter = tokio::spawn(pending.wait(Some(Duration::from_secs(30))));

    peer.recv().await;
    assert!(cancel.cancel());
    assert!(matches!(waiter.await.unwrap(), Err(BusError::Cancelled)));
    assert!(!cancel.cancel());
    assert_eq!(conn.metrics().snapshot().calls_cancelled, 1);
}

#[tokio::test]
async fn test_dropped_pending_reply_discards_late_reply() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let pending = conn.send_call(call_to("Ignored")).await.unwrap();
    let request = peer.recv().await;
    drop(pending);
    peer.reply(&request, vec![]).await;

    // Round trip another call so the late reply has certainly been read
    let client = conn.clone();
    let next = tokio::spawn(async move { client.call_message(call_to("Next"), None).await });
    let request = peer.recv().await;
    peer.reply(&request, vec![]).await;
    next.await.unwrap().unwrap();

    assert_eq!(conn.metrics().snapshot().replies_discarded, 1);
}

#[tokio::test]
async fn test_signals_delivered_in_order_to_matching_subscriptions() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.subscribe(
        SignalFilter::new().interface("org.example.Feed").unwrap(),
        move |signal| {
            let _ = tx.send(signal.body[0].as_u32().unwrap());
        },
    )
    .unwrap();
    let (_handle, mut stream) = conn
        .subscribe_stream(SignalFilter::new().member("Other").unwrap())
        .unwrap();

    for i in 0..5u32 {
        let signal = Message::signal("/feed", "org.example.Feed", "Item")
            .unwrap()
            .with_body(vec![i.into()])
            .unwrap();
        peer.send(signal).await;
    }
    peer.send(Message::signal("/feed", "org.example.Misc", "Other").unwrap())
        .await;

    for expected in 0..5u32 {
        assert_eq!(rx.recv().await, Some(expected));
    }
    let other = stream.next().await.unwrap();
    assert_eq!(other.interface.as_deref(), Some("org.example.Misc"));
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let (handle, mut stream) = conn.subscribe_stream(SignalFilter::new()).unwrap();
    peer.send(Message::signal("/a", "org.example.A", "One").unwrap())
        .await;
    assert_eq!(
        stream.next().await.unwrap().member.as_deref(),
        Some("One")
    );

    assert!(conn.unsubscribe(handle));
    assert!(!conn.unsubscribe(handle));
    // Dropping the subscription closed the stream
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_add_match_sends_rule_to_bus() {
    let (conn, mut peer) = connect_pair(&test_config()).await;
    let filter = SignalFilter::new()
        .interface("org.example.Feed")
        .unwrap()
        .member("Item")
        .unwrap();

    let client = conn.clone();
    let rule_filter = filter.clone();
    let add = tokio::spawn(async move { client.add_match(&rule_filter).await });

    let request = peer.recv().await;
    assert_eq!(request.member.as_deref(), Some("AddMatch"));
    assert_eq!(
        request.body,
        vec![Value::from("type='signal',interface='org.example.Feed',member='Item'")]
    );
    peer.reply(&request, vec![]).await;
    add.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_emit_signal() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    conn.emit_signal("/org/example", "org.example.Events", "Changed", vec!["x".into()])
        .await
        .unwrap();

    let signal = peer.recv().await;
    assert_eq!(signal.message_type, MessageType::Signal);
    assert_eq!(signal.path.as_ref().map(|p| p.as_str()), Some("/org/example"));
    assert_eq!(signal.member.as_deref(), Some("Changed"));
    assert_eq!(signal.body, vec![Value::from("x")]);
}

#[tokio::test]
async fn test_registered_method_is_answered() {
    let (conn, mut peer) = connect_pair(&test_config()).await;
    conn.register_method("/org/example/Calc", "org.example.Calc", "Double", |call| {
        let n = call.body.first().and_then(Value::as_u32).unwrap_or(0);
        Ok(vec![Value::UInt32(n * 2)])
    })
    .unwrap();

    let mut request = Message::method_call("/org/example/Calc", "Double")
        .unwrap()
        .with_interface("org.example.Calc")
        .unwrap()
        .with_body(vec![Value::UInt32(21)])
        .unwrap();
    request.sender = Some(":1.1".into());
    let serial = peer.send(request).await;

    let reply = peer.recv().await;
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert_eq!(reply.reply_serial, Some(serial));
    assert_eq!(reply.destination.as_deref(), Some(":1.1"));
    assert_eq!(reply.body, vec![Value::UInt32(42)]);
}

#[tokio::test]
async fn test_unknown_methods_ignored_by_default() {
    let (_conn, mut peer) = connect_pair(&test_config()).await;

    peer.send(call_to("Missing")).await;
    let ping = Message::method_call("/", "Ping")
        .unwrap()
        .with_interface("org.freedesktop.DBus.Peer")
        .unwrap();
    let ping_serial = peer.send(ping).await;

    // The first thing back is the ping reply: the unknown call went unanswered
    let reply = peer.recv().await;
    assert_eq!(reply.reply_serial, Some(ping_serial));
}

#[tokio::test]
async fn test_unknown_methods_answered_when_configured() {
    let mut config = test_config();
    config.client.reply_unknown_methods = true;
    let (_conn, mut peer) = connect_pair(&config).await;

    let serial = peer.send(call_to("Missing")).await;
    let reply = peer.recv().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.reply_serial, Some(serial));
    assert_eq!(
        reply.error_name.as_deref(),
        Some("org.freedesktop.DBus.Error.UnknownMethod")
    );

    // NO_REPLY_EXPECTED is honoured even for errors
    peer.send(call_to("Missing").with_flags(MessageFlags::NO_REPLY_EXPECTED))
        .await;
    let serial = peer.send(call_to("Again")).await;
    assert_eq!(peer.recv().await.reply_serial, Some(serial));
}

#[tokio::test]
async fn test_close_resolves_pending_and_is_idempotent() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let pending = conn.send_call(call_to("Forever")).await.unwrap();
    peer.recv().await;

    let (first, second) = tokio::join!(conn.close(), conn.close());
    first.unwrap();
    second.unwrap();
    assert!(conn.is_closed());
    assert!(matches!(
        pending.wait(None).await,
        Err(BusError::ConnectionClosed)
    ));

    assert!(matches!(
        conn.send(call_to("After")).await,
        Err(BusError::ConnectionClosed)
    ));
    conn.close().await.unwrap();

    // The writer was shut down
    assert!(peer.try_recv().await.is_none());
}

#[tokio::test]
async fn test_panicking_signal_handler_closes_connection() {
    let (conn, mut peer) = connect_pair(&test_config()).await;
    conn.subscribe(SignalFilter::new(), |_| panic!("handler failed"))
        .unwrap();

    peer.send(Message::signal("/feed", "org.example.Feed", "Boom").unwrap())
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should close after the receive task dies");

    assert!(matches!(
        conn.call_message(call_to("After"), Some(Duration::from_millis(300)))
            .await,
        Err(BusError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_peer_hangup_closes_connection() {
    let (conn, mut peer) = connect_pair(&test_config()).await;

    let client = conn.clone();
    let call = tokio::spawn(async move { client.call_message(call_to("Gone"), None).await });
    peer.recv().await;
    drop(peer);

    assert!(matches!(
        call.await.unwrap(),
        Err(BusError::ConnectionClosed)
    ));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_rejected_handshake_sends_nothing_more() {
    let (client, mut server) = duplex(4096);

    let peer = tokio::spawn(async move {
        read_line(&mut server).await;
        server.write_all(b"REJECTED EXTERNAL\r\n").await.unwrap();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let err = Connection::from_stream(client, &test_config())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::HandshakeError(_)));
    assert!(peer.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_message_bundled_with_ok_line_is_processed() {
    let (client, mut server) = duplex(64 * 1024);

    let peer = tokio::spawn(async move {
        let auth = read_line(&mut server).await;
        assert!(auth.starts_with("\0AUTH ANONYMOUS"));

        let mut ping = Message::method_call("/", "Ping")
            .unwrap()
            .with_interface("org.freedesktop.DBus.Peer")
            .unwrap();
        ping.serial = 77;
        let mut out = format!("OK {GUID}\r\n").into_bytes();
        out.extend_from_slice(&ping.to_bytes().unwrap());
        server.write_all(&out).await.unwrap();

        assert_eq!(read_line(&mut server).await, "BEGIN");
        let mut peer = FakePeer::new(server);
        peer.recv().await
    });

    let _conn = Connection::from_stream(client, &test_config()).await.unwrap();

    let reply = peer.await.unwrap();
    assert_eq!(reply.reply_serial, Some(77));
}

#[tokio::test]
async fn test_handshake_counted_in_metrics() {
    let (client, mut server) = duplex(4096);
    let peer = tokio::spawn(async move {
        accept_auth(&mut server).await;
        server
    });
    let conn = Connection::from_stream(client, &test_config()).await.unwrap();
    let _server = peer.await.unwrap();

    let snapshot = conn.metrics().snapshot();
    assert_eq!(snapshot.handshakes_total, 1);
    assert_eq!(snapshot.handshakes_success, 1);
}

#[tokio::test]
async fn test_connect_over_tcp_sends_hello() {
    use bus_protocol::core::codec::MessageCodec;
    use futures::SinkExt;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let bus = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let mut line = String::new();
        socket.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("\0AUTH ANONYMOUS"));
        socket
            .get_mut()
            .write_all(format!("OK {GUID}\r\n").as_bytes())
            .await
            .unwrap();
        line.clear();
        socket.read_line(&mut line).await.unwrap();
        assert_eq!(line, "BEGIN\r\n");

        // Buffered bytes past BEGIN stay with the framer
        let mut framed = Framed::new(socket, MessageCodec::default());
        let hello = framed.next().await.unwrap().unwrap();
        assert_eq!(hello.member.as_deref(), Some("Hello"));
        let mut reply = Message::method_return(&hello)
            .with_body(vec![":1.7".into()])
            .unwrap();
        reply.serial = 1;
        framed.send(reply).await.unwrap();
        framed
    });

    let address = format!("tcp:host=127.0.0.1,port={port},guid={GUID}");
    let conn = Connection::connect(&address, &test_config()).await.unwrap();
    assert_eq!(conn.unique_name(), Some(":1.7"));
    assert_eq!(conn.server_guid(), GUID);

    let _framed = bus.await.unwrap();
    conn.close().await.unwrap();
}
