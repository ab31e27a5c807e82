//! Scripted bus peer for integration tests.
//!
//! Runs the server side of the handshake over an in-memory duplex stream and then
//! exchanges framed messages with the client under test.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use bus_protocol::core::codec::MessageCodec;
use bus_protocol::protocol::handshake::AuthMechanism;
use bus_protocol::{BusConfig, Connection, Message, Value};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

pub const GUID: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Defaults suitable for tests: ANONYMOUS auth works on every platform
pub fn test_config() -> BusConfig {
    BusConfig::default_with_overrides(|c| {
        c.client.auth_mechanism = AuthMechanism::Anonymous;
        c.client.pending_sweep_interval = Duration::from_millis(20);
    })
}

/// Read one CRLF-terminated line a byte at a time so nothing past it is consumed
pub async fn read_line(stream: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        let byte = stream.read_u8().await.expect("client hung up during auth");
        line.push(byte);
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).expect("auth line is ASCII")
}

/// Server half of a successful handshake
pub async fn accept_auth(server: &mut DuplexStream) {
    let auth = read_line(server).await;
    assert!(auth.starts_with("\0AUTH "), "unexpected auth line {auth:?}");
    server
        .write_all(format!("OK {GUID}\r\n").as_bytes())
        .await
        .unwrap();
    assert_eq!(read_line(server).await, "BEGIN");
}

pub struct FakePeer {
    framed: Framed<DuplexStream, MessageCodec>,
    next_serial: u32,
}

impl FakePeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec::default()),
            next_serial: 1000,
        }
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for the client")
            .expect("client closed the stream")
            .expect("client sent a malformed frame")
    }

    /// Next message from the client, or None once it closes the stream
    pub async fn try_recv(&mut self) -> Option<Message> {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for the client")
            .and_then(Result::ok)
    }

    pub async fn send(&mut self, mut msg: Message) -> u32 {
        self.next_serial += 1;
        msg.serial = self.next_serial;
        self.framed.send(msg).await.unwrap();
        self.next_serial
    }

    pub async fn reply(&mut self, call: &Message, body: Vec<Value>) -> u32 {
        let reply = Message::method_return(call).with_body(body).unwrap();
        self.send(reply).await
    }

    pub async fn reply_error(&mut self, call: &Message, name: &str, text: &str) -> u32 {
        self.send(Message::error(call, name, text).unwrap()).await
    }

    /// Hand back the raw stream for byte-level scripting
    pub fn into_inner(self) -> DuplexStream {
        self.framed.into_inner()
    }
}

/// Connected client plus the scripted peer on the other end
pub async fn connect_pair(config: &BusConfig) -> (Connection, FakePeer) {
    let (client, mut server) = duplex(256 * 1024);
    let peer = tokio::spawn(async move {
        accept_auth(&mut server).await;
        server
    });
    let conn = Connection::from_stream(client, config)
        .await
        .expect("handshake with fake peer");
    let server = peer.await.unwrap();
    (conn, FakePeer::new(server))
}

/// Frame the peer would send as the reply to `call`
pub fn reply_frame(call: &Message, serial: u32, body: Vec<Value>) -> Vec<u8> {
    let mut reply = Message::method_return(call).with_body(body).unwrap();
    reply.serial = serial;
    reply.to_bytes().unwrap()
}
