//! SASL authentication handshake, client side.
//!
//! The exchange is line based and happens before any binary message:
//!
//! ```text
//! C: \0AUTH EXTERNAL 31303030\r\n
//! S: OK 1234deadbeef...\r\n
//! C: BEGIN\r\n
//! ```
//!
//! [`ClientHandshake`] is the sans-IO state machine; [`authenticate`] drives it over
//! a stream. Any reply other than `OK <guid>` is terminal: the handshake moves to
//! [`HandshakeState::Rejected`] and nothing else is written. There is no automatic
//! retry with another mechanism, the caller decides.

use crate::error::{constants, BusError, Result};
use crate::utils::timeout::with_timeout_error;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Maximum length of one authentication line
pub const MAX_AUTH_LINE: usize = 16 * 1024;

/// Trace string sent with the ANONYMOUS mechanism
const ANONYMOUS_TRACE: &str = "bus-protocol";

/// Supported SASL mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanism {
    /// Credentials passed out of band by the socket (Unix uid)
    #[default]
    External,
    Anonymous,
}

impl AuthMechanism {
    pub fn name(self) -> &'static str {
        match self {
            AuthMechanism::External => "EXTERNAL",
            AuthMechanism::Anonymous => "ANONYMOUS",
        }
    }
}

/// Handshake progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AuthSent,
    Authenticated,
    Ready,
    Rejected(String),
}

/// Client side of the authentication exchange, without I/O
#[derive(Debug)]
pub struct ClientHandshake {
    mechanism: AuthMechanism,
    identity: Option<u32>,
    state: HandshakeState,
    guid: Option<String>,
}

impl ClientHandshake {
    /// New handshake identifying as the current process user
    pub fn new(mechanism: AuthMechanism) -> Self {
        Self {
            mechanism,
            identity: current_uid(),
            state: HandshakeState::Connecting,
            guid: None,
        }
    }

    /// Override the uid sent with EXTERNAL
    pub fn with_identity(mut self, uid: u32) -> Self {
        self.identity = Some(uid);
        self
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Server GUID, known once authenticated
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// Opening bytes: the credentials NUL followed by the AUTH command
    pub fn start(&mut self) -> Result<Vec<u8>> {
        self.expect_state(HandshakeState::Connecting)?;

        let response = match self.mechanism {
            AuthMechanism::External => {
                let uid = self.identity.ok_or_else(|| {
                    BusError::HandshakeError("EXTERNAL requires a Unix uid".into())
                })?;
                hex_encode(uid.to_string().as_bytes())
            }
            AuthMechanism::Anonymous => hex_encode(ANONYMOUS_TRACE.as_bytes()),
        };

        let mut out = vec![0u8];
        out.extend_from_slice(format!("AUTH {} {}\r\n", self.mechanism.name(), response).as_bytes());
        self.state = HandshakeState::AuthSent;
        Ok(out)
    }

    /// Feed one server line (without the trailing CRLF)
    pub fn on_line(&mut self, line: &str) -> Result<()> {
        self.expect_state(HandshakeState::AuthSent)?;

        let mut words = line.split(' ');
        let reason = match (words.next(), words.next(), words.next()) {
            (Some("OK"), Some(guid), None) if is_guid(guid) => {
                self.guid = Some(guid.to_string());
                self.state = HandshakeState::Authenticated;
                debug!(mechanism = self.mechanism.name(), "Authenticated");
                return Ok(());
            }
            (Some("REJECTED"), ..) => {
                let offered = line.trim_start_matches("REJECTED").trim();
                format!(
                    "{} rejected (server supports: {})",
                    self.mechanism.name(),
                    if offered.is_empty() { "none" } else { offered }
                )
            }
            _ => format!("unexpected response '{line}'"),
        };

        warn!(reason = %reason, "Authentication rejected");
        self.state = HandshakeState::Rejected(reason.clone());
        Err(BusError::HandshakeError(reason))
    }

    /// Closing bytes: switches the stream to binary messages
    pub fn begin(&mut self) -> Result<Vec<u8>> {
        self.expect_state(HandshakeState::Authenticated)?;
        self.state = HandshakeState::Ready;
        Ok(b"BEGIN\r\n".to_vec())
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BusError::HandshakeError(format!(
                "{}: expected {:?}, in {:?}",
                constants::ERR_HANDSHAKE_STATE,
                expected,
                self.state
            )))
        }
    }
}

/// Outcome of a successful handshake
#[derive(Debug)]
pub struct Authenticated {
    pub guid: String,
    /// Bytes read past the OK line; the start of the binary stream
    pub leftover: BytesMut,
}

/// Run the client handshake over `stream`
#[instrument(skip(stream))]
pub async fn authenticate<S>(
    stream: &mut S,
    mechanism: AuthMechanism,
    timeout: Duration,
) -> Result<Authenticated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = ClientHandshake::new(mechanism);
    with_timeout_error(drive(stream, handshake), timeout).await
}

/// Run an already configured handshake over `stream`
pub async fn drive<S>(stream: &mut S, mut handshake: ClientHandshake) -> Result<Authenticated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&handshake.start()?).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(256);
    let line = read_line(stream, &mut buf).await?;
    handshake.on_line(&line)?;

    stream.write_all(&handshake.begin()?).await?;
    stream.flush().await?;

    let guid = handshake.guid.take().unwrap_or_default();
    Ok(Authenticated {
        guid,
        leftover: buf,
    })
}

async fn read_line<S>(stream: &mut S, buf: &mut BytesMut) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos + 2);
            let text = std::str::from_utf8(&line[..pos])
                .ok()
                .filter(|s| s.is_ascii())
                .ok_or_else(|| BusError::HandshakeError(constants::ERR_AUTH_NOT_UTF8.into()))?;
            return Ok(text.to_string());
        }
        if buf.len() > MAX_AUTH_LINE {
            return Err(BusError::HandshakeError(constants::ERR_AUTH_LINE_TOO_LONG.into()));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(BusError::HandshakeError(
                constants::ERR_PEER_CLOSED_DURING_AUTH.into(),
            ));
        }
    }
}

fn is_guid(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    // SAFETY: getuid has no preconditions and cannot fail
    Some(unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}
