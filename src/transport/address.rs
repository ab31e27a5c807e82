//! Bus address strings.
//!
//! An address is `transport:key=value,key=value`, and an address string may list
//! several alternatives separated by `;`, tried in order:
//!
//! ```text
//! unix:path=/run/user/1000/bus
//! unix:abstract=/tmp/dbus-XXXX,guid=0123456789abcdef0123456789abcdef
//! tcp:host=localhost,port=12345
//! ```
//!
//! Values are percent-escaped; bytes outside `[-0-9A-Za-z_/.*]` are written as `%XX`.

use crate::error::{constants, BusError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// System bus socket used when `DBUS_SYSTEM_BUS_ADDRESS` is not set
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressKind {
    UnixPath(PathBuf),
    /// Linux abstract socket namespace
    UnixAbstract(String),
    Tcp { host: String, port: u16 },
}

/// One parsed bus address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub kind: AddressKind,
    /// Server GUID the address promises, if listed
    pub guid: Option<String>,
}

impl BusAddress {
    pub fn unix_path(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: AddressKind::UnixPath(path.into()),
            guid: None,
        }
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            kind: AddressKind::Tcp {
                host: host.to_string(),
                port,
            },
            guid: None,
        }
    }

    /// Parse a single address (no `;`)
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BusError::InvalidAddress(format!("'{s}': {reason}"));

        let (transport, params) = s
            .split_once(':')
            .ok_or_else(|| invalid("missing transport prefix"))?;

        let mut pairs = Vec::new();
        for pair in params.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("parameter without '='"))?;
            if pairs.iter().any(|(k, _): &(&str, String)| *k == key) {
                return Err(invalid(&format!("duplicate key '{key}'")));
            }
            pairs.push((key, unescape(value).map_err(|e| invalid(&e))?));
        }
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };

        let guid = get("guid");
        if let Some(guid) = &guid {
            if guid.len() != 32 || !guid.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid("guid must be 32 hex characters"));
            }
        }

        let kind = match transport {
            "unix" => match (get("path"), get("abstract")) {
                (Some(path), None) => AddressKind::UnixPath(PathBuf::from(path)),
                (None, Some(name)) => AddressKind::UnixAbstract(name),
                (Some(_), Some(_)) => return Err(invalid("both path and abstract given")),
                (None, None) => return Err(invalid("unix address needs path or abstract")),
            },
            "tcp" => {
                let host = get("host").unwrap_or_else(|| "localhost".to_string());
                let port = get("port")
                    .ok_or_else(|| invalid("tcp address needs a port"))?
                    .parse::<u16>()
                    .map_err(|_| invalid("port is not a number"))?;
                if port == 0 {
                    return Err(invalid("port 0 cannot be connected to"));
                }
                AddressKind::Tcp { host, port }
            }
            other => return Err(invalid(&format!("unsupported transport '{other}'"))),
        };

        Ok(Self { kind, guid })
    }

    /// Parse a `;`-separated list of alternatives
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let addresses = s
            .split(';')
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;
        if addresses.is_empty() {
            return Err(BusError::InvalidAddress(constants::ERR_NO_ADDRESS.to_string()));
        }
        Ok(addresses)
    }
}

impl FromStr for BusAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AddressKind::UnixPath(path) => {
                write!(f, "unix:path={}", escape(&path.to_string_lossy()))?
            }
            AddressKind::UnixAbstract(name) => write!(f, "unix:abstract={}", escape(name))?,
            AddressKind::Tcp { host, port } => write!(f, "tcp:host={},port={port}", escape(host))?,
        }
        if let Some(guid) = &self.guid {
            write!(f, ",guid={guid}")?;
        }
        Ok(())
    }
}

/// Session bus address from `DBUS_SESSION_BUS_ADDRESS`, or `$XDG_RUNTIME_DIR/bus`
pub fn session_bus_address() -> Result<String> {
    if let Ok(address) = std::env::var("DBUS_SESSION_BUS_ADDRESS") {
        if !address.is_empty() {
            return Ok(address);
        }
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let socket = PathBuf::from(runtime_dir).join("bus");
        if socket.exists() {
            return Ok(BusAddress::unix_path(socket).to_string());
        }
    }
    Err(BusError::InvalidAddress(format!(
        "{}: DBUS_SESSION_BUS_ADDRESS is not set",
        constants::ERR_NO_ADDRESS
    )))
}

/// System bus address from `DBUS_SYSTEM_BUS_ADDRESS`, or the well-known socket
pub fn system_bus_address() -> String {
    std::env::var("DBUS_SYSTEM_BUS_ADDRESS")
        .ok()
        .filter(|address| !address.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_BUS_ADDRESS.to_string())
}

fn unescape(value: &str) -> std::result::Result<String, String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| "bad percent escape".to_string())?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "value is not UTF-8".to_string())
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b"-_/.*".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}
