//! # bus-protocol
//!
//! Client-side engine for the D-Bus message bus protocol.
//!
//! The crate covers everything between an open byte stream and typed method
//! calls: the wire codec, message framing, the SASL handshake, call/reply
//! correlation, signal dispatch, and a [`Connection`] facade tying them together.
//!
//! ## Layers
//! - [`core`]: signatures, typed values, marshalling, messages, the framing codec
//! - [`protocol`]: authentication handshake, signal filters, the dispatcher
//! - [`transport`]: bus address parsing and Unix/TCP connectors
//! - [`service`]: the client connection and its receive loop
//! - [`utils`]: logging setup, timeouts, metrics
//!
//! ## Example
//! ```no_run
//! use bus_protocol::{BusConfig, Connection, SignalFilter};
//!
//! # async fn run() -> bus_protocol::Result<()> {
//! let config = BusConfig::default();
//! let conn = Connection::session(&config).await?;
//!
//! let filter = SignalFilter::new().interface("org.freedesktop.DBus")?;
//! conn.add_match(&filter).await?;
//! conn.subscribe(filter, |signal| {
//!     println!("{:?} {:?}", signal.member, signal.body);
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::BusConfig;
pub use crate::core::codec::MessageCodec;
pub use crate::core::marshal::Endian;
pub use crate::core::message::{Message, MessageFlags, MessageType};
pub use crate::core::signature::{Signature, Type};
pub use crate::core::value::{Array, ObjectPath, Value};
pub use crate::error::{BusError, Result};
pub use crate::protocol::filter::SignalFilter;
pub use crate::protocol::handshake::AuthMechanism;
pub use crate::service::{CancelHandle, Connection, PendingReply, SignalStream, SubscriptionHandle};
pub use crate::transport::BusAddress;
