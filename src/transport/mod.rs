//! # Transport Layer
//!
//! Bus address parsing and the stream connectors behind it.
//!
//! The connection engine works over any [`Transport`]; the connectors here are
//! only needed when starting from an address string.
//!
//! ## Supported Addresses
//! - `unix:path=...` (Unix)
//! - `unix:abstract=...` (Linux)
//! - `tcp:host=...,port=...`

pub mod address;
pub mod local;

pub use address::{AddressKind, BusAddress};
pub use local::{BoxedTransport, Transport};
