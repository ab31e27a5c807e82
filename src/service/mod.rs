//! # Client Service
//!
//! The [`Connection`] facade: handshake, receive loop, calls, and signals.

pub mod connection;

pub use connection::{CancelHandle, Connection, PendingReply, SignalStream, SubscriptionHandle};
