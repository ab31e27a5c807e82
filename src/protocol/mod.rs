//! # Protocol Layer
//!
//! Authentication and message routing on top of the core codec.
//!
//! ## Components
//! - **Handshake**: SASL client exchange (`EXTERNAL`, `ANONYMOUS`) run before framing
//! - **Filter**: signal match rules
//! - **Dispatcher**: pending-call correlation, signal fan-out, method routing
//!
//! ## Connection Lifecycle
//! ```text
//! Connecting -> AuthSent -> Authenticated -> Ready
//!                   \-> Rejected
//! ```

pub mod dispatcher;
pub mod filter;
pub mod handshake;
