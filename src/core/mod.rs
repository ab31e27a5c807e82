//! # Core Protocol Components
//!
//! Wire codec, type signatures, and message framing.
//!
//! This module provides the foundation of the protocol: typed values, their
//! binary encoding, and the framing of complete messages over a byte stream.
//!
//! ## Components
//! - **Signature**: parsed type signatures (`a{sv}`, `(iis)`, ...)
//! - **Value**: the closed set of typed values
//! - **Marshal**: aligned encoding/decoding in either byte order
//! - **Message**: header + body, fixed/variable header layout
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Endian(1)] [Type(1)] [Flags(1)] [Version(1)] [BodyLen(4)] [Serial(4)] [Fields(a(yv))] [Pad8] [Body(N)]
//! ```
//!
//! ## Security
//! - Maximum message size: 128 MiB, configurable lower (prevents memory exhaustion)
//! - Length validation before allocation
//! - Nesting depth limits on decode

pub mod codec;
pub mod marshal;
pub mod message;
pub mod names;
pub mod signature;
pub mod value;
