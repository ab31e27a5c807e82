//! # Utility Modules
//!
//! Supporting utilities for logging, timing, and observability.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Timeout defaults and async timeout wrappers
//! - **Metrics**: Thread-safe per-connection counters

pub mod logging;
pub mod metrics;
pub mod timeout;

// Re-export public types for advanced users
pub use metrics::{Metrics, MetricsSnapshot};
