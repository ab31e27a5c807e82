//! Observability and Metrics
//!
//! Per-connection counters for handshakes, traffic, and call outcomes.
//!
//! Uses atomic counters for thread-safe metrics collection from both the
//! receive loop and caller tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one connection
#[derive(Debug)]
pub struct Metrics {
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Calls resolved with a reply (return or error)
    pub calls_completed: AtomicU64,
    /// Calls that timed out
    pub calls_timed_out: AtomicU64,
    /// Calls cancelled by the caller
    pub calls_cancelled: AtomicU64,
    /// Error replies received for calls
    pub remote_errors: AtomicU64,
    /// Replies with no pending call (duplicate, late, or unknown serial)
    pub replies_discarded: AtomicU64,
    /// Signal deliveries to subscription handlers
    pub signals_delivered: AtomicU64,
    /// Incoming method calls routed to a local handler
    pub method_calls_routed: AtomicU64,
    /// Protocol errors on the receive path
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            calls_completed: AtomicU64::new(0),
            calls_timed_out: AtomicU64::new(0),
            calls_cancelled: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
            replies_discarded: AtomicU64::new(0),
            signals_delivered: AtomicU64::new(0),
            method_calls_routed: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message received
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_completed(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_timed_out(&self) {
        self.calls_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_cancelled(&self) {
        self.calls_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_discarded(&self) {
        self.replies_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signal_delivered(&self, handlers: u64) {
        self.signals_delivered.fetch_add(handlers, Ordering::Relaxed);
    }

    pub fn method_call_routed(&self) {
        self.method_calls_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_timed_out: self.calls_timed_out.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            replies_discarded: self.replies_discarded.load(Ordering::Relaxed),
            signals_delivered: self.signals_delivered.load(Ordering::Relaxed),
            method_calls_routed: self.method_calls_routed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            handshakes_total = snapshot.handshakes_total,
            handshakes_failed = snapshot.handshakes_failed,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            calls_completed = snapshot.calls_completed,
            calls_timed_out = snapshot.calls_timed_out,
            calls_cancelled = snapshot.calls_cancelled,
            remote_errors = snapshot.remote_errors,
            replies_discarded = snapshot.replies_discarded,
            signals_delivered = snapshot.signals_delivered,
            method_calls_routed = snapshot.method_calls_routed,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub calls_completed: u64,
    pub calls_timed_out: u64,
    pub calls_cancelled: u64,
    pub remote_errors: u64,
    pub replies_discarded: u64,
    pub signals_delivered: u64,
    pub method_calls_routed: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
