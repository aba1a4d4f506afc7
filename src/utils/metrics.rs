//! Observability and Metrics
//!
//! Counters for monitoring connection, handshake and session health.
//!
//! Uses atomic counters for thread-safe metrics collection. One instance is
//! shared by the server, its connections and the world loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Total AUTH_SESSION packets processed
    pub handshakes_total: AtomicU64,
    /// Handshakes answered with AUTH_OK
    pub handshakes_success: AtomicU64,
    /// Handshakes answered with a rejection code
    pub handshakes_failed: AtomicU64,
    /// Total packets sent
    pub packets_sent: AtomicU64,
    /// Total packets received
    pub packets_received: AtomicU64,
    /// Total bytes sent, headers included
    pub bytes_sent: AtomicU64,
    /// Total bytes received, headers included
    pub bytes_received: AtomicU64,
    /// Packets that qualified for compression
    pub compression_total: AtomicU64,
    /// Packets actually sent compressed
    pub compression_success: AtomicU64,
    /// Sessions kicked for ping cadence
    pub overspeed_kicks: AtomicU64,
    /// Client timestamps replaced by server time
    pub clock_sync_fallbacks: AtomicU64,
    /// Packets over their opcode's per-second limit
    pub packets_throttled: AtomicU64,
    /// Packets refused for insufficient account security
    pub permission_denials: AtomicU64,
    /// Handlers that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Connections closed because of a protocol violation
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            compression_total: AtomicU64::new(0),
            compression_success: AtomicU64::new(0),
            overspeed_kicks: AtomicU64::new(0),
            clock_sync_fallbacks: AtomicU64::new(0),
            packets_throttled: AtomicU64::new(0),
            permission_denials: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet sent
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a packet received
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn compression_attempt(&self) {
        self.compression_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn compression_success(&self) {
        self.compression_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overspeed_kick(&self) {
        self.overspeed_kicks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clock_sync_fallback(&self) {
        self.clock_sync_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_throttled(&self) {
        self.packets_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn permission_denied(&self) {
        self.permission_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            compression_total: self.compression_total.load(Ordering::Relaxed),
            compression_success: self.compression_success.load(Ordering::Relaxed),
            overspeed_kicks: self.overspeed_kicks.load(Ordering::Relaxed),
            clock_sync_fallbacks: self.clock_sync_fallbacks.load(Ordering::Relaxed),
            packets_throttled: self.packets_throttled.load(Ordering::Relaxed),
            permission_denials: self.permission_denials.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            compression_total = snapshot.compression_total,
            compression_success = snapshot.compression_success,
            overspeed_kicks = snapshot.overspeed_kicks,
            clock_sync_fallbacks = snapshot.clock_sync_fallbacks,
            packets_throttled = snapshot.packets_throttled,
            permission_denials = snapshot.permission_denials,
            handler_failures = snapshot.handler_failures,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub compression_total: u64,
    pub compression_success: u64,
    pub overspeed_kicks: u64,
    pub clock_sync_fallbacks: u64,
    pub packets_throttled: u64,
    pub permission_denials: u64,
    pub handler_failures: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}
