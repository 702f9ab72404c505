//! Observability and Metrics
//!
//! Atomic counters owned by one application instance. There is no global
//! collector; grab a handle with `App::metrics()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections with a running session
    pub connections_active: AtomicU64,
    /// Sessions that set an identity within the grace window
    pub sessions_authenticated: AtomicU64,
    /// Sessions destroyed because the grace window elapsed
    pub auth_timeouts: AtomicU64,
    /// Sessions destroyed by a newer login for the same identity
    pub duplicate_evictions: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Inbound packets dropped for lack of a route
    pub unroutable_packets: AtomicU64,
    /// Handlers that returned an error
    pub handler_failures: AtomicU64,
    pub handler_panics: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            sessions_authenticated: AtomicU64::new(0),
            auth_timeouts: AtomicU64::new(0),
            duplicate_evictions: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            unroutable_packets: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate at zero
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn session_authenticated(&self) {
        self.sessions_authenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_timeout(&self) {
        self.auth_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_eviction(&self) {
        self.duplicate_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn unroutable_packet(&self) {
        self.unroutable_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            sessions_authenticated: self.sessions_authenticated.load(Ordering::Relaxed),
            auth_timeouts: self.auth_timeouts.load(Ordering::Relaxed),
            duplicate_evictions: self.duplicate_evictions.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            unroutable_packets: self.unroutable_packets.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_accepted = snapshot.connections_accepted,
            connections_active = snapshot.connections_active,
            sessions_authenticated = snapshot.sessions_authenticated,
            auth_timeouts = snapshot.auth_timeouts,
            duplicate_evictions = snapshot.duplicate_evictions,
            packets_received = snapshot.packets_received,
            packets_sent = snapshot.packets_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            unroutable_packets = snapshot.unroutable_packets,
            handler_failures = snapshot.handler_failures,
            handler_panics = snapshot.handler_panics,
            uptime_seconds = snapshot.uptime_seconds,
            "Server metrics snapshot"
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
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub sessions_authenticated: u64,
    pub auth_timeouts: u64,
    pub duplicate_evictions: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub unroutable_packets: u64,
    pub handler_failures: u64,
    pub handler_panics: u64,
    pub uptime_seconds: u64,
}
