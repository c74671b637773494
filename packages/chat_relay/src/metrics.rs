//! Server metrics for observability
//!
//! Provides runtime metrics for monitoring relay health and throughput.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,
    /// Upgrade requests rejected because the session could not be registered
    pub registration_failures: AtomicU64,

    // Message metrics
    /// Frames received from clients
    pub messages_received: AtomicU64,
    /// Frames written to clients
    pub messages_sent: AtomicU64,
    /// Channel messages skipped by lagging relays
    pub messages_dropped: AtomicU64,

    // Error metrics
    /// Frames that failed to decode
    pub decode_errors: AtomicU64,
    /// Requests rejected by the dispatcher
    pub dispatch_errors: AtomicU64,
    /// WebSocket transport errors
    pub websocket_errors: AtomicU64,

    // Relay metrics
    pub active_relays: AtomicU64,
    pub total_relays: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn registration_failed(&self) {
        self.registration_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    // Error tracking
    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Relay tracking
    pub fn relay_started(&self) {
        self.active_relays.fetch_add(1, Ordering::Relaxed);
        self.total_relays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_stopped(&self) {
        self.active_relays.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                registration_failures: self.registration_failures.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                decode: self.decode_errors.load(Ordering::Relaxed),
                dispatch: self.dispatch_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
            relays: RelayMetrics {
                active: self.active_relays.load(Ordering::Relaxed),
                total: self.total_relays.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
    pub relays: RelayMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub registration_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub decode: u64,
    pub dispatch: u64,
    pub websocket: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub active: u64,
    pub total: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub sessions: u64,
    pub relays: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_relay_tracking() {
        let metrics = ServerMetrics::new();

        metrics.relay_started();
        metrics.relay_started();
        metrics.relay_stopped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.relays.active, 1);
        assert_eq!(snapshot.relays.total, 2);
    }

    #[test]
    fn test_message_and_error_counters() {
        let metrics = ServerMetrics::new();

        metrics.message_received();
        metrics.message_sent();
        metrics.message_sent();
        metrics.messages_dropped(5);
        metrics.decode_error();
        metrics.dispatch_error();
        metrics.websocket_error();
        metrics.registration_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.sent, 2);
        assert_eq!(snapshot.messages.dropped, 5);
        assert_eq!(snapshot.errors.decode, 1);
        assert_eq!(snapshot.errors.dispatch, 1);
        assert_eq!(snapshot.errors.websocket, 1);
        assert_eq!(snapshot.connections.registration_failures, 1);
    }

    #[test]
    fn test_snapshot_serialization() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connections"]["active"], 1);
        assert!(json.get("uptime_secs").is_some());
    }
}
