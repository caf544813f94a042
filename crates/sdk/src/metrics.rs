//! Client-side metrics for observability and operational monitoring.
//!
//! The manager records one observation per request through an injected
//! [`RequestMetrics`] sink. Two implementations are included:
//!
//! - [`NoopRequestMetrics`]: Zero-overhead default that discards everything.
//! - [`MetricsRequestMetrics`]: Forwards to the [`metrics`](https://docs.rs/metrics) crate facade,
//!   and from there to whatever recorder the process installed.
//!
//! # Metric Names
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `xgrpc_client_requests_total` | Counter | `protocol`, `request_type`, `code` | Requests by outcome |
//! | `xgrpc_client_request_duration_seconds` | Histogram | `protocol`, `request_type`, `code` | Request latency |
//! | `xgrpc_client_connections_total` | Counter | `server`, `event` | Connection lifecycle events |
//! | `xgrpc_client_switches_total` | Counter | `outcome` | Server switch attempts |

use std::{fmt, sync::Arc, time::Duration};

/// Events for connection lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new connection was established.
    Connected,
    /// A connection was closed or dropped.
    Disconnected,
    /// A connection attempt failed.
    Failed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Sink for request and connection telemetry.
///
/// All methods default to no-ops, so implementors override only what they
/// collect. One instance is shared by the manager and every client it creates.
pub trait RequestMetrics: Send + Sync + fmt::Debug {
    /// Records one completed request, successful or not.
    ///
    /// - `protocol`: Transport family, `"grpc"` for streaming RPC calls.
    /// - `request_type`: Wire type name of the request.
    /// - `code`: Response result code, or a short error label on failure.
    /// - `duration`: Wall-clock time from dispatch to outcome.
    fn observe_request(&self, protocol: &str, request_type: &str, code: &str, duration: Duration) {
        let _ = (protocol, request_type, code, duration);
    }

    /// Records a connection lifecycle event.
    fn record_connection(&self, server: &str, event: ConnectionEvent) {
        let _ = (server, event);
    }

    /// Records the outcome of a server switch.
    fn record_switch(&self, success: bool) {
        let _ = success;
    }
}

/// No-op metrics implementation.
#[derive(Debug, Clone, Copy)]
pub struct NoopRequestMetrics;

impl RequestMetrics for NoopRequestMetrics {}

/// Metrics implementation using the `metrics` crate facade.
#[derive(Debug, Clone, Copy)]
pub struct MetricsRequestMetrics;

mod metric_names {
    pub const REQUESTS_TOTAL: &str = "xgrpc_client_requests_total";
    pub const REQUEST_DURATION: &str = "xgrpc_client_request_duration_seconds";
    pub const CONNECTIONS_TOTAL: &str = "xgrpc_client_connections_total";
    pub const SWITCHES_TOTAL: &str = "xgrpc_client_switches_total";
}

impl RequestMetrics for MetricsRequestMetrics {
    fn observe_request(&self, protocol: &str, request_type: &str, code: &str, duration: Duration) {
        let labels = [
            ("protocol", protocol.to_owned()),
            ("request_type", request_type.to_owned()),
            ("code", code.to_owned()),
        ];
        metrics::counter!(metric_names::REQUESTS_TOTAL, &labels).increment(1);
        metrics::histogram!(metric_names::REQUEST_DURATION, &labels).record(duration.as_secs_f64());
    }

    fn record_connection(&self, server: &str, event: ConnectionEvent) {
        metrics::counter!(
            metric_names::CONNECTIONS_TOTAL,
            "server" => server.to_owned(),
            "event" => event.to_string(),
        )
        .increment(1);
    }

    fn record_switch(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(metric_names::SWITCHES_TOTAL, "outcome" => outcome).increment(1);
    }
}

/// Creates the default metrics instance (no-op).
pub(crate) fn default_metrics() -> Arc<dyn RequestMetrics> {
    Arc::new(NoopRequestMetrics)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingMetrics {
        requests: AtomicU64,
        connections: AtomicU64,
        switches: AtomicU64,
    }

    impl RequestMetrics for CountingMetrics {
        fn observe_request(&self, _: &str, _: &str, _: &str, _: Duration) {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
        fn record_connection(&self, _: &str, _: ConnectionEvent) {
            self.connections.fetch_add(1, Ordering::Relaxed);
        }
        fn record_switch(&self, _: bool) {
            self.switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn noop_is_default() {
        let metrics = default_metrics();
        metrics.observe_request("grpc", "HealthCheckRequest", "200", Duration::from_millis(1));
        metrics.record_connection("http://127.0.0.1:8848", ConnectionEvent::Connected);
        metrics.record_switch(true);
    }

    #[test]
    fn connection_event_display() {
        assert_eq!(ConnectionEvent::Connected.to_string(), "connected");
        assert_eq!(ConnectionEvent::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionEvent::Failed.to_string(), "failed");
    }

    #[test]
    fn trait_object_via_arc() {
        let counting = Arc::new(CountingMetrics::default());
        let metrics: Arc<dyn RequestMetrics> = counting.clone();

        metrics.observe_request("grpc", "DemoRequest", "200", Duration::from_millis(5));
        metrics.observe_request("grpc", "DemoRequest", "timeout", Duration::from_millis(9));
        metrics.record_connection("http://127.0.0.1:8848", ConnectionEvent::Failed);
        metrics.record_switch(false);

        assert_eq!(counting.requests.load(Ordering::Relaxed), 2);
        assert_eq!(counting.connections.load(Ordering::Relaxed), 1);
        assert_eq!(counting.switches.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn metrics_facade_does_not_panic_without_recorder() {
        let metrics = MetricsRequestMetrics;
        metrics.observe_request("grpc", "DemoRequest", "200", Duration::from_millis(5));
        metrics.record_connection("http://127.0.0.1:8848", ConnectionEvent::Disconnected);
        metrics.record_switch(true);
    }

    #[test]
    fn default_trait_methods_are_noop() {
        #[derive(Debug)]
        struct EmptyMetrics;
        impl RequestMetrics for EmptyMetrics {}

        let metrics = EmptyMetrics;
        metrics.observe_request("grpc", "DemoRequest", "500", Duration::ZERO);
        metrics.record_connection("x", ConnectionEvent::Connected);
        metrics.record_switch(false);
    }
}
