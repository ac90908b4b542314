use crate::error::{GatewayError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Total number of API requests handled by the gateway"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "End-to-end API request latencies in seconds"
        );
        describe_counter!(
            "gateway_auth_failures_total",
            "Requests rejected by session or API key checks"
        );
        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Requests rejected due to rate limiting"
        );
        describe_counter!(
            "gateway_upstream_errors_total",
            "Backend calls that timed out or failed"
        );
        describe_counter!(
            "gateway_route_cache_total",
            "Route cache lookups by result (hit or miss)"
        );
        describe_counter!(
            "gateway_audit_dropped_total",
            "Audit records that could not be delivered"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Record a completed API request
///
/// `route` is the route id, or `"unmatched"` when resolution failed, which
/// keeps label cardinality bounded by the route table.
pub fn record_request(route: &str, method: &str, status: u16, duration: Duration) {
    let labels = [
        ("route", route.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Record an authentication or authorization rejection
pub fn record_auth_failure(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!("gateway_auth_failures_total", &labels).increment(1);
}

/// Record a rate limit rejection
pub fn record_rate_limited(route: &str, source: &str) {
    let labels = [("route", route.to_string()), ("source", source.to_string())];
    counter!("gateway_rate_limit_exceeded_total", &labels).increment(1);
}

/// Record a failed backend call
pub fn record_upstream_error(route: &str, reason: &str) {
    let labels = [("route", route.to_string()), ("reason", reason.to_string())];
    counter!("gateway_upstream_errors_total", &labels).increment(1);
}

/// Record a route cache lookup
pub fn record_route_cache(hit: bool) {
    let labels = [("result", if hit { "hit" } else { "miss" }.to_string())];
    counter!("gateway_route_cache_total", &labels).increment(1);
}

/// Record an audit record that was not delivered
pub fn record_audit_dropped(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!("gateway_audit_dropped_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_service_creation() {
        // A recorder may already be installed by another test in this process
        match MetricsService::new() {
            Ok(service) => {
                record_request("route-1", "GET", 200, Duration::from_millis(12));
                assert!(service.render().contains("gateway_requests_total"));
            }
            Err(e) => {
                assert!(e.to_string().contains("recorder") || e.to_string().contains("install"));
            }
        }
    }

    #[test]
    fn test_record_functions_dont_panic() {
        record_request("route-1", "GET", 200, Duration::from_millis(5));
        record_auth_failure("api_key_missing");
        record_rate_limited("route-1", "route");
        record_upstream_error("route-1", "timeout");
        record_route_cache(true);
        record_route_cache(false);
        record_audit_dropped("queue_full");
    }
}
