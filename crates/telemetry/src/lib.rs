//! cbcore-telemetry - logging and metrics
//!
//! Subscriber setup for binaries and tests, plus the metric helpers the
//! client records through. The library itself never installs a subscriber
//! or a recorder.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a human readable subscriber.
///
/// `RUST_LOG` overrides `log_level` when set.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Installs a JSON subscriber.
pub fn init_tracing_json(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Installs a test writer subscriber, ignoring the error if one is already set.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Installs the Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Completion of one key/value operation.
pub fn record_kv_operation(operation: &'static str, success: bool, duration_ms: f64) {
    let labels = [("operation", operation.to_string()), ("success", success.to_string())];

    counter!("cbcore_kv_operations_total", &labels).increment(1);
    histogram!("cbcore_kv_operation_duration_ms", &labels).record(duration_ms);
}

/// A request that was handed back for retry.
pub fn record_retry(reason: &'static str) {
    counter!("cbcore_retries_total", "reason" => reason).increment(1);
}

/// A cluster config accepted and published to watchers.
pub fn record_config_applied(revision: i64) {
    counter!("cbcore_config_updates_total").increment(1);
    gauge!("cbcore_config_revision").set(revision as f64);
}

/// Responses that arrived for requests nobody waits on any more.
pub fn record_orphaned_responses(count: usize) {
    counter!("cbcore_orphaned_responses_total").increment(count as u64);
}

/// Number of data-node pipelines in the current routing state.
pub fn set_pipeline_count(count: usize) {
    gauge!("cbcore_kv_pipelines").set(count as f64);
}

/// Circuit breaker transitions.
pub fn record_breaker_transition(address: &str, state: &'static str) {
    let labels = [("address", address.to_string()), ("state", state.to_string())];
    counter!("cbcore_circuit_breaker_transitions_total", &labels).increment(1);
}

/// Completion of one HTTP service request.
pub fn record_http_request(service: &'static str, status: u16, duration_ms: f64) {
    let labels = [("service", service.to_string()), ("status", status.to_string())];

    counter!("cbcore_http_requests_total", &labels).increment(1);
    histogram!("cbcore_http_request_duration_ms", &labels).record(duration_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_never_panic() {
        record_kv_operation("Get", true, 1.5);
        record_retry("KV_LOCKED");
        record_config_applied(12);
        record_orphaned_responses(3);
        set_pipeline_count(2);
        record_breaker_transition("127.0.0.1:11210", "open");
        record_http_request("query", 200, 10.0);
    }

    #[test]
    fn test_prometheus_renders_recorded_metrics() {
        let handle = init_metrics().unwrap();
        record_retry("KV_TEMPORARY_FAILURE");
        set_pipeline_count(4);
        let rendered = handle.render();
        assert!(rendered.contains("cbcore_retries_total"));
        assert!(rendered.contains("cbcore_kv_pipelines"));
    }
}
