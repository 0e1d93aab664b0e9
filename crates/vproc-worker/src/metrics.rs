//! Prometheus metrics for the worker.

use std::net::{Ipv4Addr, SocketAddr};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

/// Metric names as constants for consistency.
pub mod names {
    // Queue metrics
    pub const MESSAGES_RECEIVED_TOTAL: &str = "vproc_messages_received_total";
    pub const EMPTY_POLLS_TOTAL: &str = "vproc_empty_polls_total";
    pub const RECEIVE_ERRORS_TOTAL: &str = "vproc_receive_errors_total";

    // Processing metrics
    pub const MESSAGES_PROCESSED_TOTAL: &str = "vproc_messages_processed_total";
    pub const STAGE_DURATION_SECONDS: &str = "vproc_stage_duration_seconds";
    pub const OPERATOR_ATTENTION_TOTAL: &str = "vproc_operator_attention_total";

    // Lease metrics
    pub const LEASES_ACTIVE: &str = "vproc_leases_active";
    pub const LEASE_EXTENSIONS_TOTAL: &str = "vproc_lease_extensions_total";
    pub const LEASES_TIMED_OUT_TOTAL: &str = "vproc_leases_timed_out_total";
}

/// Start the Prometheus exporter when `METRICS_PORT` is set.
///
/// Without the variable, metric calls are no-ops.
pub fn init_metrics_from_env() {
    let Some(port) = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!("Prometheus metrics listening on {}", addr),
        Err(e) => warn!("Failed to start metrics exporter: {}", e),
    }
}

pub fn record_messages_received(count: usize) {
    counter!(names::MESSAGES_RECEIVED_TOTAL).increment(count as u64);
}

pub fn record_empty_poll() {
    counter!(names::EMPTY_POLLS_TOTAL).increment(1);
}

pub fn record_receive_error() {
    counter!(names::RECEIVE_ERRORS_TOTAL).increment(1);
}

/// Record a message outcome (`completed`, `discarded`, `released`, `unresolved`).
pub fn record_message_processed(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    counter!(names::MESSAGES_PROCESSED_TOTAL, &labels).increment(1);
}

/// Record one pipeline stage, successful or not.
pub fn record_stage(stage: &str, success: bool, duration_secs: f64) {
    let labels = [
        ("stage", stage.to_string()),
        ("result", if success { "ok" } else { "error" }.to_string()),
    ];
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_operator_attention() {
    counter!(names::OPERATOR_ATTENTION_TOTAL).increment(1);
}

pub fn set_active_leases(count: usize) {
    gauge!(names::LEASES_ACTIVE).set(count as f64);
}

pub fn record_lease_extension() {
    counter!(names::LEASE_EXTENSIONS_TOTAL).increment(1);
}

pub fn record_lease_timeout() {
    counter!(names::LEASES_TIMED_OUT_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::MESSAGES_PROCESSED_TOTAL.starts_with("vproc_"));
        assert!(names::STAGE_DURATION_SECONDS.ends_with("_seconds"));
        assert!(names::LEASE_EXTENSIONS_TOTAL.ends_with("_total"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_stage("fetch_source", true, 0.5);
        record_message_processed("completed");
        set_active_leases(0);
    }
}
