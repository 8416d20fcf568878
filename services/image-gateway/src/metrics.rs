//! Prometheus metrics exposition
//!
//! Gateway metrics:
//!
//! - `gateway_requests_total` (counter): label `status`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//!
//! The pool crate emits its own `key_pool_*` series through the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Generation calls are slow; buckets run from 100ms to 5 minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed generation request.
pub fn record_request(status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status.clone()).increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status)
        .record(duration_secs);
}
