//! Prometheus metrics exposition
//!
//! Gateway-level metrics live here; pool metrics are emitted by the
//! `credential-pool` crate through the same global recorder:
//!
//! - `gateway_requests_total` (counter): labels `endpoint`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `endpoint`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `credential_pool_acquisitions_total`, `credential_pool_releases_total`,
//!   `credential_rotations_total` (counters, from the pool)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Request duration buckets, 5ms up to the default upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with its endpoint and final HTTP status.
pub fn record_request(endpoint: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "endpoint" => endpoint, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "endpoint" => endpoint)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type).increment(1);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("chat", 200, 0.05);
        record_upstream_error("timeout");
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("chat", 200, 0.042);
        record_request("images", 503, 1.5);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("endpoint=\"chat\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines for histogram_quantile() queries"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"180\""));
    }

    #[test]
    fn record_upstream_error_carries_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("timeout");
        record_upstream_error("unauthorized");

        let output = handle.render();
        assert!(output.contains("gateway_upstream_errors_total"));
        assert!(output.contains("error_type=\"timeout\""));
        assert!(output.contains("error_type=\"unauthorized\""));
    }
}
