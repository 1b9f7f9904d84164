//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase with the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple builds share a process). Recording still works: the macros
/// route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("modelmux_requests_total", "Total proxied requests");
    describe_histogram!(
        "modelmux_request_duration_seconds",
        "End-to-end request duration, including response streaming"
    );
    describe_gauge!(
        "modelmux_in_flight",
        "Current in-flight requests per model"
    );

    describe_counter!(
        "modelmux_starts_total",
        "Upstream process starts, by outcome"
    );
    describe_histogram!(
        "modelmux_start_duration_seconds",
        "Time from spawn to a passing health check"
    );
    describe_counter!(
        "modelmux_evictions_total",
        "Processes stopped by the scheduler to make room"
    );
}
