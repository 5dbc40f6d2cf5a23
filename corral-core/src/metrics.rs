// ABOUTME: Prometheus metrics for container sessions: launches, timeouts, records, and durations.
// ABOUTME: init_metrics installs the global recorder once; record_* helpers are no-ops without it.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and return a handle for rendering.
/// Later calls return the handle from the first.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!(
        "corral_containers_started_total",
        "Containers spawned, by group"
    );
    describe_counter!(
        "corral_container_timeouts_total",
        "Liveness deadlines that fired, by kind"
    );
    describe_counter!(
        "corral_output_records_total",
        "Framed output records decoded from containers"
    );
    describe_counter!(
        "corral_framing_errors_total",
        "Malformed records dropped between output markers"
    );
    describe_counter!("corral_errors_total", "Host-side errors, by kind");
    describe_histogram!(
        "corral_container_duration_seconds",
        "Wall time from spawn to exit, by outcome"
    );
    describe_gauge!("corral_active_containers", "Containers currently running");

    Ok(HANDLE.get_or_init(|| handle).clone())
}

pub fn record_container_started(group: &str) {
    counter!("corral_containers_started_total", "group" => group.to_string()).increment(1);
}

pub fn record_container_timeout(kind: &'static str) {
    counter!("corral_container_timeouts_total", "kind" => kind).increment(1);
}

pub fn record_output_record() {
    counter!("corral_output_records_total").increment(1);
}

pub fn record_framing_error() {
    counter!("corral_framing_errors_total").increment(1);
}

pub fn record_error(kind: &'static str) {
    counter!("corral_errors_total", "kind" => kind).increment(1);
}

pub fn record_container_duration(seconds: f64, status: &'static str) {
    histogram!("corral_container_duration_seconds", "status" => status).record(seconds);
}

pub fn set_active_containers(count: u64) {
    gauge!("corral_active_containers").set(count as f64);
}
