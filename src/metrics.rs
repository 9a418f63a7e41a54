//! Lightweight metrics helpers for Revolver.
//!
//! Thin wrappers over the `metrics` crate macros. The crate does not embed an
//! exporter; the application can install any compatible recorder externally.
//!
//! Provided metrics (labels vary by family):
//! * `revolver_ingress_requests_total` (counter)
//! * `revolver_ingress_duration_seconds` (histogram)
//! * `revolver_api_requests_total` (counter, by service/api/outcome)
//! * `revolver_upstream_duration_seconds` (histogram)
//! * `revolver_bulkhead_rejections_total` (counter, by compartment/kind)
//! * `revolver_callback_deliveries_total` (counter, by outcome)
//! * `revolver_mailbox_records` (gauge)
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use once_cell::sync::Lazy;

pub const INGRESS_REQUESTS_TOTAL: &str = "revolver_ingress_requests_total";
pub const INGRESS_DURATION_SECONDS: &str = "revolver_ingress_duration_seconds";
pub const API_REQUESTS_TOTAL: &str = "revolver_api_requests_total";
pub const UPSTREAM_DURATION_SECONDS: &str = "revolver_upstream_duration_seconds";
pub const BULKHEAD_REJECTIONS_TOTAL: &str = "revolver_bulkhead_rejections_total";
pub const CALLBACK_DELIVERIES_TOTAL: &str = "revolver_callback_deliveries_total";
pub const MAILBOX_RECORDS: &str = "revolver_mailbox_records";

static DESCRIBE: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        INGRESS_REQUESTS_TOTAL,
        Unit::Count,
        "Total HTTP requests accepted by the gateway."
    );
    describe_histogram!(
        INGRESS_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of gateway ingress handling."
    );
    describe_counter!(
        API_REQUESTS_TOTAL,
        Unit::Count,
        "Upstream invocations by service, api and outcome."
    );
    describe_histogram!(
        UPSTREAM_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of upstream calls including bulkhead admission."
    );
    describe_counter!(
        BULKHEAD_REJECTIONS_TOTAL,
        Unit::Count,
        "Calls shed by a compartment (capacity, circuit_open, timeout, cancelled)."
    );
    describe_counter!(
        CALLBACK_DELIVERIES_TOTAL,
        Unit::Count,
        "Callback delivery outcomes (sent, failed, deferred)."
    );
    describe_gauge!(MAILBOX_RECORDS, "Records currently held by the mailbox.");
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBE);
    tracing::info!("Revolver metrics registered");
}

pub fn increment_ingress(method: &str, status: u16) {
    counter!(
        INGRESS_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_ingress_duration(method: &str, duration: std::time::Duration) {
    histogram!(INGRESS_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

pub fn increment_api_request(service: &str, api: &str, outcome: &str) {
    counter!(
        API_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "api" => api.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_upstream_duration(service: &str, api: &str, duration: std::time::Duration) {
    histogram!(
        UPSTREAM_DURATION_SECONDS,
        "service" => service.to_string(),
        "api" => api.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_rejection(compartment: &str, kind: &str) {
    counter!(
        BULKHEAD_REJECTIONS_TOTAL,
        "compartment" => compartment.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn increment_callback(outcome: &str) {
    counter!(CALLBACK_DELIVERIES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn set_mailbox_size(count: usize) {
    gauge!(MAILBOX_RECORDS).set(count as f64);
}
