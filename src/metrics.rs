/// Metrics and telemetry for Tollgate
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - HTTP request counts and latencies
/// - Redemption outcomes and key issuance
/// - Access decisions and usage accounting
/// - Background job execution

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    // ========== Entitlement Metrics ==========

    /// Redemption attempts by outcome
    pub static ref REDEMPTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "redemptions_total",
        "Total number of activation key redemption attempts",
        &["outcome"]
    )
    .unwrap();

    /// Keys issued by plan
    pub static ref KEYS_ISSUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "keys_issued_total",
        "Total number of activation keys issued",
        &["plan"]
    )
    .unwrap();

    /// Code collisions hit during issuance
    pub static ref KEY_COLLISIONS_TOTAL: IntCounter = register_int_counter!(
        "key_collisions_total",
        "Total number of activation code collisions during issuance"
    )
    .unwrap();

    /// Key revocations
    pub static ref KEY_REVOCATIONS_TOTAL: IntCounter = register_int_counter!(
        "key_revocations_total",
        "Total number of administrative key revocations"
    )
    .unwrap();

    /// Access decisions by reason
    pub static ref ACCESS_DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "access_decisions_total",
        "Total number of access decisions",
        &["reason"]
    )
    .unwrap();

    /// Usage records written by kind
    pub static ref USAGE_RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "usage_records_total",
        "Total number of usage records written",
        &["kind"]
    )
    .unwrap();

    /// Accounts moved back to the free tier by the sweeper
    pub static ref SWEEP_DOWNGRADES_TOTAL: IntCounter = register_int_counter!(
        "sweep_downgrades_total",
        "Total number of accounts downgraded by the expiry sweeper"
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a redemption attempt
pub fn record_redemption(outcome: &str) {
    REDEMPTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record keys issued for a plan
pub fn record_keys_issued(plan: &str, count: usize) {
    KEYS_ISSUED_TOTAL
        .with_label_values(&[plan])
        .inc_by(count as u64);
}

/// Record an access decision
pub fn record_access_decision(reason: &str) {
    ACCESS_DECISIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// Record a usage log entry
pub fn record_usage(kind: &str) {
    USAGE_RECORDS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}
