// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the marketplace.
//
// NOTES:
// - Prometheus pulls: it scrapes the /metrics endpoint
// - Counters carry a _total suffix, histograms the unit (_seconds)
// - Label values are bounded sets (sources, results, paths), never ids
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// HTTP request counter
/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Orders persisted
/// Labels: path (checkout/admin)
pub const ORDERS_CREATED_TOTAL: &str = "orders_created_total";

/// Stock decrement attempts
/// Labels: source (catalog/farmer), status (success/failed)
pub const STOCK_RESERVATIONS_TOTAL: &str = "stock_reservations_total";

/// Payment callback outcomes
/// Labels: result (paid/invalid_signature/rejected)
pub const PAYMENT_VERIFICATIONS_TOTAL: &str = "payment_verifications_total";

/// Store operation duration histogram
/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn builder() -> Result<PrometheusBuilder> {
    let mut builder = PrometheusBuilder::new();
    for name in [
        HTTP_REQUEST_DURATION_SECONDS,
        DB_QUERY_DURATION_SECONDS,
        REDIS_OPERATION_DURATION_SECONDS,
    ] {
        builder = builder.set_buckets_for_metric(Matcher::Full(name.to_string()), LATENCY_BUCKETS)?;
    }
    Ok(builder)
}

// =============================================================================
// SETUP
// =============================================================================
/// Installs the global Prometheus recorder and returns the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = builder()?.install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(ORDERS_CREATED_TOTAL, "Orders persisted, by creation path");
    describe_counter!(
        STOCK_RESERVATIONS_TOTAL,
        "Stock decrement attempts, by counter source and outcome"
    );
    describe_counter!(
        PAYMENT_VERIFICATIONS_TOTAL,
        "Payment verification callbacks, by outcome"
    );
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Store operation latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

/// Handle backed by a recorder that is not installed globally.
/// Renders an empty exposition; used where several app instances coexist.
#[cfg(test)]
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record a persisted order
///
/// # Arguments
/// * `path` - `checkout` or `admin`
pub fn record_order_created(path: &'static str) {
    counter!(ORDERS_CREATED_TOTAL, "path" => path).increment(1);
}

/// Record a stock decrement attempt
///
/// # Arguments
/// * `source` - `catalog` or `farmer`
/// * `success` - Whether the decrement was applied
pub fn record_reservation(source: &'static str, success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        STOCK_RESERVATIONS_TOTAL,
        "source" => source,
        "status" => status
    )
    .increment(1);
}

pub fn record_payment_verification(result: &'static str) {
    counter!(PAYMENT_VERIFICATIONS_TOTAL, "result" => result).increment(1);
}

/// Record store operation duration
pub fn record_db_query(operation: &'static str, duration_secs: f64) {
    histogram!(DB_QUERY_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &'static str, duration_secs: f64) {
    histogram!(REDIS_OPERATION_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}
