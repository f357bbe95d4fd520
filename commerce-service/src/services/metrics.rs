//! Prometheus metrics for commerce-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, CounterVec,
    HistogramVec, IntCounterVec, TextEncoder,
};

/// Cart mutations by operation and outcome.
pub static CART_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "commerce_cart_operations_total",
        "Total number of cart operations",
        &["operation", "status"]
    )
    .expect("Failed to register cart_operations_total")
});

/// Checkout outcomes (created, empty_cart, error).
pub static ORDERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "commerce_orders_total",
        "Total number of checkout attempts by outcome",
        &["status"]
    )
    .expect("Failed to register orders_total")
});

/// Payment attempts by provider and terminal status.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "commerce_payments_total",
        "Total number of payment attempts by provider and status",
        &["provider", "status"]
    )
    .expect("Failed to register payments_total")
});

/// Settled amount in minor units. No per-user labels.
pub static PAYMENT_AMOUNT_MINOR_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "commerce_payment_amount_minor_total",
        "Total settled amount by currency, in the currency's minor unit",
        &["currency"]
    )
    .expect("Failed to register payment_amount_minor_total")
});

/// Gateway round-trip time by provider.
pub static GATEWAY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "commerce_gateway_request_duration_seconds",
        "Payment gateway request duration in seconds",
        &["provider"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register gateway_request_duration")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "commerce_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&CART_OPERATIONS_TOTAL);
    Lazy::force(&ORDERS_TOTAL);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&PAYMENT_AMOUNT_MINOR_TOTAL);
    Lazy::force(&GATEWAY_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_cart_operation(operation: &str, ok: bool) {
    CART_OPERATIONS_TOTAL
        .with_label_values(&[operation, if ok { "ok" } else { "error" }])
        .inc();
}
