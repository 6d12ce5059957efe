//! Prometheus metrics for ofx-reconciliation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ofx_reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for OFX imports by final status.
pub static STATEMENT_IMPORTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ofx_reconciliation_statement_imports_total",
        "Total number of OFX statement imports",
        &["status"]
    )
    .expect("Failed to register STATEMENT_IMPORTS")
});

/// Counter for automatic matching outcomes per statement transaction.
pub static TRANSACTION_MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ofx_reconciliation_transaction_matches_total",
        "Total number of automatic matching outcomes",
        &["outcome"]
    )
    .expect("Failed to register TRANSACTION_MATCHES")
});

/// Counter for operator actions (manual reconcile, unreconcile, ignore).
pub static RECONCILIATION_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ofx_reconciliation_operations_total",
        "Total number of manual reconciliation operations",
        &["operation", "status"]
    )
    .expect("Failed to register RECONCILIATION_OPERATIONS")
});

/// Counter for calls to the ledger service.
pub static LEDGER_CALLS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ofx_reconciliation_ledger_calls_total",
        "Total number of ledger service calls",
        &["operation", "status"]
    )
    .expect("Failed to register LEDGER_CALLS")
});

/// Histogram for ledger call duration, retries included.
pub static LEDGER_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ofx_reconciliation_ledger_call_duration_seconds",
        "Ledger service call duration in seconds",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register LEDGER_CALL_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ofx_reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&STATEMENT_IMPORTS);
    Lazy::force(&TRANSACTION_MATCHES);
    Lazy::force(&RECONCILIATION_OPERATIONS);
    Lazy::force(&LEDGER_CALLS);
    Lazy::force(&LEDGER_CALL_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

pub fn record_statement_import(status: &str) {
    STATEMENT_IMPORTS.with_label_values(&[status]).inc();
}

pub fn record_transaction_match(outcome: &str) {
    TRANSACTION_MATCHES.with_label_values(&[outcome]).inc();
}

pub fn record_reconciliation_operation(operation: &str, status: &str) {
    RECONCILIATION_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_ledger_call(operation: &str, status: &str) {
    LEDGER_CALLS.with_label_values(&[operation, status]).inc();
}

pub fn record_ledger_call_duration(operation: &str, duration_secs: f64) {
    LEDGER_CALL_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}
