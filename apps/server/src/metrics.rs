//! Prometheus metrics for the terminology server

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref OPERATION_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "tx_operation_requests_total",
        "Terminology operation invocations by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("metric registration");

    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "tx_operation_duration_seconds",
        "Terminology operation wall-clock duration",
        &["operation"]
    )
    .expect("metric registration");

    pub static ref EXPANSION_CACHE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "tx_expansion_cache_events_total",
        "Expansion cache hits, misses and evictions",
        &["event"]
    )
    .expect("metric registration");
}

/// Render the default registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
