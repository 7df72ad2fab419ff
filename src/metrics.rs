use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref UPSTREAM_FETCHES: IntCounterVec = register_int_counter_vec!(
        "watchproxy_upstream_fetches_total",
        "Upstream requests issued by the proxy, by kind (playlist, chunk, live, key, generic)",
        &["kind"]
    )
    .unwrap();
    pub static ref CACHE_HITS: IntCounterVec = register_int_counter_vec!(
        "watchproxy_cache_hits_total",
        "Requests answered from the local cache without an upstream fetch",
        &["kind"]
    )
    .unwrap();
    pub static ref BYTES_SERVED: IntCounterVec = register_int_counter_vec!(
        "watchproxy_bytes_served_total",
        "Bytes written to clients, by kind",
        &["kind"]
    )
    .unwrap();
}

pub fn record_fetch(kind: &str) {
    UPSTREAM_FETCHES.with_label_values(&[kind]).inc();
}

pub fn record_cache_hit(kind: &str) {
    CACHE_HITS.with_label_values(&[kind]).inc();
}

pub fn record_bytes_served(kind: &str, bytes: u64) {
    BYTES_SERVED.with_label_values(&[kind]).inc_by(bytes);
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
