//! Cache metrics
//!
//! Recorded through the `metrics` facade. No exporter is installed here; an
//! embedding process can install whichever recorder it scrapes with.

/// Record a verified cache hit
pub fn record_cache_hit(model: &str) {
    metrics::counter!("model_cache_hits_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a miss that led to (or joined) a download
pub fn record_cache_miss(model: &str) {
    metrics::counter!("model_cache_misses_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record bytes streamed from a source
pub fn record_downloaded_bytes(backend: &str, bytes: u64) {
    metrics::counter!("model_cache_downloaded_bytes_total",
        "backend" => backend.to_string()
    )
    .increment(bytes);
}

/// Record a transient fetch failure that will be retried
pub fn record_fetch_retry(backend: &str) {
    metrics::counter!("model_cache_fetch_retries_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record a downloaded artifact whose hash did not match
pub fn record_checksum_failure(model: &str) {
    metrics::counter!("model_cache_checksum_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record an LRU eviction
pub fn record_eviction(model: &str) {
    metrics::counter!("model_cache_evictions_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Update total cached bytes gauge
pub fn update_cache_size(bytes: u64) {
    metrics::gauge!("model_cache_size_bytes").set(bytes as f64);
}
