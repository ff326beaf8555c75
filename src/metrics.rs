//! Prometheus metrics registry and metric definitions.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

/// Global registry under crate namespace
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("rust_log_indexer".into()), None)
        .expect("failed to create Prometheus registry")
});

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("counter opts");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("counter registered once");
    c
}

// ─── Index ──────────────────────────────────────────────────────────────────

/// Documents accepted into the index
pub static DOCUMENTS_INSERTED: Lazy<IntCounter> =
    Lazy::new(|| counter("documents_inserted_total", "Total documents inserted into the index"));

/// Bulk inserts refused because a document did not fit the schema
pub static INSERT_REJECTED: Lazy<IntCounter> =
    Lazy::new(|| counter("insert_batches_rejected_total", "Bulk inserts rejected by schema validation"));

pub static SEARCH_COUNTER: Lazy<IntCounter> =
    Lazy::new(|| counter("searches_total", "Total number of search requests"));

/// Histogram of search durations
pub static SEARCH_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("search_duration_seconds", "Duration of index searches in seconds");
    let h = Histogram::with_opts(opts).expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).expect("histogram registered once");
    h
});

pub static SNAPSHOTS_WRITTEN: Lazy<IntCounter> =
    Lazy::new(|| counter("snapshots_written_total", "Snapshot files written"));

// ─── Transport ──────────────────────────────────────────────────────────────

pub static BATCHES_SENT: Lazy<IntCounter> =
    Lazy::new(|| counter("transport_batches_sent_total", "Batches delivered by the transport"));

pub static BATCH_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| counter("transport_retries_total", "Batch submissions retried after a failure"));

/// Records lost after the retry budget ran out
pub static RECORDS_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| counter("transport_records_dropped_total", "Records dropped after exhausting retries"));

/// Encode all metrics as text
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    if let Err(e) = encoder.encode(&mf, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_carries_namespace() {
        SEARCH_COUNTER.inc();
        let text = gather_metrics();
        assert!(text.contains("rust_log_indexer_searches_total"));
    }
}
