//! Prometheus exposition of cache statistics
//!
//! Builds a private [`Registry`] from a [`StatsSnapshot`] and encodes it in
//! the text format, so the numbers can be scraped from a file or printed by
//! the CLI without a global registry.

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::cache::StatsSnapshot;
use crate::error::{Error, Result};

const NAMESPACE: &str = "image_cache";

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

/// Encode a snapshot as Prometheus text
pub fn render_prometheus(snapshot: &StatsSnapshot) -> Result<String> {
    let registry = Registry::new();

    let items = IntGaugeVec::new(opts("items", "Entries per tier"), &["tier"]).map_err(metric_error)?;
    let bytes =
        IntGaugeVec::new(opts("bytes", "Payload bytes per tier"), &["tier"]).map_err(metric_error)?;
    let hit_rate =
        GaugeVec::new(opts("hit_rate", "Hits over lookups per tier"), &["tier"]).map_err(metric_error)?;
    let hits =
        IntCounterVec::new(opts("hits_total", "Lookup hits per tier"), &["tier"]).map_err(metric_error)?;
    let misses = IntCounterVec::new(opts("misses_total", "Lookup misses per tier"), &["tier"])
        .map_err(metric_error)?;
    let evictions = IntCounterVec::new(opts("evictions_total", "LRU evictions per tier"), &["tier"])
        .map_err(metric_error)?;

    for (tier, stats) in [("memory", &snapshot.memory), ("persistent", &snapshot.persistent)] {
        items.with_label_values(&[tier]).set(stats.items as i64);
        bytes.with_label_values(&[tier]).set(stats.bytes as i64);
        hit_rate.with_label_values(&[tier]).set(stats.hit_rate);
        hits.with_label_values(&[tier]).inc_by(stats.hits);
        misses.with_label_values(&[tier]).inc_by(stats.misses);
        evictions.with_label_values(&[tier]).inc_by(stats.evictions);
    }

    let requests = IntCounter::with_opts(opts("origin_requests_total", "Origin fetches started"))
        .map_err(metric_error)?;
    requests.inc_by(snapshot.network.requests);
    let placeholders = IntCounter::with_opts(opts(
        "placeholders_served_total",
        "Placeholder images returned",
    ))
    .map_err(metric_error)?;
    placeholders.inc_by(snapshot.network.placeholders_served);

    let errors = IntCounterVec::new(opts("errors_total", "Errors by category"), &["category"])
        .map_err(metric_error)?;
    for (category, count) in [
        ("network", snapshot.errors.network),
        ("persistent", snapshot.errors.persistent),
        ("quota", snapshot.errors.quota),
        ("corrupt", snapshot.errors.corrupt),
    ] {
        errors.with_label_values(&[category]).inc_by(count);
    }

    registry.register(Box::new(items)).map_err(metric_error)?;
    registry.register(Box::new(bytes)).map_err(metric_error)?;
    registry.register(Box::new(hit_rate)).map_err(metric_error)?;
    registry.register(Box::new(hits)).map_err(metric_error)?;
    registry.register(Box::new(misses)).map_err(metric_error)?;
    registry.register(Box::new(evictions)).map_err(metric_error)?;
    registry.register(Box::new(requests)).map_err(metric_error)?;
    registry.register(Box::new(placeholders)).map_err(metric_error)?;
    registry.register(Box::new(errors)).map_err(metric_error)?;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(metric_error)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
}
