//! Cache Statistics
//!
//! Monotonic counters per tier and per error category. Hit rates are derived
//! when a snapshot is taken and never stored.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters, shared by the coordinator and the origin adapter
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    persistent_hits: AtomicU64,
    persistent_misses: AtomicU64,

    origin_requests: AtomicU64,
    origin_successes: AtomicU64,
    placeholders_served: AtomicU64,

    network_errors: AtomicU64,
    persistent_errors: AtomicU64,
    quota_errors: AtomicU64,
    corrupt_entries: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // Memory tier
    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    // Persistent tier
    pub fn record_persistent_hit(&self) {
        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_miss(&self) {
        self.persistent_misses.fetch_add(1, Ordering::Relaxed);
    }

    // Origin
    pub fn record_origin_request(&self) {
        self.origin_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_origin_success(&self) {
        self.origin_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_placeholder(&self) {
        self.placeholders_served.fetch_add(1, Ordering::Relaxed);
    }

    // Errors
    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_error(&self) {
        self.persistent_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_error(&self) {
        self.quota_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_entry(&self) {
        self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn persistent_hits(&self) -> u64 {
        self.persistent_hits.load(Ordering::Relaxed)
    }

    pub fn origin_requests(&self) -> u64 {
        self.origin_requests.load(Ordering::Relaxed)
    }

    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot combined with current tier occupancy
    pub fn snapshot(&self, memory: TierUsage, persistent: TierUsage) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let memory_hits = load(&self.memory_hits);
        let memory_misses = load(&self.memory_misses);
        let persistent_hits = load(&self.persistent_hits);
        let persistent_misses = load(&self.persistent_misses);

        StatsSnapshot {
            memory: TierStats {
                items: memory.items,
                bytes: memory.bytes,
                evictions: memory.evictions,
                hits: memory_hits,
                misses: memory_misses,
                hit_rate: hit_rate(memory_hits, memory_misses),
            },
            persistent: TierStats {
                items: persistent.items,
                bytes: persistent.bytes,
                evictions: persistent.evictions,
                hits: persistent_hits,
                misses: persistent_misses,
                hit_rate: hit_rate(persistent_hits, persistent_misses),
            },
            network: NetworkStats {
                requests: load(&self.origin_requests),
                successes: load(&self.origin_successes),
                failures: load(&self.network_errors),
                placeholders_served: load(&self.placeholders_served),
            },
            errors: ErrorStats {
                network: load(&self.network_errors),
                persistent: load(&self.persistent_errors),
                quota: load(&self.quota_errors),
                corrupt: load(&self.corrupt_entries),
            },
        }
    }
}

/// hits / (hits + misses), zero before the first lookup
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Occupancy of a tier at snapshot time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierUsage {
    pub items: u64,
    pub bytes: u64,
    pub evictions: u64,
}

/// Snapshot of one tier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    pub items: u64,
    pub bytes: u64,
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Origin traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub placeholders_served: u64,
}

/// Errors by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub network: u64,
    pub persistent: u64,
    pub quota: u64,
    pub corrupt: u64,
}

/// Snapshot of all cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub memory: TierStats,
    pub persistent: TierStats,
    pub network: NetworkStats,
    pub errors: ErrorStats,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_computed_at_read_time() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot(TierUsage::default(), TierUsage::default()).memory.hit_rate, 0.0);

        stats.record_memory_hit();
        stats.record_memory_hit();
        stats.record_memory_miss();
        stats.record_persistent_miss();

        let snapshot = stats.snapshot(TierUsage::default(), TierUsage::default());
        assert!((snapshot.memory.hit_rate - 0.666).abs() < 0.01);
        assert_eq!(snapshot.persistent.hit_rate, 0.0);

        stats.record_memory_hit();
        let snapshot = stats.snapshot(TierUsage::default(), TierUsage::default());
        assert_eq!(snapshot.memory.hit_rate, 0.75);
    }

    #[test]
    fn test_network_failures_mirror_error_counter() {
        let stats = CacheStats::new();
        stats.record_origin_request();
        stats.record_network_error();
        stats.record_placeholder();

        let snapshot = stats.snapshot(TierUsage::default(), TierUsage::default());
        assert_eq!(snapshot.network.requests, 1);
        assert_eq!(snapshot.network.failures, 1);
        assert_eq!(snapshot.errors.network, 1);
        assert_eq!(snapshot.network.placeholders_served, 1);
    }

    #[test]
    fn test_usage_carried_into_snapshot() {
        let stats = CacheStats::new();
        let snapshot = stats.snapshot(
            TierUsage {
                items: 3,
                bytes: 300,
                evictions: 1,
            },
            TierUsage {
                items: 10,
                bytes: 4096,
                evictions: 0,
            },
        );
        assert_eq!(snapshot.memory.items, 3);
        assert_eq!(snapshot.memory.bytes, 300);
        assert_eq!(snapshot.persistent.bytes, 4096);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CacheStats::new();
        stats.record_quota_error();
        let json = serde_json::to_value(stats.snapshot(TierUsage::default(), TierUsage::default()))
            .unwrap();
        assert_eq!(json["errors"]["quota"], 1);
        assert!(json["memory"]["hit_rate"].is_number());
    }
}
