//! Memory Tier - In-Process LRU Cache
//!
//! The fastest lookup path. Never suspends: every operation takes one short
//! `parking_lot` lock.
//!
//! # Design
//!
//! - `HashMap` from key to entry plus a recency index ordered by a
//!   monotonically increasing sequence number (head = least recently used)
//! - Count-based eviction runs to completion before byte-based eviction
//! - Ties in access time are impossible; the sequence doubles as insertion order

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::entry::{CacheEntry, CacheKey, ResourceType};
use crate::config::TierConfig;

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Slot>,
    /// seq -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    total_bytes: u64,
    next_seq: u64,
}

impl Inner {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.seq);
        self.total_bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.recency.pop_first()?;
        let slot = self.entries.remove(&key)?;
        self.total_bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }
}

/// Memory Tier - bounded LRU map of validated entries
pub struct MemoryTier {
    inner: Mutex<Inner>,
    config: TierConfig,
    evictions: AtomicU64,
}

impl MemoryTier {
    /// Create a memory tier with the given limits
    pub fn new(config: TierConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an entry, moving it to the most-recently-used position
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let seq = inner.bump_seq();
        let slot = inner.entries.get_mut(key)?;
        let old_seq = std::mem::replace(&mut slot.seq, seq);
        slot.entry.touch();
        let entry = slot.entry.clone();
        inner.recency.remove(&old_seq);
        inner.recency.insert(seq, *key);
        Some(entry)
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Insert or replace an entry, then evict down to the limits.
    ///
    /// Returns the keys evicted to make room. The inserted key itself is
    /// evicted when its payload alone exceeds the byte budget.
    pub fn set(&self, entry: CacheEntry) -> Vec<CacheKey> {
        let mut inner = self.inner.lock();
        inner.remove(&entry.key);

        let seq = inner.bump_seq();
        let key = entry.key;
        inner.total_bytes += entry.size_bytes;
        inner.recency.insert(seq, key);
        inner.entries.insert(key, Slot { entry, seq });

        self.evict(&mut inner)
    }

    fn evict(&self, inner: &mut Inner) -> Vec<CacheKey> {
        let mut evicted = Vec::new();

        while inner.entries.len() > self.config.max_items {
            match inner.pop_lru() {
                Some(entry) => evicted.push(entry.key),
                None => break,
            }
        }

        while inner.total_bytes > self.config.max_bytes {
            match inner.pop_lru() {
                Some(entry) => evicted.push(entry.key),
                None => break,
            }
        }

        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            trace!(count = evicted.len(), "memory tier evicted entries");
        }
        evicted
    }

    /// Remove a single entry
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().remove(key)
    }

    /// Remove every entry of a resource type, returning how many were dropped
    pub fn remove_by_type(&self, resource_type: ResourceType) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.resource_type() == resource_type)
            .copied()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.total_bytes = 0;
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<CacheKey> {
        self.inner.lock().recency.values().copied().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total payload bytes held
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    /// Entries evicted since creation
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Configured limits
    pub fn config(&self) -> &TierConfig {
        &self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Payload;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use proptest::prelude::*;

    fn key(id: u64) -> CacheKey {
        CacheKey::new(ResourceType::Piece, id)
    }

    fn entry_of(key: CacheKey, size: usize) -> CacheEntry {
        let text = format!("data:image/png;base64,{}", STANDARD.encode(vec![1u8; size]));
        CacheEntry::new(key, Payload::encoded(text))
    }

    #[test]
    fn test_memory_tier_set_get() {
        let tier = MemoryTier::new(TierConfig::new(10, 1024));
        tier.set(entry_of(key(1), 100));

        let hit = tier.get(&key(1)).unwrap();
        assert_eq!(hit.size_bytes, 100);
        assert_eq!(hit.access_count, 2);
        assert!(tier.get(&key(2)).is_none());
        assert_eq!(tier.size_bytes(), 100);
    }

    #[test]
    fn test_lru_touch_protects_entry() {
        let tier = MemoryTier::new(TierConfig::new(2, u64::MAX));
        tier.set(entry_of(key(1), 10)); // A
        tier.set(entry_of(key(2), 10)); // B
        assert!(tier.get(&key(1)).is_some()); // touch A

        let evicted = tier.set(entry_of(key(3), 10)); // C
        assert_eq!(evicted, vec![key(2)]);
        assert!(tier.contains(&key(1)));
        assert!(!tier.contains(&key(2)));
        assert!(tier.contains(&key(3)));
    }

    #[test]
    fn test_byte_budget_eviction() {
        let tier = MemoryTier::new(TierConfig::new(100, 250));
        for id in 0..5 {
            tier.set(entry_of(key(id), 100));
        }

        assert_eq!(tier.len(), 2);
        assert_eq!(tier.size_bytes(), 200);
        assert_eq!(tier.keys_lru_order(), vec![key(3), key(4)]);
        assert_eq!(tier.evictions(), 3);
    }

    #[test]
    fn test_replace_updates_size() {
        let tier = MemoryTier::new(TierConfig::new(10, 10_000));
        tier.set(entry_of(key(1), 100));
        tier.set(entry_of(key(1), 300));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), 300);
        assert_eq!(tier.keys_lru_order(), vec![key(1)]);
    }

    #[test]
    fn test_oversized_entry_not_retained() {
        let tier = MemoryTier::new(TierConfig::new(10, 50));
        let evicted = tier.set(entry_of(key(1), 100));
        assert_eq!(evicted, vec![key(1)]);
        assert!(tier.is_empty());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[test]
    fn test_remove_by_type() {
        let tier = MemoryTier::new(TierConfig::new(10, 10_000));
        tier.set(entry_of(key(1), 10));
        tier.set(entry_of(CacheKey::new(ResourceType::Collection, 1), 10));
        tier.set(entry_of(CacheKey::new(ResourceType::Collection, 2), 10));

        assert_eq!(tier.remove_by_type(ResourceType::Collection), 2);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), 10);
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(TierConfig::new(10, 10_000));
        tier.set(entry_of(key(1), 10));
        tier.set(entry_of(key(2), 10));
        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.size_bytes(), 0);
        assert!(tier.keys_lru_order().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_limits_hold_after_every_operation(
            max_items in 1usize..8,
            max_bytes in 16u64..512,
            ops in prop::collection::vec((0u64..12, 1usize..128, any::<bool>()), 1..64),
        ) {
            let tier = MemoryTier::new(TierConfig::new(max_items, max_bytes));
            for (id, size, read) in ops {
                if read {
                    tier.get(&key(id));
                } else {
                    tier.set(entry_of(key(id), size));
                }
                prop_assert!(tier.len() <= max_items);
                prop_assert!(tier.size_bytes() <= max_bytes);
                prop_assert_eq!(tier.keys_lru_order().len(), tier.len());
            }
        }
    }
}
