//! Persistent Tier - Quota-Limited Durable Store
//!
//! Asynchronous tier over a pluggable [`DurableStore`]. All durable-storage
//! access funnels through [`PersistentTier`], which owns the quota policy:
//!
//! - after every write, overflow of the item or byte budget evicts down to
//!   the low watermark (80% by default)
//! - a write rejected with `QuotaExceeded` evicts down to the quota
//!   watermark (50% by default) and is not retried
//!
//! # Backends
//!
//! - [`InMemoryStore`]: `DashMap` table, fault injection for tests
//! - [`FsStore`]: one JSON file per record, survives restarts

mod fs_store;
mod index;
mod memory_store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::entry::{now_millis, CacheEntry, CacheKey, Payload, ResourceType};
use crate::config::CacheConfig;
use crate::config::TierConfig;
use crate::error::{Error, Result};

pub use fs_store::FsStore;
pub use index::RecordIndex;
pub use memory_store::InMemoryStore;

// =============================================================================
// Durable Record
// =============================================================================

/// Record layout in the durable store, keyed by `"{type}:{id}"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub key: String,
    pub resource_type: ResourceType,
    pub id: u64,
    pub payload: Payload,
    pub size_bytes: u64,
    /// Epoch milliseconds, indexed
    pub last_access: i64,
    pub access_count: u64,
    pub mime_type: Option<String>,
    pub created_at: i64,
}

impl From<&CacheEntry> for StoreRecord {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.to_string(),
            resource_type: entry.key.resource_type(),
            id: entry.key.id(),
            payload: entry.payload.clone(),
            size_bytes: entry.size_bytes,
            last_access: entry.last_access,
            access_count: entry.access_count,
            mime_type: entry.mime_type.clone(),
            created_at: now_millis(),
        }
    }
}

impl StoreRecord {
    /// Convert back into a validated entry
    pub fn into_entry(self) -> Result<CacheEntry> {
        let key: CacheKey = self.key.parse().map_err(|_| Error::CorruptEntry {
            key: self.key.clone(),
            reason: "unparseable key".to_string(),
        })?;
        if key.resource_type() != self.resource_type || key.id() != self.id {
            return Err(Error::CorruptEntry {
                key: self.key,
                reason: "key does not match type/id fields".to_string(),
            });
        }

        let entry = CacheEntry {
            key,
            payload: self.payload,
            size_bytes: self.size_bytes,
            last_access: self.last_access,
            access_count: self.access_count,
            mime_type: self.mime_type,
        };
        entry.validate()?;
        Ok(entry)
    }
}

// =============================================================================
// Durable Store Port
// =============================================================================

/// Durable key-value store with access-time and type indexes
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Whether the host can provide this store at all
    fn is_available(&self) -> bool {
        true
    }

    /// Read a record
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>>;

    /// Upsert a record
    async fn put(&self, record: StoreRecord) -> Result<()>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every record of a type via the type index
    async fn delete_by_type(&self, resource_type: ResourceType) -> Result<usize>;

    /// Delete everything
    async fn clear(&self) -> Result<()>;

    /// All stored keys
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// (key, size) pairs in ascending access-time order
    async fn scan_by_access(&self) -> Result<Vec<(String, u64)>>;

    /// Number of records
    async fn count(&self) -> Result<usize>;

    /// Sum of `size_bytes` over all records
    async fn total_size(&self) -> Result<u64>;

    /// Operation counters
    fn stats(&self) -> StoreStats;
}

/// Durable store operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

// =============================================================================
// Persistent Tier
// =============================================================================

/// Persistent tier adapter
pub struct PersistentTier {
    store: Arc<dyn DurableStore>,
    limits: TierConfig,
    low_watermark_bytes: u64,
    low_watermark_items: usize,
    quota_watermark_bytes: u64,
    evictions: AtomicU64,
}

impl PersistentTier {
    /// Wrap a store with the limits from `config`
    pub fn new(store: Arc<dyn DurableStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            limits: config.persistent,
            low_watermark_bytes: config.persistent_target_bytes(),
            // Never evict down to an empty tier
            low_watermark_items: ((config.persistent.max_items as f64
                * config.persistent_low_watermark) as usize)
                .max(1),
            quota_watermark_bytes: config.quota_target_bytes(),
            evictions: AtomicU64::new(0),
        }
    }

    /// Whether the underlying store is usable
    pub fn is_available(&self) -> bool {
        self.store.is_available()
    }

    /// Read and validate an entry.
    ///
    /// A record that fails validation is deleted and reported as
    /// `CorruptEntry`.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let key_str = key.to_string();
        let Some(record) = self.store.get(&key_str).await? else {
            return Ok(None);
        };

        match record.into_entry() {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::CorruptEntry { reason, .. }) => {
                Err(self.discard_corrupt(&key_str, &reason).await)
            }
            Err(e) => Err(e),
        }
    }

    async fn discard_corrupt(&self, key: &str, reason: &str) -> Error {
        warn!(key, reason, "discarding corrupt persistent entry");
        if let Err(e) = self.store.delete(key).await {
            debug!(key, error = %e, "failed to delete corrupt entry");
        }
        Error::CorruptEntry {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Upsert an entry and enforce the tier budget.
    ///
    /// On `QuotaExceeded` the tier evicts aggressively and hands the
    /// quota error back; the write is not retried.
    #[instrument(skip(self, entry), fields(key = %entry.key, size = entry.size_bytes))]
    pub async fn set(&self, entry: &CacheEntry) -> Result<()> {
        match self.store.put(StoreRecord::from(entry)).await {
            Ok(()) => {}
            Err(e) if e.is_quota_exceeded() => {
                warn!(
                    target_bytes = self.quota_watermark_bytes,
                    "storage quota exceeded, performing aggressive eviction"
                );
                if let Err(evict_err) = self.evict_lru(self.quota_watermark_bytes).await {
                    warn!(error = %evict_err, "quota eviction failed");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let count = self.store.count().await?;
        let size = self.store.total_size().await?;
        if count > self.limits.max_items || size > self.limits.max_bytes {
            debug!(count, size, "persistent tier over budget");
            self.evict_to(self.low_watermark_bytes, self.low_watermark_items)
                .await?;
        }
        Ok(())
    }

    /// Delete one entry
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(key).await
    }

    /// Delete every entry of a type
    pub async fn delete_by_type(&self, resource_type: ResourceType) -> Result<usize> {
        self.store.delete_by_type(resource_type).await
    }

    /// Delete everything
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// All stored keys
    pub async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.store.list_keys().await
    }

    /// Sum of entry sizes
    pub async fn get_total_size(&self) -> Result<u64> {
        self.store.total_size().await
    }

    /// Number of entries
    pub async fn count(&self) -> Result<usize> {
        self.store.count().await
    }

    /// Bump the access time and count of a stored entry
    #[instrument(skip(self), fields(key = %key))]
    pub async fn touch(&self, key: &CacheKey) -> Result<()> {
        let key_str = key.to_string();
        if let Some(mut record) = self.store.get(&key_str).await? {
            record.last_access = now_millis().max(record.last_access);
            record.access_count += 1;
            self.store.put(record).await?;
        }
        Ok(())
    }

    /// Evict least recently accessed entries until the total size is at most
    /// `target_bytes`. Returns the number of entries removed.
    pub async fn evict_lru(&self, target_bytes: u64) -> Result<usize> {
        self.evict_to(target_bytes, usize::MAX).await
    }

    async fn evict_to(&self, target_bytes: u64, target_items: usize) -> Result<usize> {
        let mut size = self.store.total_size().await?;
        let mut count = self.store.count().await?;
        if size <= target_bytes && count <= target_items {
            return Ok(0);
        }

        let mut evicted = 0;
        for (key, entry_size) in self.store.scan_by_access().await? {
            if size <= target_bytes && count <= target_items {
                break;
            }
            if self.store.delete(&key).await? {
                size = size.saturating_sub(entry_size);
                count = count.saturating_sub(1);
                evicted += 1;
            }
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!(evicted, size, count, "persistent tier eviction complete");
        Ok(evicted)
    }

    /// Entries evicted since creation
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Configured limits
    pub fn limits(&self) -> &TierConfig {
        &self.limits
    }

    /// Underlying store counters
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn entry_of(kind: ResourceType, id: u64, size: usize) -> CacheEntry {
        let text = format!("data:image/png;base64,{}", STANDARD.encode(vec![9u8; size]));
        CacheEntry::new(CacheKey::new(kind, id), Payload::encoded(text))
    }

    fn config(max_items: usize, max_bytes: u64) -> CacheConfig {
        CacheConfig {
            persistent: TierConfig::new(max_items, max_bytes),
            ..Default::default()
        }
    }

    fn tier(store: Arc<InMemoryStore>, max_items: usize, max_bytes: u64) -> PersistentTier {
        PersistentTier::new(store, &config(max_items, max_bytes))
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store, 10, 10_000);
        let entry = entry_of(ResourceType::Piece, 1, 100);

        tier.set(&entry).await.unwrap();
        let loaded = tier.get(&entry.key).await.unwrap().unwrap();
        assert_eq!(loaded.payload, entry.payload);
        assert_eq!(loaded.size_bytes, 100);
        assert_eq!(tier.count().await.unwrap(), 1);
        assert_eq!(tier.get_total_size().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_single_item_tier_keeps_latest_write() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store, 1, 10_000);
        let first = entry_of(ResourceType::Piece, 1, 10);
        let second = entry_of(ResourceType::Piece, 2, 10);

        tier.set(&first).await.unwrap();
        tier.set(&second).await.unwrap();

        assert_eq!(tier.count().await.unwrap(), 1);
        assert!(tier.get(&second.key).await.unwrap().is_some());
        assert!(tier.get(&first.key).await.unwrap().is_none());
        assert_eq!(tier.evictions(), 1);
    }

    #[tokio::test]
    async fn test_overflow_evicts_to_low_watermark() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store, 100, 1000);

        for id in 0..11 {
            tier.set(&entry_of(ResourceType::Piece, id, 100)).await.unwrap();
        }

        // 1100 > 1000 triggers eviction down to 800
        assert_eq!(tier.get_total_size().await.unwrap(), 800);
        assert!(tier.get(&CacheKey::new(ResourceType::Piece, 0)).await.unwrap().is_none());
        assert!(tier.get(&CacheKey::new(ResourceType::Piece, 10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_item_overflow_respects_item_budget() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store, 5, u64::MAX / 2);

        for id in 0..6 {
            tier.set(&entry_of(ResourceType::Piece, id, 10)).await.unwrap();
        }
        assert_eq!(tier.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_quota_exceeded_evicts_to_half() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store.clone(), 100, 1000);

        for id in 0..9 {
            tier.set(&entry_of(ResourceType::Piece, id, 100)).await.unwrap();
        }
        store.fail_next_writes_with_quota(1);

        let result = tier.set(&entry_of(ResourceType::Piece, 99, 100)).await;
        assert_matches!(result, Err(Error::QuotaExceeded { .. }));
        assert!(tier.get_total_size().await.unwrap() <= 500);
        assert!(tier.get(&CacheKey::new(ResourceType::Piece, 99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_moves_entry_to_back() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store, 100, 250);
        let first = entry_of(ResourceType::Piece, 1, 100);
        let second = entry_of(ResourceType::Piece, 2, 100);

        tier.set(&first).await.unwrap();
        tier.set(&second).await.unwrap();
        tier.touch(&first.key).await.unwrap();
        tier.set(&entry_of(ResourceType::Piece, 3, 100)).await.unwrap();

        assert!(tier.get(&first.key).await.unwrap().is_some());
        assert!(tier.get(&second.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_rejected_and_removed() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store.clone(), 10, 10_000);
        let entry = entry_of(ResourceType::Collection, 7, 50);

        let mut record = StoreRecord::from(&entry);
        record.payload = Payload::encoded("garbage");
        store.put(record).await.unwrap();

        assert_matches!(tier.get(&entry.key).await, Err(Error::CorruptEntry { .. }));
        assert_eq!(tier.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_type_and_clear() {
        let store = Arc::new(InMemoryStore::new());
        let tier = tier(store, 10, 10_000);
        tier.set(&entry_of(ResourceType::Piece, 1, 10)).await.unwrap();
        tier.set(&entry_of(ResourceType::Collection, 1, 10)).await.unwrap();
        tier.set(&entry_of(ResourceType::Collection, 2, 10)).await.unwrap();

        assert_eq!(tier.delete_by_type(ResourceType::Collection).await.unwrap(), 2);
        assert_eq!(tier.get_all_keys().await.unwrap(), vec!["piece:1".to_string()]);

        tier.clear().await.unwrap();
        assert_eq!(tier.count().await.unwrap(), 0);
    }

    #[test]
    fn test_record_key_mismatch_is_corrupt() {
        let entry = entry_of(ResourceType::Piece, 1, 10);
        let mut record = StoreRecord::from(&entry);
        record.id = 2;
        assert_matches!(record.into_entry(), Err(Error::CorruptEntry { .. }));
    }
}
