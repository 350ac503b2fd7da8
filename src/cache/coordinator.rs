//! Cache Coordinator
//!
//! Orchestrates lookups across the tiers:
//!
//! ```text
//! get(type, id)
//!   ├─ Memory tier ─────────────── hit → touch, return
//!   └─ in-flight table ─────────── pending → share result
//!        └─ Persistent tier ────── hit → validate, promote, touch, return
//!             └─ Origin ────────── ok → write both tiers, return
//!                                  err → placeholder (not cached)
//! ```
//!
//! The in-flight table maps a key to a shared future. Check-and-insert goes
//! through the `DashMap` entry API so two callers can never both start a
//! pipeline for the same key. The pipeline runs as its own task and removes
//! its own entry when it settles, whatever the outcome, even if every caller
//! has stopped waiting.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::entry::{CacheEntry, CacheKey, Payload, ResourceType};
use super::memory::MemoryTier;
use super::origin::{OriginFetcher, OriginProvider, Resolution};
use super::persistent::{DurableStore, PersistentTier};
use super::placeholder::placeholder_for;
use super::stats::{CacheStats, StatsSnapshot, TierUsage};
use crate::config::CacheConfig;
use crate::error::Error;

type Pending = Shared<BoxFuture<'static, Payload>>;

struct Inner {
    config: CacheConfig,
    memory: MemoryTier,
    persistent: Option<PersistentTier>,
    origin: OriginFetcher,
    stats: Arc<CacheStats>,
    in_flight: DashMap<CacheKey, Pending>,
}

/// Tiered image cache.
///
/// Cheap to clone; all clones share the same tiers, counters and in-flight
/// table.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl ImageCache {
    /// Create a cache over an origin and an optional durable store.
    ///
    /// A store that reports itself unavailable is dropped and the memory tier
    /// switches to its standalone limits.
    pub fn new(
        config: CacheConfig,
        origin: Arc<dyn OriginProvider>,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        let persistent = match store {
            Some(store) if store.is_available() => Some(PersistentTier::new(store, &config)),
            Some(_) => {
                warn!("persistent store unavailable, using memory-only cache");
                None
            }
            None => None,
        };

        let memory_limits = config.memory_limits(persistent.is_some());
        let stats = Arc::new(CacheStats::new());

        info!(
            memory_items = memory_limits.max_items,
            memory_bytes = memory_limits.max_bytes,
            persistent = persistent.is_some(),
            "image cache initialized"
        );

        Self {
            inner: Arc::new(Inner {
                memory: MemoryTier::new(memory_limits),
                persistent,
                origin: OriginFetcher::new(origin, stats.clone()),
                stats,
                in_flight: DashMap::new(),
                config,
            }),
        }
    }

    /// Create a cache without a persistent tier
    pub fn memory_only(config: CacheConfig, origin: Arc<dyn OriginProvider>) -> Self {
        Self::new(config, origin, None)
    }

    /// Resolve a resource.
    ///
    /// Never fails: when no tier can produce the image the type's placeholder
    /// is returned and `errors.network` is incremented.
    pub async fn get(&self, resource_type: ResourceType, id: u64) -> Payload {
        let key = CacheKey::new(resource_type, id);

        if let Some(entry) = self.inner.memory.get(&key) {
            self.inner.stats.record_memory_hit();
            debug!(%key, "memory hit");
            return entry.payload;
        }
        self.inner.stats.record_memory_miss();

        let pending = match self.inner.in_flight.entry(key) {
            Entry::Occupied(occupied) => {
                debug!(%key, "joining in-flight resolution");
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                // The task's removal waits on this shard lock until the
                // entry below is inserted.
                let inner = self.inner.clone();
                let task = tokio::spawn(async move {
                    let payload = inner.resolve(key).await;
                    inner.in_flight.remove(&key);
                    payload
                });

                let inner = self.inner.clone();
                let pending = async move {
                    match task.await {
                        Ok(payload) => payload,
                        Err(e) => {
                            inner.in_flight.remove(&key);
                            inner.stats.record_network_error();
                            inner.stats.record_placeholder();
                            error!(%key, error = %e, "resolution task failed, serving placeholder");
                            placeholder_for(key.resource_type())
                        }
                    }
                }
                .boxed()
                .shared();
                vacant.insert(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Remove one entry from both tiers.
    ///
    /// Accepts the serialized `"{type}:{id}"` form, normalized the same way
    /// [`CacheKey`] parses it (`Post:8` removes `post:8`). Persistent tier
    /// failures are logged and otherwise ignored.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) {
        // Persistent records are keyed by the canonical form
        let store_key = match key.parse::<CacheKey>() {
            Ok(parsed) => {
                self.inner.memory.remove(&parsed);
                parsed.to_string()
            }
            Err(e) => {
                debug!(error = %e, "key is not a cache key, skipping memory tier");
                key.to_string()
            }
        };

        if let Some(persistent) = &self.inner.persistent {
            if let Err(e) = persistent.delete(&store_key).await {
                self.inner.stats.record_persistent_error();
                warn!(error = %e, "persistent delete failed");
            }
        }
        info!("invalidated {}", key);
    }

    /// Remove every entry of a type from both tiers
    #[instrument(skip(self))]
    pub async fn invalidate_by_type(&self, resource_type: ResourceType) {
        let removed = self.inner.memory.remove_by_type(resource_type);

        let mut persisted = 0;
        if let Some(persistent) = &self.inner.persistent {
            match persistent.delete_by_type(resource_type).await {
                Ok(n) => persisted = n,
                Err(e) => {
                    self.inner.stats.record_persistent_error();
                    warn!(error = %e, "persistent delete by type failed");
                }
            }
        }
        info!(memory = removed, persistent = persisted, "invalidated all {} images", resource_type);
    }

    /// Empty both tiers
    #[instrument(skip(self))]
    pub async fn clear_all(&self) {
        self.inner.memory.clear();

        if let Some(persistent) = &self.inner.persistent {
            if let Err(e) = persistent.clear().await {
                self.inner.stats.record_persistent_error();
                warn!(error = %e, "persistent clear failed");
            }
        }
        info!("cleared all caches");
    }

    /// Resolve every item with at most `max_concurrent` resolutions in
    /// flight, returning once all have settled.
    ///
    /// Returns the number of items settled.
    pub async fn preload<I>(&self, items: I, max_concurrent: Option<usize>) -> usize
    where
        I: IntoIterator<Item = (ResourceType, u64)>,
    {
        let limit = self.concurrency(max_concurrent);
        let settled = stream::iter(items)
            .map(|(resource_type, id)| self.get(resource_type, id))
            .buffer_unordered(limit)
            .count()
            .await;

        info!(items = settled, max_concurrent = limit, "preload complete");
        settled
    }

    /// Resolve items in the background.
    ///
    /// The returned handle reports a running completion count. Dropping it
    /// does not stop the work.
    pub fn prefetch<I>(&self, items: I, max_concurrent: Option<usize>) -> PrefetchHandle
    where
        I: IntoIterator<Item = (ResourceType, u64)>,
    {
        let items: Vec<_> = items.into_iter().collect();
        let total = items.len();
        let limit = self.concurrency(max_concurrent);
        let (tx, rx) = watch::channel(0usize);

        let cache = self.clone();
        let task = tokio::spawn(async move {
            let completed = stream::iter(items)
                .map(|(resource_type, id)| cache.get(resource_type, id))
                .buffer_unordered(limit)
                .fold(0usize, |done, _| {
                    let done = done + 1;
                    tx.send_replace(done);
                    futures::future::ready(done)
                })
                .await;
            debug!(completed, "prefetch complete");
            completed
        });

        PrefetchHandle {
            total,
            progress: rx,
            task,
        }
    }

    /// Point-in-time statistics
    pub async fn stats(&self) -> StatsSnapshot {
        let memory = TierUsage {
            items: self.inner.memory.len() as u64,
            bytes: self.inner.memory.size_bytes(),
            evictions: self.inner.memory.evictions(),
        };

        let persistent = match &self.inner.persistent {
            Some(persistent) => {
                let items = persistent.count().await.unwrap_or_else(|e| {
                    debug!(error = %e, "persistent count unavailable");
                    0
                });
                let bytes = persistent.get_total_size().await.unwrap_or_else(|e| {
                    debug!(error = %e, "persistent size unavailable");
                    0
                });
                TierUsage {
                    items: items as u64,
                    bytes,
                    evictions: persistent.evictions(),
                }
            }
            None => TierUsage::default(),
        };

        self.inner.stats.snapshot(memory, persistent)
    }

    /// Whether a persistent tier is in use
    pub fn persistent_available(&self) -> bool {
        self.inner.persistent.is_some()
    }

    /// Entries in the memory tier
    pub fn memory_len(&self) -> usize {
        self.inner.memory.len()
    }

    /// Keys with a resolution in flight
    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn concurrency(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.inner.config.max_concurrent).max(1)
    }
}

impl Inner {
    /// Persistent tier, then origin. Runs at most once per key at a time.
    #[instrument(skip(self), fields(key = %key))]
    async fn resolve(&self, key: CacheKey) -> Payload {
        if let Some(payload) = self.from_persistent(key).await {
            return payload;
        }

        match self.origin.fetch(key).await {
            Resolution::Fetched(entry) => {
                let payload = entry.payload.clone();
                self.populate(entry).await;
                payload
            }
            resolution @ Resolution::Placeholder(_) => resolution.into_payload(),
        }
    }

    async fn from_persistent(&self, key: CacheKey) -> Option<Payload> {
        let persistent = self.persistent.as_ref()?;

        match persistent.get(&key).await {
            Ok(Some(mut entry)) => {
                self.stats.record_persistent_hit();
                debug!("persistent hit, promoting to memory");
                entry.touch();
                let payload = entry.payload.clone();
                self.insert_memory(entry);

                if let Err(e) = persistent.touch(&key).await {
                    self.stats.record_persistent_error();
                    debug!(error = %e, "persistent touch failed");
                }
                Some(payload)
            }
            Ok(None) => {
                self.stats.record_persistent_miss();
                None
            }
            Err(e @ Error::CorruptEntry { .. }) => {
                self.stats.record_corrupt_entry();
                self.stats.record_persistent_miss();
                warn!(error = %e, "corrupt persistent entry treated as miss");
                None
            }
            Err(e) => {
                self.stats.record_persistent_error();
                self.stats.record_persistent_miss();
                warn!(error = %e, "persistent read failed, treating as miss");
                None
            }
        }
    }

    /// Store a fresh origin entry in both tiers
    async fn populate(&self, entry: CacheEntry) {
        let Some(persistent) = &self.persistent else {
            self.insert_memory(entry);
            return;
        };

        self.insert_memory(entry.clone());
        match persistent.set(&entry).await {
            Ok(()) => {}
            Err(e) if e.is_quota_exceeded() => {
                self.stats.record_quota_error();
                warn!(error = %e, "entry kept in memory only");
            }
            Err(e) => {
                self.stats.record_persistent_error();
                warn!(error = %e, "persistent write failed");
            }
        }
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let evicted = self.memory.set(entry);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "memory tier evicted entries");
        }
    }
}

// =============================================================================
// Prefetch Handle
// =============================================================================

/// Progress of a background prefetch
pub struct PrefetchHandle {
    total: usize,
    progress: watch::Receiver<usize>,
    task: JoinHandle<usize>,
}

impl PrefetchHandle {
    /// Number of items submitted
    pub fn total(&self) -> usize {
        self.total
    }

    /// Items settled so far
    pub fn completed(&self) -> usize {
        *self.progress.borrow()
    }

    /// Receiver notified on every completion
    pub fn progress(&self) -> watch::Receiver<usize> {
        self.progress.clone()
    }

    /// Wait for every item to settle
    pub async fn wait(self) -> usize {
        match self.task.await {
            Ok(completed) => completed,
            Err(e) => {
                warn!(error = %e, "prefetch task ended abnormally");
                *self.progress.borrow()
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persistent::InMemoryStore;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio_test::{assert_pending, assert_ready};

    const PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

    /// Origin that waits for a permit before answering
    struct GatedOrigin {
        gate: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OriginProvider for GatedOrigin {
        async fn fetch(&self, _: ResourceType, _: u64) -> Result<Payload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(Payload::encoded(PNG))
        }
    }

    struct FixedOrigin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OriginProvider for FixedOrigin {
        async fn fetch(&self, _: ResourceType, _: u64) -> Result<Payload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::encoded(PNG))
        }
    }

    fn fixed() -> Arc<FixedOrigin> {
        Arc::new(FixedOrigin {
            calls: AtomicUsize::new(0),
        })
    }

    fn gated() -> Arc<GatedOrigin> {
        Arc::new(GatedOrigin {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_pipeline() {
        let origin = gated();
        let cache = ImageCache::memory_only(CacheConfig::default(), origin.clone());

        let mut first = tokio_test::task::spawn(cache.get(ResourceType::Piece, 1));
        let mut second = tokio_test::task::spawn(cache.get(ResourceType::Piece, 1));
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(cache.in_flight_len(), 1);

        origin.gate.notify_one();
        while cache.in_flight_len() > 0 {
            tokio::task::yield_now().await;
        }
        let a = assert_ready!(first.poll());
        let b = assert_ready!(second.poll());
        assert_eq!(a, b);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_resolution() {
        let origin = gated();
        let cache = ImageCache::memory_only(CacheConfig::default(), origin.clone());

        let mut caller = tokio_test::task::spawn(cache.get(ResourceType::Piece, 1));
        assert_pending!(caller.poll());
        drop(caller);
        assert_eq!(cache.in_flight_len(), 1);

        origin.gate.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while cache.in_flight_len() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("resolution settles without a caller");

        assert_eq!(cache.memory_len(), 1);
        cache.get(ResourceType::Piece, 1).await;
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_hit_skips_origin() {
        let origin = fixed();
        let cache = ImageCache::memory_only(CacheConfig::default(), origin.clone());

        cache.get(ResourceType::Collection, 3).await;
        cache.get(ResourceType::Collection, 3).await;

        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.memory.hits, 1);
        assert_eq!(stats.memory.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_unavailable_store_uses_standalone_limits() {
        let config = CacheConfig::default();
        let store = Arc::new(InMemoryStore::unavailable());
        let cache = ImageCache::new(config.clone(), fixed(), Some(store));

        assert!(!cache.persistent_available());
        assert_eq!(*cache.inner.memory.config(), config.memory_standalone);
    }

    #[tokio::test]
    async fn test_invalidate_accepts_string_keys() {
        let store = Arc::new(InMemoryStore::new());
        let cache = ImageCache::new(CacheConfig::default(), fixed(), Some(store.clone()));

        cache.get(ResourceType::Piece, 8).await;
        assert_eq!(cache.memory_len(), 1);

        cache.invalidate("piece:8").await;
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(store.count().await.unwrap(), 0);

        // Garbage keys are tolerated
        cache.invalidate("not-a-key").await;
    }

    #[tokio::test]
    async fn test_invalidate_normalizes_key_for_persistent_tier() {
        let store = Arc::new(InMemoryStore::new());
        let origin = fixed();
        let cache = ImageCache::new(CacheConfig::default(), origin.clone(), Some(store.clone()));

        cache.get(ResourceType::PostAttachment, 8).await;
        cache.invalidate("Post:8").await;
        assert_eq!(cache.memory_len(), 0);
        assert!(store.list_keys().await.unwrap().is_empty());

        cache.get(ResourceType::PostAttachment, 8).await;
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_survives_persistent_delete_failure() {
        let store = Arc::new(InMemoryStore::new());
        let cache = ImageCache::new(CacheConfig::default(), fixed(), Some(store.clone()));
        for id in 0..3 {
            cache.get(ResourceType::Piece, id).await;
        }
        cache.get(ResourceType::Collection, 1).await;
        store.set_fail_deletes(true);

        cache.invalidate("piece:0").await;
        assert_eq!(cache.memory_len(), 3);
        assert_eq!(cache.stats().await.errors.persistent, 1);

        cache.invalidate_by_type(ResourceType::Piece).await;
        assert_eq!(cache.memory_len(), 1);
        assert_eq!(cache.stats().await.errors.persistent, 2);

        cache.clear_all().await;
        assert_eq!(cache.memory_len(), 0);
        let stats = cache.stats().await;
        assert_eq!(stats.errors.persistent, 3);
        assert_eq!(stats.persistent.items, 4);
    }

    #[tokio::test]
    async fn test_persistent_read_error_degrades_to_origin() {
        let store = Arc::new(InMemoryStore::new());
        let origin = fixed();
        let cache = ImageCache::new(CacheConfig::default(), origin.clone(), Some(store.clone()));
        store.set_fail_reads(true);

        let payload = cache.get(ResourceType::Piece, 2).await;
        assert_eq!(payload.as_text(), Some(PNG));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.errors.persistent, 1);
        assert_eq!(stats.errors.network, 0);
    }

    #[tokio::test]
    async fn test_prefetch_reports_progress() {
        let cache = ImageCache::memory_only(CacheConfig::default(), fixed());
        let items: Vec<_> = (0..6).map(|id| (ResourceType::Piece, id)).collect();

        let handle = cache.prefetch(items, Some(2));
        assert_eq!(handle.total(), 6);
        let progress = handle.progress();
        assert_eq!(handle.wait().await, 6);
        assert_eq!(*progress.borrow(), 6);
        assert_eq!(cache.memory_len(), 6);
    }

    #[tokio::test]
    async fn test_write_failure_still_serves_payload() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fail_writes(true);
        let cache = ImageCache::new(CacheConfig::default(), fixed(), Some(store.clone()));

        let payload = cache.get(ResourceType::Piece, 4).await;
        assert_ne!(payload, placeholder_for(ResourceType::Piece));
        assert_eq!(cache.memory_len(), 1);
        assert_eq!(cache.stats().await.errors.persistent, 1);
    }
}
