//! In-memory durable store
//!
//! Stands in for a host-provided store in tests and memory-constrained
//! deployments. Uses `DashMap` for lock-free reads; writes serialize on the
//! index lock so the record table and the indexes never disagree.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::index::RecordIndex;
use super::{DurableStore, StoreRecord, StoreStats};
use crate::cache::entry::ResourceType;
use crate::error::{Error, Result};

/// In-memory [`DurableStore`] with optional quota and fault injection
pub struct InMemoryStore {
    records: DashMap<String, StoreRecord>,
    index: Mutex<RecordIndex>,
    quota_bytes: Option<u64>,
    available: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    quota_failures: AtomicUsize,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            index: Mutex::new(RecordIndex::new()),
            quota_bytes: None,
            available: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            quota_failures: AtomicUsize::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes beyond `quota_bytes`
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Create a store that reports itself unavailable
    pub fn unavailable() -> Self {
        let store = Self::default();
        store.available.store(false, Ordering::Relaxed);
        store
    }

    /// Make every read fail with an I/O error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make every write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every delete, type delete and clear fail with an I/O error
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    fn check_delete(&self, what: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(Error::PersistentIo(format!("injected delete failure for {}", what)));
        }
        Ok(())
    }

    /// Reject the next `n` writes with `QuotaExceeded`
    pub fn fail_next_writes_with_quota(&self, n: usize) {
        self.quota_failures.store(n, Ordering::Relaxed);
    }

    fn take_quota_failure(&self) -> bool {
        self.quota_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::PersistentIo(format!("injected read failure for {}", key)));
        }
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, record: StoreRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::PersistentIo(format!(
                "injected write failure for {}",
                record.key
            )));
        }

        let mut index = self.index.lock();
        let replaced = index.size_of(&record.key).unwrap_or(0);
        let projected = index.total_bytes() - replaced + record.size_bytes;

        if self.take_quota_failure() {
            return Err(Error::QuotaExceeded {
                needed: record.size_bytes,
                available: 0,
            });
        }
        if let Some(quota) = self.quota_bytes {
            if projected > quota {
                return Err(Error::QuotaExceeded {
                    needed: record.size_bytes,
                    available: quota.saturating_sub(index.total_bytes() - replaced),
                });
            }
        }

        index.insert(&record);
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_delete(key)?;
        let mut index = self.index.lock();
        index.remove(key);
        Ok(self.records.remove(key).is_some())
    }

    async fn delete_by_type(&self, resource_type: ResourceType) -> Result<usize> {
        self.check_delete(resource_type.as_str())?;
        let mut index = self.index.lock();
        let keys = index.keys_of_type(resource_type);
        for key in &keys {
            index.remove(key);
            self.records.remove(key);
        }
        self.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(keys.len())
    }

    async fn clear(&self) -> Result<()> {
        self.check_delete("all records")?;
        let mut index = self.index.lock();
        index.clear();
        self.records.clear();
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.index.lock().keys())
    }

    async fn scan_by_access(&self) -> Result<Vec<(String, u64)>> {
        Ok(self.index.lock().lru_order())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.index.lock().len())
    }

    async fn total_size(&self) -> Result<u64> {
        Ok(self.index.lock().total_bytes())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}
