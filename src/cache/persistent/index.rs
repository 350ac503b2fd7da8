//! Secondary indexes over durable records
//!
//! Keeps the access-time ordering and per-type key sets that `evict_lru` and
//! `delete_by_type` walk, so neither needs a full scan of the record table.

use std::collections::{BTreeSet, HashMap};

use super::StoreRecord;
use crate::cache::entry::ResourceType;

#[derive(Debug, Clone, Copy)]
struct Position {
    last_access: i64,
    seq: u64,
    size_bytes: u64,
    resource_type: ResourceType,
}

/// Access-time and resource-type indexes plus a running byte total
#[derive(Debug, Default)]
pub struct RecordIndex {
    /// (last_access, write sequence, key), ascending
    by_access: BTreeSet<(i64, u64, String)>,
    by_type: HashMap<ResourceType, BTreeSet<String>>,
    positions: HashMap<String, Position>,
    total_bytes: u64,
    next_seq: u64,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a record, replacing any previous position for its key.
    ///
    /// Returns the size of the replaced record.
    pub fn insert(&mut self, record: &StoreRecord) -> Option<u64> {
        let previous = self.remove(&record.key);
        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_access
            .insert((record.last_access, seq, record.key.clone()));
        self.by_type
            .entry(record.resource_type)
            .or_default()
            .insert(record.key.clone());
        self.positions.insert(
            record.key.clone(),
            Position {
                last_access: record.last_access,
                seq,
                size_bytes: record.size_bytes,
                resource_type: record.resource_type,
            },
        );
        self.total_bytes += record.size_bytes;
        previous
    }

    /// Drop a key, returning its size
    pub fn remove(&mut self, key: &str) -> Option<u64> {
        let pos = self.positions.remove(key)?;
        self.by_access
            .remove(&(pos.last_access, pos.seq, key.to_string()));
        if let Some(keys) = self.by_type.get_mut(&pos.resource_type) {
            keys.remove(key);
        }
        self.total_bytes -= pos.size_bytes;
        Some(pos.size_bytes)
    }

    /// Size of an indexed key
    pub fn size_of(&self, key: &str) -> Option<u64> {
        self.positions.get(key).map(|p| p.size_bytes)
    }

    /// Keys of one resource type
    pub fn keys_of_type(&self, resource_type: ResourceType) -> Vec<String> {
        self.by_type
            .get(&resource_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// (key, size) pairs, least recently accessed first
    pub fn lru_order(&self) -> Vec<(String, u64)> {
        self.by_access
            .iter()
            .map(|(_, _, key)| {
                let size = self.positions.get(key).map(|p| p.size_bytes).unwrap_or(0);
                (key.clone(), size)
            })
            .collect()
    }

    /// All indexed keys
    pub fn keys(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.by_access.clear();
        self.by_type.clear();
        self.positions.clear();
        self.total_bytes = 0;
    }
}
