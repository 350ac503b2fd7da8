//! Filesystem durable store
//!
//! One JSON record per key under a cache directory. Writes go to a temp file
//! and are renamed into place, so a crash never leaves a half-written record
//! visible. The indexes live in memory and are rebuilt from the directory on
//! open; files that cannot be decoded are removed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::index::RecordIndex;
use super::{DurableStore, StoreRecord, StoreStats};
use crate::cache::entry::{CacheKey, ResourceType};
use crate::error::{Error, Result};

/// errno for "no space left on device"
const ENOSPC: i32 = 28;

/// Directory-backed [`DurableStore`]
pub struct FsStore {
    dir: PathBuf,
    index: Mutex<RecordIndex>,
    quota_bytes: Option<u64>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl FsStore {
    /// Open (or create) a cache directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_quota(dir, None).await
    }

    /// Open a cache directory that rejects writes beyond `quota_bytes`
    pub async fn open_with_quota(dir: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create cache directory", &dir, e))?;

        let mut index = RecordIndex::new();
        let mut listing = fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("list cache directory", &dir, e))?;

        while let Some(dirent) = listing
            .next_entry()
            .await
            .map_err(|e| io_error("list cache directory", &dir, e))?
        {
            let path = dirent.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {}
                Some("tmp") => {
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
                _ => continue,
            }

            let found_name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
            match load_record(&path).await {
                Ok(record) if file_name(&record.key) == found_name => {
                    index.insert(&record);
                }
                Ok(record) => {
                    warn!(
                        path = %path.display(),
                        key = %record.key,
                        "record stored under wrong file name, removing"
                    );
                    let _ = fs::remove_file(&path).await;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable cache record, removing");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        info!(
            dir = %dir.display(),
            records = index.len(),
            bytes = index.total_bytes(),
            "opened persistent cache directory"
        );

        Ok(Self {
            dir,
            index: Mutex::new(index),
            quota_bytes,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        file_name(key).map(|name| self.dir.join(name))
    }

    async fn remove_file(&self, key: &str) -> Result<()> {
        let Some(path) = self.path_for(key) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete record", &path, e)),
        }
    }
}

/// `piece:42` -> `piece_42.json`; `None` for anything that is not a cache key
fn file_name(key: &str) -> Option<String> {
    let key: CacheKey = key.parse().ok()?;
    Some(format!("{}_{}.json", key.resource_type(), key.id()))
}

async fn load_record(path: &Path) -> Result<StoreRecord> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| io_error("read record", path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::PersistentIo(format!("{} {}: {}", action, path.display(), e))
}

#[async_trait]
impl DurableStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !self.index.lock().await.contains(key) {
            return Ok(None);
        }
        let Some(path) = self.path_for(key) else {
            return Ok(None);
        };

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read record", &path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::CorruptEntry {
                key: key.to_string(),
                reason: format!("undecodable record: {}", e),
            })
    }

    async fn put(&self, record: StoreRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let path = self
            .path_for(&record.key)
            .ok_or_else(|| Error::InvalidKey(record.key.clone()))?;

        let mut index = self.index.lock().await;
        if let Some(quota) = self.quota_bytes {
            let base = index.total_bytes() - index.size_of(&record.key).unwrap_or(0);
            if base + record.size_bytes > quota {
                return Err(Error::QuotaExceeded {
                    needed: record.size_bytes,
                    available: quota.saturating_sub(base),
                });
            }
        }

        let body = serde_json::to_vec(&record)?;
        let tmp = path.with_extension("tmp");
        let write = async {
            fs::write(&tmp, &body).await?;
            fs::rename(&tmp, &path).await?;
            Ok::<(), std::io::Error>(())
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            if e.raw_os_error() == Some(ENOSPC) {
                return Err(Error::QuotaExceeded {
                    needed: record.size_bytes,
                    available: 0,
                });
            }
            return Err(io_error("write record", &path, e));
        }

        index.insert(&record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut index = self.index.lock().await;
        // File first: a record left on disk must stay indexed
        self.remove_file(key).await?;
        Ok(index.remove(key).is_some())
    }

    async fn delete_by_type(&self, resource_type: ResourceType) -> Result<usize> {
        let mut index = self.index.lock().await;
        let keys = index.keys_of_type(resource_type);
        let mut removed = 0;
        for key in &keys {
            if let Err(e) = self.remove_file(key).await {
                self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
                return Err(e);
            }
            index.remove(key);
            removed += 1;
        }
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        for key in index.keys() {
            self.remove_file(&key).await?;
            index.remove(&key);
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.index.lock().await.keys())
    }

    async fn scan_by_access(&self) -> Result<Vec<(String, u64)>> {
        Ok(self.index.lock().await.lru_order())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.index.lock().await.len())
    }

    async fn total_size(&self) -> Result<u64> {
        Ok(self.index.lock().await.total_bytes())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheEntry, Payload};
    use assert_matches::assert_matches;

    fn record(kind: ResourceType, id: u64) -> StoreRecord {
        let entry = CacheEntry::new(
            CacheKey::new(kind, id),
            Payload::encoded("data:image/png;base64,YWJjZA=="),
        );
        StoreRecord::from(&entry)
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsStore::open(dir.path()).await.unwrap();
            store.put(record(ResourceType::Piece, 1)).await.unwrap();
            store.put(record(ResourceType::Collection, 2)).await.unwrap();
        }

        let store = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.total_size().await.unwrap(), 8);
        let loaded = store.get("collection:2").await.unwrap().unwrap();
        assert_eq!(loaded.id, 2);
        assert!(dir.path().join("collection_2.json").exists());
    }

    #[tokio::test]
    async fn test_garbage_files_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("piece_9.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("piece_8.tmp"), b"partial").unwrap();

        let store = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!dir.path().join("piece_9.json").exists());
        assert!(!dir.path().join("piece_8.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_by_type_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        store.put(record(ResourceType::Piece, 1)).await.unwrap();
        store.put(record(ResourceType::PostAttachment, 1)).await.unwrap();

        assert_eq!(store.delete_by_type(ResourceType::PostAttachment).await.unwrap(), 1);
        assert!(!dir.path().join("post_1.json").exists());
        assert_eq!(store.list_keys().await.unwrap(), vec!["piece:1".to_string()]);

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!dir.path().join("piece_1.json").exists());
    }

    #[tokio::test]
    async fn test_failed_unlink_keeps_record_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        store.put(record(ResourceType::Piece, 1)).await.unwrap();
        store.put(record(ResourceType::Piece, 2)).await.unwrap();

        // A directory in place of the record file cannot be unlinked
        let path = dir.path().join("piece_1.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert_matches!(store.delete("piece:1").await, Err(Error::PersistentIo(_)));
        assert_eq!(store.count().await.unwrap(), 2);

        assert!(store.delete_by_type(ResourceType::Piece).await.is_err());
        assert!(store.list_keys().await.unwrap().contains(&"piece:1".to_string()));
        assert_eq!(store.total_size().await.unwrap(), 4 * store.count().await.unwrap() as u64);
    }

    #[tokio::test]
    async fn test_quota_and_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open_with_quota(dir.path(), Some(4)).await.unwrap();
        store.put(record(ResourceType::Piece, 1)).await.unwrap();
        assert_matches!(
            store.put(record(ResourceType::Piece, 2)).await,
            Err(Error::QuotaExceeded { .. })
        );

        // Path-like keys never reach the filesystem
        assert!(store.get("../etc/passwd").await.unwrap().is_none());
        assert!(!store.delete("../etc/passwd").await.unwrap());
    }
}
