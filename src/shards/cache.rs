//! Shard cache backends
//!
//! The cache stores one JSON document per shard, keyed by shard id. The
//! filesystem backend is the production one; the memory backend serves tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ShardError;

/// One cached shard and its size on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub shard: String,
    pub bytes: u64,
}

/// Storage for fetched shard documents
#[async_trait]
pub trait ShardCache: Send + Sync {
    /// Cached document, or `None` on a miss
    async fn get(&self, shard: &str) -> Result<Option<Vec<u8>>, ShardError>;

    /// Store (or replace) a document
    async fn put(&self, shard: &str, bytes: &[u8]) -> Result<(), ShardError>;

    /// Remove a document. Returns whether anything was removed.
    async fn evict(&self, shard: &str) -> Result<bool, ShardError>;

    /// All cached documents
    async fn list(&self) -> Result<Vec<CacheEntry>, ShardError>;

    /// Remove every document, returning how many were removed
    async fn clear(&self) -> Result<usize, ShardError> {
        let mut removed = 0;
        for entry in self.list().await? {
            if self.evict(&entry.shard).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Filesystem cache: one `<shard>` file per shard inside `dir`
#[derive(Debug, Clone)]
pub struct FsShardCache {
    dir: PathBuf,
}

impl FsShardCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, shard: &str) -> Result<PathBuf, ShardError> {
        let plain = !shard.is_empty()
            && shard != "."
            && shard != ".."
            && !shard.contains(['/', '\\']);
        if !plain {
            return Err(ShardError::Cache {
                shard: shard.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "shard id is not a file name"),
            });
        }
        Ok(self.dir.join(shard))
    }
}

fn cache_error(shard: &str) -> impl FnOnce(io::Error) -> ShardError + '_ {
    move |source| ShardError::Cache {
        shard: shard.to_string(),
        source,
    }
}

#[async_trait]
impl ShardCache for FsShardCache {
    async fn get(&self, shard: &str) -> Result<Option<Vec<u8>>, ShardError> {
        let path = self.entry_path(shard)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(cache_error(shard)(e)),
        }
    }

    async fn put(&self, shard: &str, bytes: &[u8]) -> Result<(), ShardError> {
        let path = self.entry_path(shard)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(cache_error(shard))?;

        // Write-then-rename so readers never see a partial document
        let staging = self.dir.join(format!(".{}.partial", shard));
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(cache_error(shard))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(cache_error(shard))?;
        Ok(())
    }

    async fn evict(&self, shard: &str) -> Result<bool, ShardError> {
        let path = self.entry_path(shard)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(cache_error(shard)(e)),
        }
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, ShardError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ShardError::Io(e)),
        };

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let metadata = item.metadata().await?;
            if metadata.is_file() {
                entries.push(CacheEntry {
                    shard: name,
                    bytes: metadata.len(),
                });
            }
        }
        entries.sort_by(|a, b| a.shard.cmp(&b.shard));
        Ok(entries)
    }
}

/// In-memory cache
#[derive(Debug, Default)]
pub struct MemoryShardCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryShardCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, shard: &str) -> bool {
        self.entries.read().await.contains_key(shard)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ShardCache for MemoryShardCache {
    async fn get(&self, shard: &str) -> Result<Option<Vec<u8>>, ShardError> {
        Ok(self.entries.read().await.get(shard).cloned())
    }

    async fn put(&self, shard: &str, bytes: &[u8]) -> Result<(), ShardError> {
        self.entries
            .write()
            .await
            .insert(shard.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn evict(&self, shard: &str) -> Result<bool, ShardError> {
        Ok(self.entries.write().await.remove(shard).is_some())
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, ShardError> {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(shard, bytes)| CacheEntry {
                shard: shard.clone(),
                bytes: bytes.len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.shard.cmp(&b.shard));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsShardCache::new(dir.path().join("cache"));

        assert_eq!(cache.get("s1.json").await.unwrap(), None);
        cache.put("s1.json", b"[]").await.unwrap();
        assert_eq!(cache.get("s1.json").await.unwrap(), Some(b"[]".to_vec()));

        let listed = cache.list().await.unwrap();
        assert_eq!(
            listed,
            vec![CacheEntry {
                shard: "s1.json".to_string(),
                bytes: 2
            }]
        );
    }

    #[tokio::test]
    async fn test_fs_evict_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsShardCache::new(dir.path());
        cache.put("s1.json", b"[]").await.unwrap();

        assert!(cache.evict("s1.json").await.unwrap());
        assert!(!cache.evict("s1.json").await.unwrap());
        assert!(!cache.evict("never.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsShardCache::new(dir.path());
        assert!(cache.put("../escape.json", b"[]").await.is_err());
        assert!(cache.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsShardCache::new(dir.path().join("absent"));
        assert!(cache.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = MemoryShardCache::new();
        cache.put("a.json", b"[]").await.unwrap();
        cache.put("b.json", b"[]").await.unwrap();
        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(cache.is_empty().await);
    }
}
