//! Shard fetching, caching and eviction
//!
//! [`ShardStore`] answers "give me the records of shard X": from the cache when
//! possible, otherwise by downloading the bulk archive and extracting the
//! entry. Cached shards are always kept in the compact encoding; legacy
//! entries are migrated the first time they are read.

pub mod archive;
pub mod cache;
pub mod ftp;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use archive::{ArchiveFile, ArchiveSource, HttpArchiveSource, LocalArchiveSource};
pub use cache::{CacheEntry, FsShardCache, MemoryShardCache, ShardCache};
pub use ftp::{latest_archive, FtpArchiveSource, FtpSession};
pub use source::{CacheDirSource, MemoryShardSource, ShardDocument, ShardSource, ZipShardSource};

use crate::config::ShardStoreConfig;
use crate::error::ShardError;
use crate::extract::to_compact;
use crate::record::Shard;

/// Outcome of a cache-wide legacy migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub already_compact: usize,
    pub failed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Cache-backed access to individual shards of the bulk archive
pub struct ShardStore {
    cache: Arc<dyn ShardCache>,
    archive: Arc<dyn ArchiveSource>,
    retries: u32,
    retry_delay: Duration,
}

/// The configured bulk archive: HTTP(S) URL, then FTP server, then local file.
pub fn archive_source(config: &ShardStoreConfig) -> Result<Arc<dyn ArchiveSource>, ShardError> {
    if let Some(url) = &config.archive_url {
        return Ok(Arc::new(HttpArchiveSource::new(
            url,
            &config.cache_dir,
            config.entry_timeout,
        )?));
    }
    if let Some(ftp) = &config.ftp {
        return Ok(Arc::new(FtpArchiveSource::new(
            ftp.clone(),
            &config.cache_dir,
            config.entry_timeout,
        )));
    }
    Ok(Arc::new(LocalArchiveSource::new(&config.archive_path)))
}

impl ShardStore {
    pub fn new(cache: Arc<dyn ShardCache>, archive: Arc<dyn ArchiveSource>) -> Self {
        let defaults = ShardStoreConfig::default();
        Self {
            cache,
            archive,
            retries: defaults.download_retries,
            retry_delay: defaults.retry_delay,
        }
    }

    /// Filesystem cache plus the configured archive (URL if set, else local path).
    pub fn from_config(config: &ShardStoreConfig) -> Result<Self, ShardError> {
        let cache: Arc<dyn ShardCache> = Arc::new(FsShardCache::new(&config.cache_dir));
        let archive = archive_source(config)?;
        Ok(Self::new(cache, archive).with_retry(config.download_retries, config.retry_delay))
    }

    pub fn with_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn cache(&self) -> &Arc<dyn ShardCache> {
        &self.cache
    }

    /// Records of one shard, in compact form.
    ///
    /// With `use_cache` false the cache is neither read nor written.
    pub async fn fetch(&self, shard_id: &str, use_cache: bool) -> Result<Shard, ShardError> {
        if use_cache {
            if let Some(shard) = self.from_cache(shard_id).await? {
                return Ok(shard);
            }
        }

        let bytes = self.download_entry(shard_id).await?;
        let shard = compacted(Shard::parse(shard_id, &bytes)?);

        if use_cache {
            self.cache.put(shard_id, &shard.to_json()?).await?;
            debug!(shard = %shard_id, records = shard.records.len(), "Shard cached");
        }
        Ok(shard)
    }

    async fn from_cache(&self, shard_id: &str) -> Result<Option<Shard>, ShardError> {
        let Some(bytes) = self.cache.get(shard_id).await? else {
            debug!(shard = %shard_id, "Cache miss");
            return Ok(None);
        };

        let shard = match Shard::parse(shard_id, &bytes) {
            Ok(shard) => shard,
            Err(e) => {
                warn!(
                    shard = %shard_id,
                    error = %e,
                    "Cached shard is unreadable, downloading again"
                );
                return Ok(None);
            }
        };
        debug!(shard = %shard_id, "Cache hit");

        if !shard.has_legacy_records() {
            return Ok(Some(shard));
        }

        let shard = compacted(shard);
        let rewritten = shard.to_json()?;
        self.cache.put(shard_id, &rewritten).await?;
        info!(
            shard = %shard_id,
            bytes_before = bytes.len(),
            bytes_after = rewritten.len(),
            "Migrated cached shard to compact encoding"
        );
        Ok(Some(shard))
    }

    async fn download_entry(&self, shard_id: &str) -> Result<Vec<u8>, ShardError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.archive.fetch_archive().await {
                Ok(file) => archive::extract_entry(file.path(), shard_id).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    warn!(
                        shard = %shard_id,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "Archive fetch failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ShardError::TransientNetwork {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop a shard from the cache. Absent entries are not an error.
    pub async fn evict(&self, shard_id: &str) -> Result<bool, ShardError> {
        let removed = self.cache.evict(shard_id).await?;
        if removed {
            debug!(shard = %shard_id, "Shard evicted");
        }
        Ok(removed)
    }

    /// Convert every legacy cache entry to the compact encoding.
    pub async fn migrate_cache(&self) -> Result<MigrationReport, ShardError> {
        let mut report = MigrationReport::default();
        for entry in self.cache.list().await? {
            let Some(bytes) = self.cache.get(&entry.shard).await? else {
                continue;
            };
            let shard = match Shard::parse(&entry.shard, &bytes) {
                Ok(shard) => shard,
                Err(e) => {
                    warn!(shard = %entry.shard, error = %e, "Skipping unreadable cache entry");
                    report.failed += 1;
                    continue;
                }
            };
            if !shard.has_legacy_records() {
                report.already_compact += 1;
                continue;
            }

            let rewritten = compacted(shard).to_json()?;
            self.cache.put(&entry.shard, &rewritten).await?;
            report.migrated += 1;
            report.bytes_before += bytes.len() as u64;
            report.bytes_after += rewritten.len() as u64;
        }
        info!(
            migrated = report.migrated,
            already_compact = report.already_compact,
            failed = report.failed,
            "Cache migration finished"
        );
        Ok(report)
    }
}

fn compacted(shard: Shard) -> Shard {
    if !shard.has_legacy_records() {
        return shard;
    }
    Shard {
        records: shard.records.iter().map(to_compact).collect(),
        name: shard.name,
    }
}
