//! Durable financial store
//!
//! A single SQLite file of extracted metrics, built in one pass over the bulk
//! dataset and queried read-only afterwards. Rebuilds stage a new file and swap
//! it in only when it holds data.

pub mod builder;
pub mod model;

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use builder::{BuildReport, INSERT_BATCH};
pub use model::{parse_closing_date, sort_most_recent_first, StoredBilan, MIN_CLOSING_DATE};

use crate::error::StoreError;
use crate::shards::ShardSource;
use crate::siren::Siren;

const READER_CONNECTIONS: u32 = 4;

const SECONDS_PER_DAY: u64 = 86_400;

pub struct FinancialStore {
    path: PathBuf,
    reader: RwLock<Option<SqlitePool>>,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove a database file and its journal companions.
async fn remove_database(path: &Path) -> Result<(), StoreError> {
    remove_if_present(path).await?;
    for suffix in ["-wal", "-shm", "-journal"] {
        remove_if_present(&sibling(path, suffix)).await?;
    }
    Ok(())
}

impl FinancialStore {
    /// Handle on the store at `path`. Nothing is opened until the first query.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_available(&self) -> bool {
        self.path.is_file()
    }

    async fn reader(&self) -> Result<SqlitePool, StoreError> {
        if let Some(pool) = self.reader.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut slot = self.reader.write().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        if !self.is_available() {
            return Err(StoreError::Missing(self.path.clone()));
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options)
            .await?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Close reader connections; the next query reopens them.
    pub async fn close(&self) {
        if let Some(pool) = self.reader.write().await.take() {
            pool.close().await;
        }
    }

    /// Rows for one company, most recent closing date first, at most `limit`.
    pub async fn query(&self, siren: Siren, limit: usize) -> Result<Vec<StoredBilan>, StoreError> {
        let pool = self.reader().await?;
        let rows = sqlx::query_as::<_, StoredBilan>(
            "SELECT * FROM bilans WHERE siren = ? ORDER BY date_cloture DESC LIMIT ?",
        )
        .bind(siren.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&pool)
        .await?;
        Ok(rows)
    }

    pub async fn row_count(&self) -> Result<u64, StoreError> {
        let pool = self.reader().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bilans")
            .fetch_one(&pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Whole days since the store file was last written
    pub async fn age_days(&self) -> Result<u64, StoreError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        Ok(age.as_secs() / SECONDS_PER_DAY)
    }

    /// Build the store in place, replacing whatever was there.
    pub async fn build(&self, source: &mut dyn ShardSource) -> Result<BuildReport, StoreError> {
        self.close().await;
        remove_database(&self.path).await?;
        builder::build_database(&self.path, source).await
    }

    /// Build into a staging file and swap it in only if rows were imported.
    ///
    /// On failure the current file is left exactly as it was.
    pub async fn rebuild(&self, source: &mut dyn ShardSource) -> Result<BuildReport, StoreError> {
        let staging = sibling(&self.path, ".building");
        remove_database(&staging).await?;

        let report = match builder::build_database(&staging, source).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Rebuild failed, keeping current store");
                remove_database(&staging).await?;
                return Err(e);
            }
        };

        if report.imported == 0 {
            warn!(
                path = %self.path.display(),
                shards = report.shards,
                "Rebuild imported nothing, keeping current store"
            );
            remove_database(&staging).await?;
            return Err(StoreError::EmptyRebuild(self.path.clone()));
        }

        // Readers are drained before the swap and reopen lazily on the new file
        let mut slot = self.reader.write().await;
        if let Some(pool) = slot.take() {
            pool.close().await;
        }
        tokio::fs::rename(&staging, &self.path).await?;
        for suffix in ["-wal", "-shm", "-journal"] {
            remove_if_present(&sibling(&self.path, suffix)).await?;
        }
        drop(slot);

        info!(
            path = %self.path.display(),
            imported = report.imported,
            "Rebuilt store swapped in"
        );
        Ok(report)
    }
}
