//! Sequential shard iteration for whole-dataset jobs (index and store builds)

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use zip::ZipArchive;

use super::archive::json_entries;
use crate::error::ShardError;

/// One raw shard document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDocument {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A stream of shard documents
#[async_trait]
pub trait ShardSource: Send {
    /// Next document; `None` once exhausted. A per-shard error does not end
    /// the stream unless [`ShardError::ends_source`] says so.
    async fn next_shard(&mut self) -> Option<Result<ShardDocument, ShardError>>;

    /// Total number of shards, when known up front
    fn total(&self) -> Option<usize> {
        None
    }
}

/// Every `*.json` file of a cache directory, in name order
#[derive(Debug)]
pub struct CacheDirSource {
    files: VecDeque<PathBuf>,
    total: usize,
}

impl CacheDirSource {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, ShardError> {
        let mut reader = tokio::fs::read_dir(dir.as_ref()).await?;
        let mut files = Vec::new();
        while let Some(item) = reader.next_entry().await? {
            let path = item.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let hidden = item.file_name().to_string_lossy().starts_with('.');
            if is_json && !hidden && item.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(Self {
            total: files.len(),
            files: files.into(),
        })
    }
}

#[async_trait]
impl ShardSource for CacheDirSource {
    async fn next_shard(&mut self) -> Option<Result<ShardDocument, ShardError>> {
        let path = self.files.pop_front()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(
            tokio::fs::read(&path)
                .await
                .map(|bytes| ShardDocument {
                    name: name.clone(),
                    bytes,
                })
                .map_err(|source| ShardError::Cache {
                    shard: name,
                    source,
                }),
        )
    }

    fn total(&self) -> Option<usize> {
        Some(self.total)
    }
}

/// Every JSON entry of a local zip archive, in archive order
pub struct ZipShardSource {
    archive: Option<ZipArchive<File>>,
    entries: VecDeque<(usize, String)>,
    total: usize,
}

impl ZipShardSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ShardError> {
        let path = path.as_ref().to_path_buf();
        let (archive, entries) = tokio::task::spawn_blocking(move || {
            let mut archive = ZipArchive::new(File::open(&path)?)?;
            let entries = json_entries(&mut archive)?;
            Ok::<_, ShardError>((archive, entries))
        })
        .await??;

        Ok(Self {
            archive: Some(archive),
            total: entries.len(),
            entries: entries.into(),
        })
    }
}

#[async_trait]
impl ShardSource for ZipShardSource {
    async fn next_shard(&mut self) -> Option<Result<ShardDocument, ShardError>> {
        let (index, name) = self.entries.pop_front()?;
        let mut archive = self.archive.take()?;

        let joined = tokio::task::spawn_blocking(move || {
            let read = archive
                .by_index(index)
                .map_err(ShardError::from)
                .and_then(|mut entry| {
                    let mut bytes = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut bytes)?;
                    Ok(bytes)
                });
            (archive, read)
        })
        .await;

        match joined {
            Ok((archive, read)) => {
                self.archive = Some(archive);
                Some(read.map(|bytes| ShardDocument { name, bytes }))
            }
            Err(e) => {
                // The archive handle went down with the task
                self.entries.clear();
                Some(Err(ShardError::Join(e)))
            }
        }
    }

    fn total(&self) -> Option<usize> {
        Some(self.total)
    }
}

/// Documents held in memory
#[derive(Debug, Default)]
pub struct MemoryShardSource {
    documents: VecDeque<Result<ShardDocument, String>>,
    total: usize,
}

impl MemoryShardSource {
    pub fn new<N, B>(documents: impl IntoIterator<Item = (N, B)>) -> Self
    where
        N: Into<String>,
        B: Into<Vec<u8>>,
    {
        let documents: VecDeque<_> = documents
            .into_iter()
            .map(|(name, bytes)| {
                Ok(ShardDocument {
                    name: name.into(),
                    bytes: bytes.into(),
                })
            })
            .collect();
        Self {
            total: documents.len(),
            documents,
        }
    }

    /// Queue a shard that fails to read
    pub fn push_unreadable(&mut self, shard: impl Into<String>) {
        self.documents.push_back(Err(shard.into()));
        self.total += 1;
    }
}

#[async_trait]
impl ShardSource for MemoryShardSource {
    async fn next_shard(&mut self) -> Option<Result<ShardDocument, ShardError>> {
        Some(self.documents.pop_front()?.map_err(|shard| ShardError::Cache {
            shard,
            source: std::io::Error::new(std::io::ErrorKind::Other, "unreadable shard"),
        }))
    }

    fn total(&self) -> Option<usize> {
        Some(self.total)
    }
}
