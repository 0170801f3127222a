//! Bulk archive access
//!
//! The remote server only exposes the whole zip archive, so a shard miss means
//! downloading the archive to a temporary file and pulling one entry out of it.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::ShardError;

const PROGRESS_EVERY_BYTES: u64 = 100 * 1024 * 1024;

/// A fetched archive. Temporary downloads are removed on drop.
#[derive(Debug)]
pub enum ArchiveFile {
    Temp(NamedTempFile),
    Local(PathBuf),
}

impl ArchiveFile {
    pub fn path(&self) -> &Path {
        match self {
            Self::Temp(file) => file.path(),
            Self::Local(path) => path,
        }
    }
}

/// Where the bulk archive comes from
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch_archive(&self) -> Result<ArchiveFile, ShardError>;

    fn describe(&self) -> String;
}

/// Archive downloaded over HTTP(S)
pub struct HttpArchiveSource {
    client: Client,
    url: Url,
    download_dir: PathBuf,
    timeout: Duration,
}

impl HttpArchiveSource {
    pub fn new(
        url: &str,
        download_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, ShardError> {
        let url = Url::parse(url).map_err(|e| {
            ShardError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid archive URL '{}': {}", url, e),
            ))
        })?;
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| network_error(&e))?;

        Ok(Self {
            client,
            url,
            download_dir: download_dir.into(),
            timeout,
        })
    }
}

fn network_error(e: &reqwest::Error) -> ShardError {
    ShardError::TransientNetwork {
        attempts: 1,
        message: e.to_string(),
    }
}

fn timed_out(what: &str, timeout: Duration) -> ShardError {
    ShardError::TransientNetwork {
        attempts: 1,
        message: format!("{} timed out after {:?}", what, timeout),
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn fetch_archive(&self) -> Result<ArchiveFile, ShardError> {
        info!(url = %self.url, "Downloading bulk archive");

        let request = self.client.get(self.url.clone()).send();
        let mut response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| timed_out("archive request", self.timeout))?
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ShardError::HttpStatus {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix("rne-archive-")
            .suffix(".zip")
            .tempfile_in(&self.download_dir)?;
        let mut out = tokio::fs::File::from_std(temp.reopen()?);

        let expected = response.content_length();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_EVERY_BYTES;
        loop {
            let chunk = tokio::time::timeout(self.timeout, response.chunk())
                .await
                .map_err(|_| timed_out("archive transfer", self.timeout))?
                .map_err(|e| network_error(&e))?;
            let Some(chunk) = chunk else {
                break;
            };
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written >= next_report {
                info!(
                    written_mb = written / (1024 * 1024),
                    expected_bytes = ?expected,
                    "Archive download progress"
                );
                next_report += PROGRESS_EVERY_BYTES;
            }
        }
        out.flush().await?;

        info!(bytes = written, path = %temp.path().display(), "Archive downloaded");
        Ok(ArchiveFile::Temp(temp))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Archive already present on local disk
#[derive(Debug, Clone)]
pub struct LocalArchiveSource {
    path: PathBuf,
}

impl LocalArchiveSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ArchiveSource for LocalArchiveSource {
    async fn fetch_archive(&self) -> Result<ArchiveFile, ShardError> {
        tokio::fs::metadata(&self.path).await?;
        Ok(ArchiveFile::Local(self.path.clone()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn base_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

/// Archive index of the entry for `shard`: exact path first, then file name.
pub(crate) fn find_entry(archive: &ZipArchive<File>, shard: &str) -> Option<usize> {
    archive.index_for_name(shard).or_else(|| {
        archive
            .file_names()
            .find(|name| base_name(name) == shard)
            .and_then(|name| archive.index_for_name(name))
    })
}

/// Read one shard's bytes out of the archive (on the blocking pool).
pub async fn extract_entry(archive: &Path, shard: &str) -> Result<Vec<u8>, ShardError> {
    let path = archive.to_path_buf();
    let shard = shard.to_string();
    tokio::task::spawn_blocking(move || {
        let mut zip = ZipArchive::new(File::open(&path)?)?;
        let index = find_entry(&zip, &shard).ok_or_else(|| ShardError::EntryMissing {
            shard: shard.clone(),
        })?;
        let mut entry = zip.by_index(index).map_err(|e| match e {
            ZipError::FileNotFound => ShardError::EntryMissing {
                shard: shard.clone(),
            },
            other => ShardError::Archive(other),
        })?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        debug!(shard = %shard, bytes = bytes.len(), "Extracted shard from archive");
        Ok(bytes)
    })
    .await?
}

/// Names of every JSON shard in the archive, in archive order
pub(crate) fn json_entries(
    archive: &mut ZipArchive<File>,
) -> Result<Vec<(usize, String)>, ShardError> {
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if entry.is_dir() || !entry.name().ends_with(".json") {
            continue;
        }
        entries.push((index, base_name(entry.name()).to_string()));
    }
    Ok(entries)
}
