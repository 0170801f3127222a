//! Bulk archive from the registry's FTP server
//!
//! The server publishes dated `*comptes_annuels*.zip` files side by side. The
//! latest by name is downloaded to a temporary file on the blocking pool.

use std::io::{self, Write};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::archive::{ArchiveFile, ArchiveSource};
use crate::config::FtpConfig;
use crate::error::ShardError;

const ARCHIVE_MARKER: &str = "comptes_annuels";

/// The FTP operations archive selection needs
pub trait FtpSession {
    /// File names listed in `dir`, which becomes the working directory.
    fn archive_names(&mut self, dir: &str) -> Result<Vec<String>, ShardError>;

    /// Copy a remote file into `out`, returning the byte count.
    fn download(&mut self, name: &str, out: &mut dyn Write) -> Result<u64, ShardError>;
}

impl FtpSession for FtpStream {
    fn archive_names(&mut self, dir: &str) -> Result<Vec<String>, ShardError> {
        self.cwd(dir)?;
        Ok(self.nlst(None)?)
    }

    fn download(&mut self, name: &str, out: &mut dyn Write) -> Result<u64, ShardError> {
        let mut stream = self.retr_as_stream(name)?;
        let copied = io::copy(&mut stream, out)?;
        self.finalize_retr_stream(stream)?;
        Ok(copied)
    }
}

/// Most recent annual-accounts archive among `names`. Names embed their
/// publication date, so the greatest name is the latest.
pub fn latest_archive(names: &[String]) -> Option<&str> {
    names
        .iter()
        .map(String::as_str)
        .filter(|name| name.contains(ARCHIVE_MARKER) && name.ends_with(".zip"))
        .max()
}

/// List `dir` and download its latest archive into `download_dir`.
pub fn download_latest(
    session: &mut dyn FtpSession,
    dir: &str,
    download_dir: &Path,
) -> Result<NamedTempFile, ShardError> {
    let names = session.archive_names(dir)?;
    let latest = latest_archive(&names)
        .ok_or_else(|| ShardError::NoArchive {
            dir: dir.to_string(),
        })?
        .to_string();
    info!(archive = %latest, listed = names.len(), "Downloading bulk archive over FTP");

    std::fs::create_dir_all(download_dir)?;
    let mut temp = tempfile::Builder::new()
        .prefix("rne-archive-")
        .suffix(".zip")
        .tempfile_in(download_dir)?;
    let bytes = session.download(&latest, temp.as_file_mut())?;
    temp.as_file_mut().flush()?;

    info!(bytes, path = %temp.path().display(), "Archive downloaded");
    Ok(temp)
}

fn connect(config: &FtpConfig, timeout: Duration) -> Result<FtpStream, ShardError> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("cannot resolve FTP host '{}'", config.host),
            )
        })?;
    let mut stream = FtpStream::connect_timeout(addr, timeout)?;
    stream.get_ref().set_read_timeout(Some(timeout))?;
    stream.login(&config.user, &config.password)?;
    stream.transfer_type(FileType::Binary)?;
    debug!(host = %config.host, user = %config.user, "FTP session open");
    Ok(stream)
}

/// Latest archive on the registry FTP server
pub struct FtpArchiveSource {
    config: FtpConfig,
    download_dir: PathBuf,
    /// Connect and per-read timeout
    timeout: Duration,
}

impl FtpArchiveSource {
    pub fn new(config: FtpConfig, download_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            config,
            download_dir: download_dir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ArchiveSource for FtpArchiveSource {
    async fn fetch_archive(&self) -> Result<ArchiveFile, ShardError> {
        let config = self.config.clone();
        let download_dir = self.download_dir.clone();
        let timeout = self.timeout;
        info!(archive = %self.describe(), "Connecting to archive FTP server");

        let temp = tokio::task::spawn_blocking(move || {
            let mut session = connect(&config, timeout)?;
            let downloaded = download_latest(&mut session, &config.dir, &download_dir);
            if let Err(e) = session.quit() {
                debug!(error = %e, "FTP quit failed");
            }
            downloaded
        })
        .await??;
        Ok(ArchiveFile::Temp(temp))
    }

    fn describe(&self) -> String {
        let dir = self.config.dir.trim_start_matches('/');
        format!("ftp://{}:{}/{}", self.config.host, self.config.port, dir)
    }
}
