//! Error handling for the RNE finances pipeline
//!
//! One `thiserror` enum per component, unified under [`RneError`] so callers
//! that drive several components can propagate with `?`.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum RneError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Range index errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Shard ranges overlap: '{first}' [{first_min}..={first_max}] and '{second}' [{second_min}..={second_max}]")]
    OverlappingRanges {
        first: String,
        first_min: String,
        first_max: String,
        second: String,
        second_min: String,
        second_max: String,
    },

    #[error("Invalid range for shard '{shard}': min {min} is greater than max {max}")]
    InvertedRange {
        shard: String,
        min: String,
        max: String,
    },

    #[error("Index file {path} could not be read: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Index file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Shard source failed while indexing: {0}")]
    Source(#[from] ShardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shard fetch, cache and parse errors
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Network failure after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("Archive server returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Shard '{shard}' is not present in the archive")]
    EntryMissing { shard: String },

    #[error("Shard '{shard}' could not be parsed: {source}")]
    Parse {
        shard: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("No comptes_annuels archive listed in '{dir}'")]
    NoArchive { dir: String },

    #[error("Cache error for '{shard}': {source}")]
    Cache {
        shard: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShardError {
    /// Whether a retry of the same network operation can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408,
            Self::Ftp(suppaftp::FtpError::ConnectionError(_)) => true,
            _ => false,
        }
    }

    /// Whether the source that produced this error can yield nothing further.
    pub fn ends_source(&self) -> bool {
        matches!(self, Self::Join(_))
    }
}

/// Financial store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Financial database not found at {0}")]
    Missing(PathBuf),

    #[error("Rebuild imported no records; previous database kept at {0}")]
    EmptyRebuild(PathBuf),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Shard source failed: {0}")]
    Source(#[from] ShardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity-search API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Rate limited by the API after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    #[error("Network failure after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("API rejected the request with HTTP {status}: {body}")]
    Client { status: u16, body: String },

    #[error("Failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid API URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Failed to create HTTP client: {0}")]
    Setup(String),
}

/// Why a record was dropped during a store build
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchemaViolation {
    #[error("identifier is not exactly 9 digits")]
    InvalidSiren,

    #[error("closing date is missing or unreadable")]
    MissingClosingDate,

    #[error("closing date precedes the retention cutoff")]
    BeforeCutoff,
}

pub type Result<T> = std::result::Result<T, RneError>;
