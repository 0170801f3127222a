//! Component configuration
//!
//! Every `Default` reads its environment variables and falls back to the
//! production values.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(fallback)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Registry FTP server publishing the bulk archives
#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Directory listed for `*comptes_annuels*.zip` files, the login directory by default
    pub dir: String,
}

impl FtpConfig {
    /// Read from the environment; `None` unless both credentials are set.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            host: env_nonempty("FTP_HOST").unwrap_or_else(|| "www.inpi.net".to_string()),
            port: env_or("FTP_PORT", 21),
            user: env_nonempty("FTP_USER")?,
            password: env_nonempty("FTP_PASSWORD")?,
            dir: env_nonempty("FTP_DIR").unwrap_or_else(|| ".".to_string()),
        })
    }
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("dir", &self.dir)
            .finish()
    }
}

/// Shard cache and bulk archive settings
///
/// The archive comes from `archive_url` when set, else from `ftp`, else from
/// the local `archive_path`.
#[derive(Debug, Clone)]
pub struct ShardStoreConfig {
    pub cache_dir: PathBuf,
    pub archive_url: Option<String>,
    pub ftp: Option<FtpConfig>,
    pub archive_path: PathBuf,
    /// Per network operation (connect, request, each transfer read)
    pub entry_timeout: Duration,
    pub download_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ShardStoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: env_or("RNE_CACHE_DIR", PathBuf::from("rne_cache")),
            archive_url: env_nonempty("RNE_ARCHIVE_URL"),
            ftp: FtpConfig::from_env(),
            archive_path: env_or("RNE_ARCHIVE_PATH", PathBuf::from("rne_stock.zip")),
            entry_timeout: Duration::from_secs(env_or("RNE_ARCHIVE_ENTRY_TIMEOUT_SECS", 120)),
            download_retries: env_or("RNE_DOWNLOAD_RETRIES", 3),
            retry_delay: Duration::from_millis(env_or("RNE_RETRY_DELAY_MS", 2000)),
        }
    }
}

/// Batch enrichment settings
#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub concurrency: usize,
    /// Evict each shard once its batch work is done
    pub limited_space: bool,
    pub max_bilans_per_siren: usize,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            concurrency: env_or("RNE_CONCURRENCY", 3usize).max(1),
            limited_space: env_flag("RNE_LIMITED_SPACE"),
            max_bilans_per_siren: env_or("RNE_MAX_BILANS", 10),
        }
    }
}

/// Identity-search API settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
    /// Attempts per call on HTTP 429
    pub max_rate_limit_retries: u32,
    /// Attempts per call on network errors, 5xx and 408
    pub max_transient_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("IDENTITY_API_BASE_URL")
                .unwrap_or_else(|_| "https://recherche-entreprises.api.gouv.fr".to_string()),
            base_delay: Duration::from_millis(env_or("IDENTITY_API_DELAY_MS", 500)),
            max_delay: Duration::from_millis(env_or("IDENTITY_API_MAX_DELAY_MS", 30_000)),
            timeout: Duration::from_secs(env_or("IDENTITY_API_TIMEOUT_SECS", 10)),
            max_rate_limit_retries: 3,
            max_transient_retries: 3,
        }
    }
}

/// Everything the pipeline needs, grouped per component
#[derive(Debug, Clone)]
pub struct RneConfig {
    pub index_path: PathBuf,
    pub db_path: PathBuf,
    pub shards: ShardStoreConfig,
    pub enricher: EnricherConfig,
    pub api: ApiConfig,
}

impl Default for RneConfig {
    fn default() -> Self {
        Self {
            index_path: env_or("RNE_INDEX_PATH", PathBuf::from("rne_siren_ranges.json")),
            db_path: env_or("RNE_DB_PATH", PathBuf::from("rne_finances.db")),
            shards: ShardStoreConfig::default(),
            enricher: EnricherConfig::default(),
            api: ApiConfig::default(),
        }
    }
}
