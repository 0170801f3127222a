//! RNE financial statements CLI
//!
//! Operator commands for the range index, the financial store and the shard
//! cache, plus one-off lookups.
//!
//! # Usage
//!
//! ```bash
//! # Index every shard of a local archive
//! rne-cli index --from-archive stock_comptes_annuels.zip
//!
//! # Build the store from the shard cache
//! rne-cli build-db --from-cache rne_cache
//!
//! # Rebuild from the configured archive, keeping the old store on failure
//! RNE_ARCHIVE_URL=https://example.org/stock.zip rne-cli update-db
//!
//! # Same, from the latest archive on the registry FTP server
//! FTP_USER=... FTP_PASSWORD=... rne-cli update-db
//!
//! # Lookups
//! rne-cli finances 552100554 --years 3
//! rne-cli enrich 552100554 005880596 --limited-space
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use rne_finances::enricher::BatchEnricher;
use rne_finances::shards::{
    archive_source, ArchiveFile, ArchiveSource, CacheDirSource, FsShardCache, HttpArchiveSource,
    ShardCache, ShardSource, ShardStore, ZipShardSource,
};
use rne_finances::{
    EnrichmentService, FinancialStore, RangeIndex, RneConfig, Shard, StoreError,
};

#[derive(Parser)]
#[command(name = "rne-cli")]
#[command(version)]
#[command(about = "Range index, financial store and shard cache for the RNE annual-accounts dataset")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the SIREN range index
    Index {
        /// Read shards from a local zip archive
        #[arg(long, conflicts_with = "from_cache")]
        from_archive: Option<PathBuf>,

        /// Read shards from a cache directory (default: RNE_CACHE_DIR)
        #[arg(long)]
        from_cache: Option<PathBuf>,

        /// Index file to write (default: RNE_INDEX_PATH)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Build the financial store in place
    BuildDb {
        /// Zip archive path or http(s) URL
        #[arg(long, conflicts_with_all = ["from_cache", "remote"])]
        from_archive: Option<String>,

        /// Read shards from a cache directory (default: RNE_CACHE_DIR)
        #[arg(long, conflicts_with = "remote")]
        from_cache: Option<PathBuf>,

        /// Fetch the configured archive (RNE_ARCHIVE_URL, FTP_*, RNE_ARCHIVE_PATH)
        #[arg(long)]
        remote: bool,
    },

    /// Rebuild the store from the configured archive and swap it in
    UpdateDb,

    /// Convert legacy cache entries to the compact encoding
    MigrateCache,

    /// Show shard cache usage
    CacheStatus,

    /// Delete every cached shard
    CacheClear,

    /// Statements of one company from the store
    Finances {
        siren: String,

        /// Number of statements to return
        #[arg(long, default_value_t = 5)]
        years: usize,
    },

    /// Look companies up through the shards
    Enrich {
        #[arg(required = true)]
        sirens: Vec<String>,

        /// Evict each shard once processed
        #[arg(long)]
        limited_space: bool,

        /// Shards processed in parallel (default: RNE_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Statements kept per company (default: RNE_MAX_BILANS)
        #[arg(long)]
        years: Option<usize>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RneConfig::default();

    let result = match cli.command {
        Commands::Index {
            from_archive,
            from_cache,
            output,
        } => cmd_index(&config, from_archive, from_cache, output, cli.json).await,
        Commands::BuildDb { remote: true, .. } => cmd_build_db_remote(&config, cli.json).await,
        Commands::BuildDb {
            from_archive,
            from_cache,
            remote: false,
        } => cmd_build_db(&config, from_archive, from_cache, cli.json).await,
        Commands::UpdateDb => cmd_update_db(&config, cli.json).await,
        Commands::MigrateCache => cmd_migrate_cache(&config, cli.json).await,
        Commands::CacheStatus => cmd_cache_status(&config, cli.json).await,
        Commands::CacheClear => cmd_cache_clear(&config, cli.json).await,
        Commands::Finances { siren, years } => cmd_finances(&config, &siren, years).await,
        Commands::Enrich {
            sirens,
            limited_space,
            concurrency,
            years,
        } => cmd_enrich(&config, &sirens, limited_space, concurrency, years, cli.json).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Open a shard source. The returned archive handle must outlive the source.
async fn open_source(
    config: &RneConfig,
    from_archive: Option<String>,
    from_cache: Option<PathBuf>,
) -> Result<(Box<dyn ShardSource>, Option<ArchiveFile>)> {
    let Some(archive) = from_archive else {
        let dir = from_cache.unwrap_or_else(|| config.shards.cache_dir.clone());
        let source = CacheDirSource::open(&dir)
            .await
            .with_context(|| format!("Failed to read cache directory {}", dir.display()))?;
        return Ok((Box::new(source), None));
    };

    let file = if archive.starts_with("http://") || archive.starts_with("https://") {
        HttpArchiveSource::new(&archive, &config.shards.cache_dir, config.shards.entry_timeout)?
            .fetch_archive()
            .await
            .with_context(|| format!("Failed to download {}", archive))?
    } else {
        ArchiveFile::Local(PathBuf::from(&archive))
    };
    open_archive_file(file).await
}

async fn open_archive_file(
    file: ArchiveFile,
) -> Result<(Box<dyn ShardSource>, Option<ArchiveFile>)> {
    let source = ZipShardSource::open(file.path())
        .await
        .with_context(|| format!("Failed to open archive {}", file.path().display()))?;
    Ok((Box::new(source), Some(file)))
}

/// Fetch the archive the configuration points at and open it.
async fn open_configured(
    config: &RneConfig,
) -> Result<(Box<dyn ShardSource>, Option<ArchiveFile>)> {
    let archive = archive_source(&config.shards)?;
    let file = archive
        .fetch_archive()
        .await
        .with_context(|| format!("Failed to fetch {}", archive.describe()))?;
    open_archive_file(file).await
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

async fn cmd_index(
    config: &RneConfig,
    from_archive: Option<PathBuf>,
    from_cache: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let archive = from_archive.map(|p| p.display().to_string());
    let (mut source, _archive) = open_source(config, archive, from_cache).await?;
    let index = RangeIndex::build(source.as_mut()).await?;

    let output = output.unwrap_or_else(|| config.index_path.clone());
    index
        .save(&output)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let stats = index.stats();
    if json {
        print_json(&stats)?;
    } else {
        println!("Index written to {}", output.display());
        println!("  shards:    {}", stats.total_files);
        println!("  companies: {}", stats.total_companies);
        println!("  bilans:    {}", stats.total_bilans);
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct BuildSummary {
    imported: u64,
    skipped: u64,
    failed_shards: Vec<String>,
    shards: usize,
}

impl From<&rne_finances::BuildReport> for BuildSummary {
    fn from(report: &rne_finances::BuildReport) -> Self {
        Self {
            imported: report.imported,
            skipped: report.skipped_total(),
            failed_shards: report.failed_shards.clone(),
            shards: report.shards,
        }
    }
}

fn print_build(report: &rne_finances::BuildReport, json: bool) -> Result<()> {
    if json {
        return print_json(&BuildSummary::from(report));
    }
    println!("Imported {} bilans from {} shards", report.imported, report.shards);
    for (reason, count) in &report.skipped {
        println!("  skipped {:>8}  {}", count, reason);
    }
    if !report.failed_shards.is_empty() {
        println!("  {} shards failed to parse", report.failed_shards.len());
    }
    Ok(())
}

async fn cmd_build_db(
    config: &RneConfig,
    from_archive: Option<String>,
    from_cache: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let (mut source, _archive) = open_source(config, from_archive, from_cache).await?;
    let store = FinancialStore::new(&config.db_path);
    let report = store.build(source.as_mut()).await?;
    print_build(&report, json)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_build_db_remote(config: &RneConfig, json: bool) -> Result<ExitCode> {
    let (mut source, _archive) = open_configured(config).await?;
    let store = FinancialStore::new(&config.db_path);
    let report = store.build(source.as_mut()).await?;
    print_build(&report, json)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_update_db(config: &RneConfig, json: bool) -> Result<ExitCode> {
    let (mut source, _archive) = open_configured(config).await?;

    let store = FinancialStore::new(&config.db_path);
    match store.rebuild(source.as_mut()).await {
        Ok(report) => {
            print_build(&report, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(StoreError::EmptyRebuild(path)) => {
            eprintln!("Nothing imported; keeping {}", path.display());
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_migrate_cache(config: &RneConfig, json: bool) -> Result<ExitCode> {
    let store = ShardStore::from_config(&config.shards)?;
    let report = store.migrate_cache().await?;

    if json {
        print_json(&serde_json::json!({
            "migrated": report.migrated,
            "already_compact": report.already_compact,
            "failed": report.failed,
            "bytes_before": report.bytes_before,
            "bytes_after": report.bytes_after,
        }))?;
    } else {
        println!(
            "Migrated {} shards ({} already compact, {} unreadable)",
            report.migrated, report.already_compact, report.failed
        );
        if report.migrated > 0 {
            println!(
                "  {:.1} MB -> {:.1} MB",
                report.bytes_before as f64 / 1_048_576.0,
                report.bytes_after as f64 / 1_048_576.0
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct CacheStatus {
    dir: PathBuf,
    entries: usize,
    bytes: u64,
    legacy: usize,
    unreadable: usize,
}

async fn cmd_cache_status(config: &RneConfig, json: bool) -> Result<ExitCode> {
    let cache = FsShardCache::new(&config.shards.cache_dir);
    let entries = cache.list().await?;

    let mut status = CacheStatus {
        dir: cache.dir().to_path_buf(),
        entries: entries.len(),
        bytes: entries.iter().map(|e| e.bytes).sum(),
        legacy: 0,
        unreadable: 0,
    };
    for entry in &entries {
        let Some(bytes) = cache.get(&entry.shard).await? else {
            continue;
        };
        match Shard::parse(&entry.shard, &bytes) {
            Ok(shard) if shard.has_legacy_records() => status.legacy += 1,
            Ok(_) => {}
            Err(_) => status.unreadable += 1,
        }
    }

    if json {
        print_json(&status)?;
    } else {
        println!("Cache {}", status.dir.display());
        println!("  shards:     {}", status.entries);
        println!("  size:       {:.1} MB", status.bytes as f64 / 1_048_576.0);
        println!("  legacy:     {}", status.legacy);
        println!("  unreadable: {}", status.unreadable);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cache_clear(config: &RneConfig, json: bool) -> Result<ExitCode> {
    let cache = FsShardCache::new(&config.shards.cache_dir);
    let removed = cache.clear().await?;
    info!(removed, dir = %cache.dir().display(), "Cache cleared");
    if json {
        print_json(&serde_json::json!({ "removed": removed }))?;
    } else {
        println!("Removed {} cached shards", removed);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_finances(config: &RneConfig, siren: &str, years: usize) -> Result<ExitCode> {
    let service = EnrichmentService::new(Arc::new(FinancialStore::new(&config.db_path)));
    if let Ok(age) = service.store().age_days().await {
        info!(age_days = age, "Financial store age");
    }

    let response = service.get_finances(siren, years).await;
    print_json(&response)?;
    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_enrich(
    config: &RneConfig,
    sirens: &[String],
    limited_space: bool,
    concurrency: Option<usize>,
    years: Option<usize>,
    json: bool,
) -> Result<ExitCode> {
    let index = RangeIndex::load(&config.index_path)
        .await
        .with_context(|| format!("Run `rne-cli index` first ({})", config.index_path.display()))?;
    if index.is_empty() {
        bail!("Range index {} is empty", config.index_path.display());
    }

    let mut enricher_config = config.enricher.clone();
    enricher_config.limited_space |= limited_space;
    let concurrency = concurrency.unwrap_or(enricher_config.concurrency);
    let years = years.unwrap_or(enricher_config.max_bilans_per_siren);

    let shards = ShardStore::from_config(&config.shards)?;
    let enricher = BatchEnricher::new(Arc::new(index), Arc::new(shards), enricher_config);
    let report = enricher
        .enrich(sirens, concurrency, years, |progress| {
            eprintln!(
                "[{}/{}] {} done",
                progress.completed, progress.total, progress.shard
            );
        })
        .await;

    if json {
        print_json(&report.results)?;
    } else {
        for result in report.results.values() {
            let latest = result.bilans.first();
            println!(
                "{}  {:<18}  {:>3} bilans  latest {}  {}",
                result.siren,
                format!("{:?}", result.status),
                result.bilans.len(),
                latest.map_or("-", |b| b.date_cloture.as_str()),
                result.denomination.as_deref().unwrap_or(""),
            );
        }
        for shard in report.shards.iter().filter(|s| s.error.is_some()) {
            eprintln!(
                "shard {} failed: {}",
                shard.shard,
                shard.error.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
