//! Streaming store build
//!
//! Every shard of a source is parsed, reduced to rows and inserted into a
//! fresh SQLite file. The file is written in WAL mode and switched back to a
//! rollback journal once complete so the result is a single self-contained file.

use std::collections::BTreeMap;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use super::model::{min_closing_date, StoredBilan, MIN_CLOSING_DATE};
use crate::error::{SchemaViolation, ShardError, StoreError};
use crate::extract::extract_bilan;
use crate::record::Shard;
use crate::shards::ShardSource;

/// Rows per committed transaction
pub const INSERT_BATCH: usize = 10_000;

const PROGRESS_EVERY_SHARDS: usize = 100;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS bilans (
    id INTEGER PRIMARY KEY,
    siren TEXT NOT NULL,
    date_cloture TEXT NOT NULL,
    date_depot TEXT,
    type_bilan TEXT,
    chiffre_affaires INTEGER,
    resultat_net INTEGER,
    resultat_exploitation INTEGER,
    total_actif INTEGER,
    capitaux_propres INTEGER,
    effectif INTEGER,
    ca_precedent INTEGER,
    rn_precedent INTEGER,
    re_precedent INTEGER,
    ta_precedent INTEGER,
    cp_precedent INTEGER,
    eff_precedent INTEGER
)";

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_siren ON bilans(siren)",
    "CREATE INDEX IF NOT EXISTS idx_siren_date ON bilans(siren, date_cloture DESC)",
];

const INSERT_ROW: &str = "INSERT INTO bilans (
    siren, date_cloture, date_depot, type_bilan,
    chiffre_affaires, resultat_net, resultat_exploitation, total_actif, capitaux_propres, effectif,
    ca_precedent, rn_precedent, re_precedent, ta_precedent, cp_precedent, eff_precedent
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Outcome of a store build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub imported: u64,
    pub skipped: BTreeMap<SchemaViolation, u64>,
    pub failed_shards: Vec<String>,
    pub shards: usize,
}

impl BuildReport {
    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }
}

async fn open_for_build(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    sqlx::query(CREATE_TABLE).execute(&pool).await?;
    Ok(pool)
}

async fn insert_row(
    tx: &mut Transaction<'static, Sqlite>,
    row: &StoredBilan,
) -> Result<(), StoreError> {
    sqlx::query(INSERT_ROW)
        .bind(&row.siren)
        .bind(&row.date_cloture)
        .bind(&row.date_depot)
        .bind(&row.type_bilan)
        .bind(row.chiffre_affaires)
        .bind(row.resultat_net)
        .bind(row.resultat_exploitation)
        .bind(row.total_actif)
        .bind(row.capitaux_propres)
        .bind(row.effectif)
        .bind(row.ca_precedent)
        .bind(row.rn_precedent)
        .bind(row.re_precedent)
        .bind(row.ta_precedent)
        .bind(row.cp_precedent)
        .bind(row.eff_precedent)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Build a store file at `path` from every shard of `source`.
///
/// `path` must not hold a database already in use; callers stage a fresh file.
pub async fn build_database(
    path: &Path,
    source: &mut dyn ShardSource,
) -> Result<BuildReport, StoreError> {
    let pool = open_for_build(path).await?;
    let mut report = BuildReport::default();

    info!(
        "Building financial store at {} (closing dates from {})",
        path.display(),
        MIN_CLOSING_DATE
    );

    // The pool is closed on every path so callers can remove a failed file
    if let Err(e) = load(&pool, source, &mut report).await {
        pool.close().await;
        return Err(e);
    }
    for statement in CREATE_INDEXES {
        sqlx::query(statement).execute(&pool).await?;
    }
    sqlx::query("PRAGMA journal_mode=DELETE")
        .execute(&pool)
        .await?;
    pool.close().await;

    info!(
        imported = report.imported,
        skipped = report.skipped_total(),
        failed_shards = report.failed_shards.len(),
        shards = report.shards,
        "Financial store build finished"
    );
    Ok(report)
}

async fn load(
    pool: &SqlitePool,
    source: &mut dyn ShardSource,
    report: &mut BuildReport,
) -> Result<(), StoreError> {
    let cutoff = min_closing_date();
    let total = source.total();
    let mut tx = pool.begin().await?;
    let mut pending = 0usize;

    while let Some(next) = source.next_shard().await {
        report.shards += 1;

        let shard = match next.and_then(|doc| Shard::parse(&doc.name, &doc.bytes)) {
            Ok(shard) => shard,
            Err(e) if e.ends_source() => {
                warn!(error = %e, shards = report.shards, "Shard source interrupted");
                return Err(e.into());
            }
            Err(e) => {
                let failed = match &e {
                    ShardError::Parse { shard, .. } | ShardError::Cache { shard, .. } => {
                        shard.clone()
                    }
                    _ => format!("#{}", report.shards),
                };
                report.failed_shards.push(failed);
                warn!(
                    error = %e,
                    failed = report.failed_shards.len(),
                    "Skipping shard"
                );
                continue;
            }
        };

        let mut shard_rows = 0u64;
        for record in &shard.records {
            match StoredBilan::validate(&extract_bilan(record), cutoff) {
                Ok(row) => {
                    insert_row(&mut tx, &row).await?;
                    shard_rows += 1;
                    pending += 1;
                }
                Err(violation) => *report.skipped.entry(violation).or_default() += 1,
            }

            if pending >= INSERT_BATCH {
                tx.commit().await?;
                tx = pool.begin().await?;
                pending = 0;
            }
        }
        report.imported += shard_rows;
        debug!(shard = %shard.name, rows = shard_rows, "Shard imported");

        if report.shards % PROGRESS_EVERY_SHARDS == 0 {
            info!(
                "Processed {}/{} shards: {} bilans imported, {} skipped, {} failed shards",
                report.shards,
                total.map_or_else(|| "?".to_string(), |t| t.to_string()),
                report.imported,
                report.skipped_total(),
                report.failed_shards.len()
            );
        }
    }
    tx.commit().await?;
    Ok(())
}
