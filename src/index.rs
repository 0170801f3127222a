//! SIREN range index
//!
//! Maps identifier ranges to shard files so a lookup touches one shard instead
//! of the whole bulk dataset. Entries are sorted by `id_min` and never overlap;
//! gaps between them are normal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::record::Shard;
use crate::shards::ShardSource;
use crate::siren::Siren;

pub const FORMAT_VERSION: &str = "2.0-ranges";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeIndexEntry {
    #[serde(rename = "file")]
    pub shard_id: String,
    #[serde(rename = "siren_min")]
    pub id_min: Siren,
    #[serde(rename = "siren_max")]
    pub id_max: Siren,
    #[serde(rename = "companies", default)]
    pub company_count: u64,
    #[serde(rename = "bilans", default)]
    pub record_count: u64,
}

impl RangeIndexEntry {
    pub fn contains(&self, siren: Siren) -> bool {
        self.id_min <= siren && siren <= self.id_max
    }

    /// Summarize one parsed shard. `None` when no record carries a valid SIREN.
    pub fn from_shard(shard: &Shard) -> Option<Self> {
        let sirens: BTreeSet<Siren> = shard.records.iter().filter_map(|r| r.siren()).collect();
        let id_min = *sirens.first()?;
        let id_max = *sirens.last()?;
        Some(Self {
            shard_id: shard.name.clone(),
            id_min,
            id_max,
            company_count: sirens.len() as u64,
            record_count: shard.records.len() as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: usize,
    pub total_companies: u64,
    pub total_bilans: u64,
    pub created_at: String,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    ranges: Vec<RangeIndexEntry>,
    stats: IndexStats,
    #[serde(default)]
    format_version: String,
}

/// Requested identifiers split by the shard that holds them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardGroups {
    pub by_shard: BTreeMap<String, Vec<Siren>>,
    /// Identifiers no indexed range covers
    pub unindexed: Vec<Siren>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeIndex {
    entries: Vec<RangeIndexEntry>,
    created_at: String,
}

impl RangeIndex {
    /// Sort and validate entries into an index.
    pub fn from_entries(mut entries: Vec<RangeIndexEntry>) -> Result<Self, IndexError> {
        entries.sort_by(|a, b| a.id_min.cmp(&b.id_min));
        validate(&entries)?;
        Ok(Self {
            entries,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// Scan every shard of a source. Unreadable shards and shards without a
    /// valid identifier are skipped.
    pub async fn build(source: &mut dyn ShardSource) -> Result<Self, IndexError> {
        let total = source.total();
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        let mut seen = 0usize;

        while let Some(next) = source.next_shard().await {
            seen += 1;
            let document = match next {
                Ok(document) => document,
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, skipped, "Skipping unreadable shard");
                    continue;
                }
            };
            let shard = match Shard::parse(&document.name, &document.bytes) {
                Ok(shard) => shard,
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, skipped, "Skipping malformed shard");
                    continue;
                }
            };
            match RangeIndexEntry::from_shard(&shard) {
                Some(entry) => {
                    debug!(
                        shard = %entry.shard_id,
                        min = %entry.id_min,
                        max = %entry.id_max,
                        "Indexed shard"
                    );
                    entries.push(entry);
                }
                None => debug!(shard = %shard.name, "Shard has no valid SIREN, not indexed"),
            }
            if seen % 100 == 0 {
                let total = total.map_or("?".to_string(), |t| t.to_string());
                info!("Indexed {}/{} shards", seen, total);
            }
        }

        let index = Self::from_entries(entries)?;
        info!(shards = index.len(), skipped, "Range index built");
        Ok(index)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| IndexError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: IndexFile =
            serde_json::from_slice(&bytes).map_err(|source| IndexError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        if file.format_version != FORMAT_VERSION {
            warn!(
                path = %path.display(),
                found = %file.format_version,
                expected = FORMAT_VERSION,
                "Unexpected index format version"
            );
        }

        let mut index = Self::from_entries(file.ranges)?;
        index.created_at = file.stats.created_at;
        info!(path = %path.display(), shards = index.len(), "Range index loaded");
        Ok(index)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let file = IndexFile {
            ranges: self.entries.clone(),
            stats: self.stats(),
            format_version: FORMAT_VERSION.to_string(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        tokio::fs::write(path.as_ref(), json).await?;
        Ok(())
    }

    /// Shard holding `siren`, if any range covers it.
    pub fn lookup(&self, siren: Siren) -> Option<&str> {
        // First entry whose range ends at or after the identifier
        let candidate = self.entries.partition_point(|e| e.id_max < siren);
        self.entries
            .get(candidate)
            .filter(|e| e.contains(siren))
            .map(|e| e.shard_id.as_str())
    }

    /// Group identifiers by shard; duplicates collapse.
    pub fn group_by_shard(&self, sirens: impl IntoIterator<Item = Siren>) -> ShardGroups {
        let mut groups = ShardGroups::default();
        let mut seen = BTreeSet::new();
        for siren in sirens {
            if !seen.insert(siren) {
                continue;
            }
            match self.lookup(siren) {
                Some(shard) => groups
                    .by_shard
                    .entry(shard.to_string())
                    .or_default()
                    .push(siren),
                None => groups.unindexed.push(siren),
            }
        }
        groups
    }

    pub fn entries(&self) -> &[RangeIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            total_files: self.entries.len(),
            total_companies: self.entries.iter().map(|e| e.company_count).sum(),
            total_bilans: self.entries.iter().map(|e| e.record_count).sum(),
            created_at: self.created_at.clone(),
        }
    }
}

fn validate(sorted: &[RangeIndexEntry]) -> Result<(), IndexError> {
    if let Some(bad) = sorted.iter().find(|e| e.id_min > e.id_max) {
        return Err(IndexError::InvertedRange {
            shard: bad.shard_id.clone(),
            min: bad.id_min.to_string(),
            max: bad.id_max.to_string(),
        });
    }
    match sorted.windows(2).find(|pair| pair[1].id_min <= pair[0].id_max) {
        Some(pair) => Err(IndexError::OverlappingRanges {
            first: pair[0].shard_id.clone(),
            first_min: pair[0].id_min.to_string(),
            first_max: pair[0].id_max.to_string(),
            second: pair[1].shard_id.clone(),
            second_min: pair[1].id_min.to_string(),
            second_max: pair[1].id_max.to_string(),
        }),
        None => Ok(()),
    }
}
