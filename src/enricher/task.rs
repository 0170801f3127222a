//! One shard's unit of batch work

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use super::result::{EnrichmentResult, SOURCE_SHARD};
use crate::extract::extract_bilan;
use crate::record::RawRecord;
use crate::shards::ShardStore;
use crate::siren::Siren;
use crate::store::{sort_most_recent_first, StoredBilan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardTaskState {
    Pending,
    Fetching,
    Parsing,
    Extracting,
    Done,
    Failed,
    Evicted,
}

impl fmt::Display for ShardTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Extracting => "extracting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Evicted => "evicted",
        };
        f.write_str(name)
    }
}

/// What a worker sends back to the aggregator
#[derive(Debug, Clone)]
pub struct ShardOutcome {
    pub shard: String,
    pub state: ShardTaskState,
    pub results: Vec<EnrichmentResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskLimits {
    pub max_records: usize,
    pub limited_space: bool,
}

pub(crate) struct ShardTask {
    shard: String,
    sirens: Vec<Siren>,
    state: ShardTaskState,
}

impl ShardTask {
    pub fn new(shard: String, sirens: Vec<Siren>) -> Self {
        Self {
            shard,
            sirens,
            state: ShardTaskState::Pending,
        }
    }

    fn advance(&mut self, next: ShardTaskState) {
        debug!(shard = %self.shard, from = %self.state, to = %next, "Shard task");
        self.state = next;
    }

    pub async fn run(mut self, store: &ShardStore, limits: TaskLimits) -> ShardOutcome {
        self.advance(ShardTaskState::Fetching);
        let fetched = store.fetch(&self.shard, true).await;

        let (results, error): (Vec<EnrichmentResult>, Option<String>) = match fetched {
            Ok(shard) => {
                self.advance(ShardTaskState::Parsing);
                let mut grouped: HashMap<Siren, Vec<&RawRecord>> =
                    self.sirens.iter().map(|s| (*s, Vec::new())).collect();
                for record in &shard.records {
                    let Some(siren) = record.siren() else { continue };
                    if let Some(records) = grouped.get_mut(&siren) {
                        records.push(record);
                    }
                }

                self.advance(ShardTaskState::Extracting);
                let results = self
                    .sirens
                    .iter()
                    .map(|siren| {
                        let records = grouped.remove(siren).unwrap_or_default();
                        self.extract(*siren, &records, limits.max_records)
                    })
                    .collect();
                self.advance(ShardTaskState::Done);
                (results, None)
            }
            Err(e) => {
                warn!(shard = %self.shard, error = %e, "Shard fetch failed");
                self.advance(ShardTaskState::Failed);
                let message = e.to_string();
                let results = self
                    .sirens
                    .iter()
                    .map(|siren| {
                        EnrichmentResult::failed(*siren, message.clone(), SOURCE_SHARD)
                            .with_shard(&self.shard)
                    })
                    .collect();
                (results, Some(message))
            }
        };

        if limits.limited_space {
            match store.evict(&self.shard).await {
                Ok(_) => self.advance(ShardTaskState::Evicted),
                Err(e) => warn!(shard = %self.shard, error = %e, "Eviction failed"),
            }
        }

        ShardOutcome {
            shard: self.shard,
            state: self.state,
            results,
            error,
        }
    }

    fn extract(
        &self,
        siren: Siren,
        records: &[&RawRecord],
        max_records: usize,
    ) -> EnrichmentResult {
        if records.is_empty() {
            return EnrichmentResult::not_found(siren, SOURCE_SHARD).with_shard(&self.shard);
        }

        let extracted: Vec<_> = records.iter().map(|r| extract_bilan(r)).collect();
        let denomination = extracted.iter().find_map(|b| b.denomination.clone());
        let mut bilans: Vec<StoredBilan> = extracted
            .iter()
            .map(|b| StoredBilan::from_extracted(siren, b))
            .collect();
        sort_most_recent_first(&mut bilans);
        bilans.truncate(max_records);

        EnrichmentResult::found(siren, bilans, SOURCE_SHARD)
            .with_shard(&self.shard)
            .with_denomination(denomination)
    }
}
