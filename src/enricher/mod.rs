//! Batch enrichment
//!
//! Identifiers are grouped by shard through the range index and each distinct
//! shard becomes one task on a bounded worker pool. Workers report back over a
//! channel; a single aggregator owns the merged result map.

pub mod result;
pub mod task;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

pub use result::{
    EnrichmentResult, LookupStatus, SOURCE_INDEX, SOURCE_INPUT, SOURCE_SHARD, SOURCE_STORE,
};
pub use task::{ShardOutcome, ShardTaskState};

use crate::config::EnricherConfig;
use crate::index::RangeIndex;
use crate::shards::ShardStore;
use crate::siren::Siren;
use task::{ShardTask, TaskLimits};

/// Progress after one shard completes
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress<'a> {
    pub completed: usize,
    pub total: usize,
    pub shard: &'a str,
}

/// Final state of one scheduled shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardReport {
    pub shard: String,
    pub state: ShardTaskState,
    pub requested: usize,
    pub found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Keyed by normalized SIREN (or the raw input when it is not one)
    pub results: BTreeMap<String, EnrichmentResult>,
    /// One entry per scheduled shard, in completion order
    pub shards: Vec<ShardReport>,
}

pub struct BatchEnricher {
    index: Arc<RangeIndex>,
    store: Arc<ShardStore>,
    config: EnricherConfig,
}

impl BatchEnricher {
    pub fn new(index: Arc<RangeIndex>, store: Arc<ShardStore>, config: EnricherConfig) -> Self {
        Self {
            index,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EnricherConfig {
        &self.config
    }

    /// [`enrich`](Self::enrich) with the configured pool size and record cap
    pub async fn enrich_configured<I, S, F>(&self, ids: I, progress: F) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(BatchProgress<'_>),
    {
        self.enrich(
            ids,
            self.config.concurrency,
            self.config.max_bilans_per_siren,
            progress,
        )
        .await
    }

    /// Enrich every identifier; each one gets exactly one result.
    pub async fn enrich<I, S, F>(
        &self,
        ids: I,
        concurrency: usize,
        max_records_per_id: usize,
        mut progress: F,
    ) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(BatchProgress<'_>),
    {
        let mut report = BatchReport::default();

        let mut valid = BTreeSet::new();
        for id in ids {
            let id = id.as_ref();
            match Siren::normalize(id) {
                Some(siren) => {
                    valid.insert(siren);
                }
                None => {
                    let result = EnrichmentResult::invalid(id);
                    report.results.insert(result.siren.clone(), result);
                }
            }
        }

        let groups = self.index.group_by_shard(valid);
        for siren in groups.unindexed {
            report
                .results
                .insert(siren.to_string(), EnrichmentResult::not_found(siren, SOURCE_INDEX));
        }

        let total = groups.by_shard.len();
        let scheduled_ids: usize = groups.by_shard.values().map(Vec::len).sum();
        info!(
            shards = total,
            identifiers = report.results.len() + scheduled_ids,
            concurrency,
            "Starting batch enrichment"
        );
        if total == 0 {
            return report;
        }

        let scheduled = groups.by_shard.clone();
        let limits = TaskLimits {
            max_records: max_records_per_id,
            limited_space: self.config.limited_space,
        };
        let mut outcomes = self.dispatch(groups.by_shard, concurrency.max(1), limits);

        while let Some(outcome) = outcomes.recv().await {
            let requested = scheduled.get(&outcome.shard).map_or(0, Vec::len);
            let found = outcome
                .results
                .iter()
                .filter(|r| r.status == LookupStatus::Found)
                .count();
            for result in outcome.results {
                report.results.insert(result.siren.clone(), result);
            }
            report.shards.push(ShardReport {
                shard: outcome.shard,
                state: outcome.state,
                requested,
                found,
                error: outcome.error,
            });

            let shard = report.shards.last().map_or("", |r| r.shard.as_str());
            progress(BatchProgress {
                completed: report.shards.len(),
                total,
                shard,
            });
        }

        // A worker that died without reporting still owes its identifiers a result
        let reported: BTreeSet<&str> = report.shards.iter().map(|r| r.shard.as_str()).collect();
        let lost: Vec<(String, Vec<Siren>)> = scheduled
            .into_iter()
            .filter(|(shard, _)| !reported.contains(shard.as_str()))
            .collect();
        for (shard, sirens) in lost {
            warn!(shard = %shard, "Shard task ended without reporting");
            let message = "shard task aborted".to_string();
            for siren in &sirens {
                let result = EnrichmentResult::failed(*siren, message.clone(), SOURCE_SHARD)
                    .with_shard(&shard);
                report.results.insert(siren.to_string(), result);
            }
            report.shards.push(ShardReport {
                shard,
                state: ShardTaskState::Failed,
                requested: sirens.len(),
                found: 0,
                error: Some(message),
            });
        }

        info!(
            shards = report.shards.len(),
            results = report.results.len(),
            "Batch enrichment finished"
        );
        report
    }

    /// Spawn one task per shard, at most `concurrency` running at once.
    fn dispatch(
        &self,
        shards: BTreeMap<String, Vec<Siren>>,
        concurrency: usize,
        limits: TaskLimits,
    ) -> mpsc::Receiver<ShardOutcome> {
        let (sender, receiver) = mpsc::channel(concurrency);
        let permits = Arc::new(Semaphore::new(concurrency));
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            for (shard, sirens) in shards {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                debug!(shard = %shard, identifiers = sirens.len(), "Scheduling shard task");
                let sender = sender.clone();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let outcome = ShardTask::new(shard, sirens).run(&store, limits).await;
                    if sender.send(outcome).await.is_err() {
                        warn!("Batch aggregator went away before a shard reported");
                    }
                    drop(permit);
                });
            }
        });

        receiver
    }
}
