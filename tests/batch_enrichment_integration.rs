//! Batch enrichment through a real zip archive and filesystem cache
//!
//! Run with: cargo test --test batch_enrichment_integration

mod helpers;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use helpers::{compact_record, full_record, local_shard_store, shard_body, siren, write_archive};
use rne_finances::enricher::{ShardTaskState, SOURCE_INDEX, SOURCE_SHARD};
use rne_finances::index::RangeIndexEntry;
use rne_finances::shards::{
    ArchiveFile, ArchiveSource, FsShardCache, MemoryShardCache, ShardCache, ShardStore,
    ZipShardSource,
};
use rne_finances::{BatchEnricher, EnricherConfig, LookupStatus, RangeIndex, ShardError};

/// Local archive that records how many fetches overlap
struct CountingArchive {
    path: PathBuf,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl ArchiveSource for CountingArchive {
    async fn fetch_archive(&self) -> Result<ArchiveFile, ShardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ArchiveFile::Local(self.path.clone()))
    }

    fn describe(&self) -> String {
        format!("counting {}", self.path.display())
    }
}

fn config(limited_space: bool) -> EnricherConfig {
    EnricherConfig {
        concurrency: 3,
        limited_space,
        max_bilans_per_siren: 10,
    }
}

fn entry(shard: &str, min: &str, max: &str) -> RangeIndexEntry {
    RangeIndexEntry {
        shard_id: shard.to_string(),
        id_min: siren(min),
        id_max: siren(max),
        company_count: 0,
        record_count: 0,
    }
}

#[tokio::test]
async fn test_single_identifier_hits_one_shard() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    write_archive(
        &archive,
        &[
            ("s1.json", shard_body(&[compact_record("000000001", "2022-12-31", "10")])),
            (
                "s2.json",
                shard_body(&[
                    full_record("005880596", "2021-12-31", "1 500"),
                    full_record("005880596", "2022-12-31", "2 500"),
                ]),
            ),
        ],
    );

    let index = RangeIndex::from_entries(vec![
        entry("s1.json", "000000001", "005000000"),
        entry("s2.json", "005000001", "010000000"),
    ])
    .unwrap();
    let (store, _) = local_shard_store(dir.path(), &archive);
    let enricher = BatchEnricher::new(Arc::new(index), Arc::new(store), config(false));

    let mut seen = Vec::new();
    let report = enricher
        .enrich(["005880596"], 3, 5, |p| seen.push((p.completed, p.total, p.shard.to_string())))
        .await;

    assert_eq!(report.shards.len(), 1);
    assert_eq!(report.shards[0].shard, "s2.json");
    assert_eq!(seen, vec![(1, 1, "s2.json".to_string())]);

    let result = &report.results["005880596"];
    assert_eq!(result.siren, "005880596");
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.source, SOURCE_SHARD);
    assert_eq!(result.bilans.len(), 2);
    assert_eq!(result.bilans[0].date_cloture, "2022-12-31");
    assert_eq!(result.bilans[0].chiffre_affaires, Some(2500));
    assert_eq!(result.denomination.as_deref(), Some("COMPANY 005880596"));
}

#[tokio::test]
async fn test_identifiers_grouped_per_shard() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    write_archive(
        &archive,
        &[
            (
                "a.json",
                shard_body(&[
                    compact_record("100000001", "2022-12-31", "11"),
                    compact_record("100000002", "2022-12-31", "12"),
                    compact_record("100000003", "2022-12-31", "13"),
                ]),
            ),
            ("b.json", shard_body(&[full_record("200000001", "2022-06-30", "21")])),
        ],
    );

    // Build the index from the archive itself
    let mut source = ZipShardSource::open(&archive).await.unwrap();
    let index = RangeIndex::build(&mut source).await.unwrap();
    assert_eq!(index.len(), 2);

    let (store, _) = local_shard_store(dir.path(), &archive);
    let enricher = BatchEnricher::new(Arc::new(index), Arc::new(store), config(false));
    let report = enricher
        .enrich(["100000001", "100000003", "200000001"], 2, 10, |_| {})
        .await;

    assert_eq!(report.shards.len(), 2);
    assert_eq!(report.results.len(), 3);

    let expect = [
        ("100000001", "a.json", 11),
        ("100000003", "a.json", 13),
        ("200000001", "b.json", 21),
    ];
    for (id, shard, turnover) in expect {
        let result = &report.results[id];
        assert_eq!(result.status, LookupStatus::Found, "{}", id);
        assert_eq!(result.shard.as_deref(), Some(shard));
        assert_eq!(result.bilans[0].chiffre_affaires, Some(turnover));
    }

    let a = report.shards.iter().find(|s| s.shard == "a.json").unwrap();
    assert_eq!((a.requested, a.found), (2, 2));
    assert_eq!(a.state, ShardTaskState::Done);
}

#[tokio::test]
async fn test_every_identifier_gets_a_result() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    write_archive(
        &archive,
        &[("s1.json", shard_body(&[compact_record("000000002", "2022-12-31", "1")]))],
    );
    let index = RangeIndex::from_entries(vec![entry("s1.json", "000000001", "005000000")]).unwrap();
    let (store, _) = local_shard_store(dir.path(), &archive);
    let enricher = BatchEnricher::new(Arc::new(index), Arc::new(store), config(false));

    let report = enricher
        .enrich(["2", "000000003", "999999999", "n/a"], 3, 10, |_| {})
        .await;

    assert_eq!(report.results.len(), 4);
    assert_eq!(report.results["000000002"].status, LookupStatus::Found);
    assert_eq!(report.results["000000003"].status, LookupStatus::NotFound);
    assert_eq!(report.results["999999999"].status, LookupStatus::NotFound);
    assert_eq!(report.results["999999999"].source, SOURCE_INDEX);
    assert_eq!(report.results["n/a"].status, LookupStatus::InvalidIdentifier);
    assert_eq!(report.shards.len(), 1);
}

#[tokio::test]
async fn test_limited_space_leaves_cache_empty() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    write_archive(
        &archive,
        &[
            ("a.json", shard_body(&[compact_record("100000001", "2022-12-31", "1")])),
            ("b.json", shard_body(&[compact_record("200000001", "2022-12-31", "2")])),
        ],
    );
    let mut source = ZipShardSource::open(&archive).await.unwrap();
    let index = Arc::new(RangeIndex::build(&mut source).await.unwrap());

    let (store, cache_dir) = local_shard_store(dir.path(), &archive);
    let enricher = BatchEnricher::new(Arc::clone(&index), Arc::new(store), config(true));
    let report = enricher.enrich(["100000001", "200000001"], 1, 10, |_| {}).await;

    assert!(report
        .shards
        .iter()
        .all(|s| s.state == ShardTaskState::Evicted));
    assert_eq!(report.results["200000001"].status, LookupStatus::Found);
    assert!(FsShardCache::new(&cache_dir).list().await.unwrap().is_empty());

    // Default mode keeps what it fetched
    let (store, cache_dir) = local_shard_store(dir.path(), &archive);
    let enricher = BatchEnricher::new(index, Arc::new(store), config(false));
    enricher.enrich(["100000001", "200000001"], 3, 10, |_| {}).await;
    let cached: Vec<String> = FsShardCache::new(&cache_dir)
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.shard)
        .collect();
    assert_eq!(cached, vec!["a.json", "b.json"]);
}

#[tokio::test]
async fn test_failed_shard_does_not_cancel_others() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    write_archive(
        &archive,
        &[("a.json", shard_body(&[compact_record("100000001", "2022-12-31", "1")]))],
    );
    let index = RangeIndex::from_entries(vec![
        entry("a.json", "100000000", "199999999"),
        entry("gone.json", "200000000", "299999999"),
    ])
    .unwrap();
    let (store, _) = local_shard_store(dir.path(), &archive);
    let enricher = BatchEnricher::new(Arc::new(index), Arc::new(store), config(false));

    let report = enricher
        .enrich(["100000001", "200000001", "200000002"], 2, 10, |_| {})
        .await;

    assert_eq!(report.results["100000001"].status, LookupStatus::Found);
    for id in ["200000001", "200000002"] {
        let result = &report.results[id];
        assert_eq!(result.status, LookupStatus::Error);
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.shard.as_deref(), Some("gone.json"));
    }
    let failed = report.shards.iter().find(|s| s.shard == "gone.json").unwrap();
    assert_eq!(failed.state, ShardTaskState::Failed);
    assert!(failed.error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_stay_under_cap() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    let shards: Vec<(String, String)> = (1..=5)
        .map(|i| {
            let id = format!("{}00000001", i);
            (format!("s{}.json", i), shard_body(&[compact_record(&id, "2022-12-31", "1")]))
        })
        .collect();
    let named: Vec<(&str, String)> = shards.iter().map(|(n, b)| (n.as_str(), b.clone())).collect();
    write_archive(&archive, &named);

    let mut source = ZipShardSource::open(&archive).await.unwrap();
    let index = RangeIndex::build(&mut source).await.unwrap();
    let counting = Arc::new(CountingArchive {
        path: archive.clone(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let store = ShardStore::new(Arc::new(MemoryShardCache::new()), counting.clone());
    let enricher = BatchEnricher::new(Arc::new(index), Arc::new(store), config(false));

    let ids: Vec<String> = (1..=5).map(|i| format!("{}00000001", i)).collect();
    let report = enricher.enrich(&ids, 2, 10, |_| {}).await;

    assert_eq!(report.shards.len(), 5);
    assert!(report.results.values().all(|r| r.status == LookupStatus::Found));
    assert_eq!(counting.calls.load(Ordering::SeqCst), 5);
    let peak = counting.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{} fetches overlapped with a cap of 2", peak);
    assert!(peak >= 1);
}
