//! Financial store build, query and rebuild from a zip archive
//!
//! Run with: cargo test --test store_lifecycle_integration

mod helpers;

use std::sync::Arc;

use async_trait::async_trait;
use helpers::{compact_record, full_record, shard_body, siren, write_archive};
use rne_finances::shards::{
    CacheDirSource, MemoryShardSource, ShardDocument, ShardSource, ZipShardSource,
};
use rne_finances::{EnrichmentService, FinancialStore, SchemaViolation, ShardError, StoreError};
use serde_json::json;

/// Yields one shard, reads the live store, then loses its archive reader
struct FailingMidway {
    store: Arc<FinancialStore>,
    calls: usize,
    rows_seen_during: Option<usize>,
}

#[async_trait]
impl ShardSource for FailingMidway {
    async fn next_shard(&mut self) -> Option<Result<ShardDocument, ShardError>> {
        self.calls += 1;
        if self.calls == 1 {
            let body = shard_body(&[compact_record("552100554", "2023-12-31", "99")]);
            return Some(Ok(ShardDocument {
                name: "s1.json".to_string(),
                bytes: body.into_bytes(),
            }));
        }
        let rows = self.store.query(siren("552100554"), 10).await.ok()?;
        self.rows_seen_during = Some(rows.len());
        let lost = tokio::spawn(async { panic!("archive reader lost") })
            .await
            .unwrap_err();
        Some(Err(ShardError::Join(lost)))
    }

    fn total(&self) -> Option<usize> {
        Some(3)
    }
}

#[tokio::test]
async fn test_every_statement_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    let records: Vec<_> = (0..100)
        .map(|i| compact_record("552100554", "2022-12-31", &i.to_string()))
        .collect();
    write_archive(&archive, &[("s1.json", shard_body(&records))]);

    let store = FinancialStore::new(dir.path().join("bilans.db"));
    let mut source = ZipShardSource::open(&archive).await.unwrap();
    let report = store.build(&mut source).await.unwrap();

    assert_eq!(report.imported, 100);
    assert_eq!(report.shards, 1);
    assert_eq!(store.row_count().await.unwrap(), 100);
    assert_eq!(store.query(siren("552100554"), 500).await.unwrap().len(), 100);
}

#[tokio::test]
async fn test_closing_date_cutoff_and_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("stock.zip");
    write_archive(
        &archive,
        &[(
            "s1.json",
            shard_body(&[
                compact_record("552100554", "2018-12-31", "1"),
                compact_record("552100554", "2019-01-01", "2"),
                full_record("552100554", "2020-12-31", "3"),
                json!({ "siren": "552100554", "metrics": { "FA": { "m1": "4" } } }),
                compact_record("ABC", "2020-12-31", "5"),
            ]),
        )],
    );

    let store = FinancialStore::new(dir.path().join("bilans.db"));
    let report = store
        .build(&mut ZipShardSource::open(&archive).await.unwrap())
        .await
        .unwrap();

    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped[&SchemaViolation::BeforeCutoff], 1);
    assert_eq!(report.skipped[&SchemaViolation::MissingClosingDate], 1);
    assert_eq!(report.skipped[&SchemaViolation::InvalidSiren], 1);

    let rows = store.query(siren("552100554"), 10).await.unwrap();
    let dates: Vec<&str> = rows.iter().map(|r| r.date_cloture.as_str()).collect();
    assert_eq!(dates, vec!["2020-12-31", "2019-01-01"]);
    assert_eq!(rows[0].chiffre_affaires, Some(3));
}

#[tokio::test]
async fn test_unparseable_shard_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = FinancialStore::new(dir.path().join("bilans.db"));
    let mut source = MemoryShardSource::new([
        ("good.json", shard_body(&[compact_record("552100554", "2022-12-31", "1")])),
        ("bad.json", "{not json".to_string()),
    ]);

    let report = store.build(&mut source).await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.failed_shards, vec!["bad.json".to_string()]);
}

#[tokio::test]
async fn test_empty_rebuild_keeps_current_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("bilans.db");
    let store = FinancialStore::new(&db);
    store
        .build(&mut MemoryShardSource::new([(
            "s1.json",
            shard_body(&[compact_record("552100554", "2022-12-31", "1")]),
        )]))
        .await
        .unwrap();
    store.close().await;
    let before = std::fs::read(&db).unwrap();

    let empty_cache = dir.path().join("empty-cache");
    std::fs::create_dir(&empty_cache).unwrap();
    let mut source = CacheDirSource::open(&empty_cache).await.unwrap();
    let err = store.rebuild(&mut source).await.unwrap_err();

    assert!(matches!(err, StoreError::EmptyRebuild(_)));
    assert_eq!(std::fs::read(&db).unwrap(), before);
    assert!(!dir.path().join("bilans.db.building").exists());
    assert_eq!(store.row_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rebuild_visible_to_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FinancialStore::new(dir.path().join("bilans.db")));
    store
        .build(&mut MemoryShardSource::new([(
            "s1.json",
            shard_body(&[compact_record("552100554", "2021-12-31", "1")]),
        )]))
        .await
        .unwrap();

    let service = EnrichmentService::new(Arc::clone(&store));
    assert_eq!(service.get_finances("552100554", 5).await.count, 1);

    store
        .rebuild(&mut MemoryShardSource::new([(
            "s1.json",
            shard_body(&[
                compact_record("552100554", "2021-12-31", "1"),
                compact_record("552100554", "2022-12-31", "2"),
            ]),
        )]))
        .await
        .unwrap();

    let response = service.get_finances("552100554", 5).await;
    assert!(response.success);
    assert_eq!(response.count, 2);
    assert_eq!(response.bilans[0].chiffre_affaires, Some(2));
}

#[tokio::test]
async fn test_failed_rebuild_keeps_serving_previous_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("bilans.db");
    let store = Arc::new(FinancialStore::new(&db));
    store
        .build(&mut MemoryShardSource::new([(
            "s1.json",
            shard_body(&[
                compact_record("552100554", "2021-12-31", "1"),
                compact_record("552100554", "2022-12-31", "2"),
            ]),
        )]))
        .await
        .unwrap();
    store.close().await;
    let before = std::fs::read(&db).unwrap();

    let mut source = FailingMidway {
        store: Arc::clone(&store),
        calls: 0,
        rows_seen_during: None,
    };
    let err = store.rebuild(&mut source).await.unwrap_err();

    assert!(matches!(err, StoreError::Source(ShardError::Join(_))));
    assert_eq!(source.rows_seen_during, Some(2));
    assert!(!dir.path().join("bilans.db.building").exists());
    assert!(!dir.path().join("bilans.db.building-wal").exists());

    let rows = store.query(siren("552100554"), 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].chiffre_affaires, Some(2));
    store.close().await;
    assert_eq!(std::fs::read(&db).unwrap(), before);
}

#[tokio::test]
async fn test_flat_rows_are_imported_with_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let store = FinancialStore::new(dir.path().join("bilans.db"));
    let row = json!({
        "siren": "552100554",
        "date_cloture": "2022-12-31",
        "chiffre_affaires": 1_250_000,
        "ca_precedent": "1 100 000",
        "resultat_net": -4_000,
        "effectif": 12
    });
    let report = store
        .build(&mut MemoryShardSource::new([("flat.json", shard_body(&[row]))]))
        .await
        .unwrap();
    assert_eq!(report.imported, 1);

    let rows = store.query(siren("552100554"), 5).await.unwrap();
    assert_eq!(rows[0].chiffre_affaires, Some(1_250_000));
    assert_eq!(rows[0].ca_precedent, Some(1_100_000));
    assert_eq!(rows[0].resultat_net, Some(-4_000));
    assert_eq!(rows[0].effectif, Some(12));
    assert_eq!(rows[0].total_actif, None);
}
