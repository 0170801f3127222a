//! Shared fixtures for the integration tests: zip archives of shard
//! documents and record builders in both encodings.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rne_finances::shards::{FsShardCache, LocalArchiveSource, ShardStore};
use rne_finances::Siren;
use serde_json::{json, Value};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub fn siren(value: &str) -> Siren {
    Siren::parse(value).expect("valid test SIREN")
}

/// A record in the registry's full encoding, turnover on line FA.
pub fn full_record(siren: &str, closing: &str, turnover: &str) -> Value {
    json!({
        "siren": siren,
        "denomination": format!("COMPANY {}", siren),
        "bilanSaisi": {
            "bilan": {
                "identite": { "dateClotureExercice": closing },
                "detail": {
                    "pages": [
                        { "liasses": [
                            { "code": "FA", "m1": turnover, "m2": "0" },
                            { "code": "HN", "m1": "1 000" }
                        ] }
                    ]
                }
            }
        }
    })
}

/// A record in the compact encoding.
pub fn compact_record(siren: &str, closing: &str, turnover: &str) -> Value {
    json!({
        "siren": siren,
        "dateCloture": closing,
        "metrics": { "FA": { "m1": turnover } }
    })
}

pub fn shard_body(records: &[Value]) -> String {
    Value::Array(records.to_vec()).to_string()
}

/// Write a zip archive with one entry per shard, nested one directory deep
/// like the published bulk archive.
pub fn write_archive(path: &Path, shards: &[(&str, String)]) {
    let mut zip = ZipWriter::new(File::create(path).expect("create archive"));
    for (name, body) in shards {
        zip.start_file(format!("stock/{}", name), SimpleFileOptions::default())
            .expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish archive");
}

/// Shard store over a filesystem cache in `dir/cache` and a local archive.
pub fn local_shard_store(dir: &Path, archive: &Path) -> (ShardStore, PathBuf) {
    let cache_dir = dir.join("cache");
    let store = ShardStore::new(
        Arc::new(FsShardCache::new(&cache_dir)),
        Arc::new(LocalArchiveSource::new(archive)),
    );
    (store, cache_dir)
}
