#![allow(deprecated)] // Command::cargo_bin

use assert_cmd::Command;
use bucketfeed::persistence::DocumentDbProvider;
use bucketfeed::store::schema::DocSchema;
use bucketfeed::types::{BucketId, Document, DocumentId, FieldValue};
use bucketfeed::{MetricsRegistry, StorageConfig};
use predicates::str::contains;
use std::path::Path;

fn bucketfeed_cmd() -> Command {
    let mut cmd = Command::cargo_bin("bucketfeed").unwrap();
    cmd.env_remove("BUCKETFEED_DATA_DIR")
        .env_remove("BUCKETFEED_SHARDS")
        .env_remove("BUCKETFEED_NODE_ID")
        .env_remove("BUCKETFEED_VISIBILITY_DELAY_MS");
    cmd
}

/// One partition whose log holds two puts into bucket 16:7.
fn seed(dir: &Path) {
    let config = StorageConfig {
        node_id: "cli-test".to_string(),
        shards: 1,
        doc_type: "song".to_string(),
        schema: DocSchema::builder().indexed("title").build(),
        ..StorageConfig::default()
    };
    std::fs::write(
        dir.join("storage.json"),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let metrics = MetricsRegistry::new().unwrap();
        let provider = DocumentDbProvider::open(&config, &metrics, dir).await.unwrap();
        let db = provider.partition(0).unwrap();
        for (i, local) in ["a", "b"].iter().enumerate() {
            let id = DocumentId::parse(&format!("id:music:song:n=7:{}", local)).unwrap();
            let doc = Document::new(id).with_field("title", FieldValue::Text("Kind of Blue".into()));
            db.put(BucketId::new(16, 7), 10 + i as u64, doc).await.unwrap();
        }
    });
}

#[test]
fn replay_after_flush_writes_nothing_to_flushed_stores() {
    let dir = tempfile::TempDir::new().unwrap();
    seed(dir.path());
    let data_dir = dir.path().to_str().unwrap();

    bucketfeed_cmd()
        .args(["--data-dir", data_dir, "replay"])
        .assert()
        .success()
        .stdout(contains("\"document\": 2"));

    bucketfeed_cmd()
        .args(["--data-dir", data_dir, "flush"])
        .assert()
        .success()
        .stdout(contains("\"meta\": 2"));
    assert!(dir.path().join("partition-0").join("flushed.json").exists());

    bucketfeed_cmd()
        .args(["--data-dir", data_dir, "replay", "--recorded-watermarks"])
        .assert()
        .success()
        .stdout(contains("\"serial\": 2"))
        .stdout(contains("\"meta\": 0"))
        .stdout(contains("\"document\": 0"))
        .stdout(contains("\"index\": 0"));
}

#[test]
fn given_watermarks_gate_only_their_stores() {
    let dir = tempfile::TempDir::new().unwrap();
    seed(dir.path());
    bucketfeed_cmd()
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "replay",
            "--flushed-meta",
            "2",
        ])
        .assert()
        .success()
        .stdout(contains("\"meta\": 0"))
        .stdout(contains("\"document\": 2"));
}

#[test]
fn empty_data_dir_lists_no_buckets() {
    let dir = tempfile::TempDir::new().unwrap();
    bucketfeed_cmd()
        .args(["--data-dir", dir.path().to_str().unwrap(), "buckets"])
        .assert()
        .success()
        .stdout(contains("[]"));
}

#[test]
fn flush_reports_every_partition() {
    let dir = tempfile::TempDir::new().unwrap();
    bucketfeed_cmd()
        .env("BUCKETFEED_SHARDS", "3")
        .args(["--data-dir", dir.path().to_str().unwrap(), "flush"])
        .assert()
        .success()
        .stdout(contains("\"partition\": 2"));
}

#[test]
fn metrics_are_exposed() {
    let dir = tempfile::TempDir::new().unwrap();
    bucketfeed_cmd()
        .args(["--data-dir", dir.path().to_str().unwrap(), "metrics"])
        .assert()
        .success();
}

#[test]
fn invalid_shard_count_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    bucketfeed_cmd()
        .env("BUCKETFEED_SHARDS", "0")
        .args(["--data-dir", dir.path().to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("shards must be at least 1"));
}
