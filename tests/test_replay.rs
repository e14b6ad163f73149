//! Replay and feed-view integration tests
//!
//! Operations are logged by one document database and replayed into fresh
//! ones whose stores report different flushed serials.

mod common;

use bucketfeed::feed::operation::{PutOperation, RemoveOperation};
use bucketfeed::feed::{FeedOperation, OpLog};
use bucketfeed::metrics::MetricsRegistry;
use bucketfeed::persistence::{DocumentDb, DocumentDbConfig, FlushedSerials, StoreWrites};
use bucketfeed::types::{DocumentUpdate, FieldValue};
use common::*;
use std::time::Duration;
use tempfile::TempDir;

fn db_config(flushed: FlushedSerials, visibility_delay: Duration) -> DocumentDbConfig {
    let mut config = DocumentDbConfig::from_storage(&storage_config(1), 0);
    config.flushed = flushed;
    config.visibility_delay = visibility_delay;
    config
}

/// Feed a put, a second put and a removal of the first into a logging
/// database and return the logged operations.
async fn logged_ops(dir: &TempDir) -> Vec<FeedOperation> {
    let metrics = MetricsRegistry::new().unwrap();
    let oplog = OpLog::open(dir.path(), "test-node").unwrap();
    let db = DocumentDb::new(
        db_config(FlushedSerials::default(), Duration::ZERO),
        &metrics,
        Some(oplog),
    );
    db.put(bucket_of(7), 10, song(7, "a", "So What", 1959)).await.unwrap();
    db.put(bucket_of(7), 11, song(7, "b", "Blue in Green", 1959)).await.unwrap();
    db.remove(bucket_of(7), 12, doc_id(7, "a")).await.unwrap();
    OpLog::open(dir.path(), "test-node").unwrap().read_from(0).unwrap()
}

async fn replay_with(ops: &[FeedOperation], flushed: FlushedSerials) -> (DocumentDb, StoreWrites) {
    let metrics = MetricsRegistry::new().unwrap();
    let db = DocumentDb::new(db_config(flushed, Duration::ZERO), &metrics, None);
    db.replay(ops.to_vec()).await.unwrap();
    let writes = db.store_writes();
    (db, writes)
}

// ── watermark gating ────────────────────────────────────────────────────

mod gating {
    use super::*;

    #[tokio::test]
    async fn logged_operations_carry_serials_and_lids() {
        let dir = TempDir::new().unwrap();
        let ops = logged_ops(&dir).await;
        assert_eq!(ops.len(), 3);
        let serials: Vec<u64> = ops.iter().map(|op| op.serial()).collect();
        assert_eq!(serials, vec![1, 2, 3]);
        match &ops[2] {
            FeedOperation::Remove(op) => assert_eq!(op.lid, 1),
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[tokio::test]
    async fn flushed_document_store_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let ops = logged_ops(&dir).await;
        let (_, baseline) = replay_with(&ops, FlushedSerials::default()).await;
        let (_, gated) = replay_with(
            &ops,
            FlushedSerials {
                document: 2,
                ..FlushedSerials::default()
            },
        )
        .await;
        // Serials 1 and 2 are both puts into the document store.
        assert_eq!(gated.document + 2, baseline.document);
        assert_eq!(gated.meta, baseline.meta);
        assert_eq!(gated.index, baseline.index);
    }

    #[tokio::test]
    async fn flushed_meta_store_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let ops = logged_ops(&dir).await;
        let (_, baseline) = replay_with(&ops, FlushedSerials::default()).await;
        assert!(baseline.meta >= 3);
        let (_, gated) = replay_with(
            &ops,
            FlushedSerials {
                meta: 3,
                ..FlushedSerials::default()
            },
        )
        .await;
        assert_eq!(gated.meta, 0);
        assert_eq!(gated.document, baseline.document);
    }

    #[tokio::test]
    async fn fully_flushed_replay_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let ops = logged_ops(&dir).await;
        let (db, writes) = replay_with(
            &ops,
            FlushedSerials {
                meta: 3,
                document: 3,
                index: 3,
                attribute: 3,
            },
        )
        .await;
        assert_eq!(writes, StoreWrites::default());
        assert_eq!(db.current_serial(), 3);
    }
}

// ── replay outcomes ─────────────────────────────────────────────────────

mod outcomes {
    use super::*;

    #[tokio::test]
    async fn put_then_remove_leaves_nothing() {
        let ops = vec![
            FeedOperation::Put(PutOperation {
                serial: 10,
                bucket: bucket_of(7),
                timestamp: 10,
                document: song(7, "d1", "So What", 1959),
                lid: 0,
                prev_lid: 0,
                prev_timestamp: 0,
            }),
            FeedOperation::Remove(RemoveOperation {
                serial: 11,
                bucket: bucket_of(7),
                timestamp: 11,
                doc_id: doc_id(7, "d1"),
                lid: 0,
                prev_timestamp: 0,
            }),
        ];
        let (db, _) = replay_with(&ops, FlushedSerials::default()).await;
        assert_eq!(db.current_serial(), 11);
        assert!(db.get(&doc_id(7, "d1")).unwrap().is_none());
        assert_eq!(db.bucket_info(&bucket_of(7)).doc_count, 0);
        assert!(db.view().get_document(1).unwrap().is_none());
        assert!(db.index().unwrap().search("title", "what").is_empty());
    }

    #[tokio::test]
    async fn replay_restores_what_was_fed() {
        let dir = TempDir::new().unwrap();
        let ops = logged_ops(&dir).await;
        let (db, _) = replay_with(&ops, FlushedSerials::default()).await;
        assert!(db.get(&doc_id(7, "a")).unwrap().is_none());
        let (entry, doc) = db.get(&doc_id(7, "b")).unwrap().unwrap();
        assert_eq!(entry.timestamp, 11);
        assert_eq!(doc.get("title"), Some(&FieldValue::Text("Blue in Green".into())));
        let info = db.bucket_info(&bucket_of(7));
        assert_eq!((info.doc_count, info.entry_count), (1, 2));
    }

    #[tokio::test]
    async fn new_feed_continues_after_replayed_serials() {
        let dir = TempDir::new().unwrap();
        let ops = logged_ops(&dir).await;
        let (db, _) = replay_with(&ops, FlushedSerials::default()).await;
        let op = db
            .put(bucket_of(7), 20, song(7, "c", "All Blues", 1959))
            .await
            .unwrap();
        assert_eq!(op.serial, 4);
    }
}

// ── update scope ────────────────────────────────────────────────────────

mod updates {
    use super::*;

    #[tokio::test]
    async fn attribute_only_update_skips_indexed_store() {
        let metrics = MetricsRegistry::new().unwrap();
        let db = DocumentDb::new(db_config(FlushedSerials::default(), Duration::ZERO), &metrics, None);
        db.put(bucket_of(7), 10, song(7, "a", "So What", 1959)).await.unwrap();
        let before = db.store_writes();

        db.update(
            bucket_of(7),
            11,
            DocumentUpdate::new(doc_id(7, "a")).assign("year", FieldValue::Integer(1960)),
        )
        .await
        .unwrap();
        let after = db.store_writes();
        assert_eq!(after.index, before.index);
        assert_eq!(after.attribute, before.attribute + 1);

        let (_, doc) = db.get(&doc_id(7, "a")).unwrap().unwrap();
        assert_eq!(doc.get("year"), Some(&FieldValue::Integer(1960)));
    }

    #[tokio::test]
    async fn indexed_update_is_searchable() {
        let metrics = MetricsRegistry::new().unwrap();
        let db = DocumentDb::new(db_config(FlushedSerials::default(), Duration::ZERO), &metrics, None);
        db.put(bucket_of(7), 10, song(7, "a", "So What", 1959)).await.unwrap();
        db.update(
            bucket_of(7),
            11,
            DocumentUpdate::new(doc_id(7, "a")).assign("title", FieldValue::Text("Milestones".into())),
        )
        .await
        .unwrap();
        let index = db.index().unwrap();
        assert_eq!(index.search("title", "milestones"), vec![1]);
        assert!(index.search("title", "what").is_empty());
    }
}

// ── visibility delay ────────────────────────────────────────────────────

mod visibility {
    use super::*;

    #[tokio::test]
    async fn delayed_commit_becomes_visible_after_commit() {
        let metrics = MetricsRegistry::new().unwrap();
        let db = DocumentDb::new(
            db_config(FlushedSerials::default(), Duration::from_secs(3600)),
            &metrics,
            None,
        );
        db.put(bucket_of(7), 10, song(7, "a", "So What", 1959)).await.unwrap();
        db.sync().await;
        assert!(db.index().unwrap().search("title", "what").is_empty());
        db.commit().await.unwrap();
        assert_eq!(db.index().unwrap().search("title", "what"), vec![1]);
    }

    #[tokio::test]
    async fn flush_all_advances_watermarks() {
        let metrics = MetricsRegistry::new().unwrap();
        let db = DocumentDb::new(db_config(FlushedSerials::default(), Duration::ZERO), &metrics, None);
        db.put(bucket_of(7), 10, song(7, "a", "So What", 1959)).await.unwrap();
        db.put(bucket_of(7), 11, song(7, "b", "Blue in Green", 1959)).await.unwrap();
        let flushed = db.flush_all().await.unwrap();
        assert_eq!(flushed.meta, 2);
        assert_eq!(flushed.document, 2);
        assert_eq!(flushed.max(), 2);
    }
}
