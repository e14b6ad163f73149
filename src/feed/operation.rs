//! Logical feed operations. Each carries the serial number it was logged
//! with; lids are filled in by the feed view's prepare step and recorded so a
//! replay that skips the metadata store can still address the other stores.

use serde::{Deserialize, Serialize};

use crate::types::{BucketId, Document, DocumentId, DocumentUpdate, Lid, SerialNum, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutOperation {
    pub serial: SerialNum,
    pub bucket: BucketId,
    pub timestamp: Timestamp,
    pub document: Document,
    #[serde(default)]
    pub lid: Lid,
    /// Lid the document had before this put, 0 when it is new.
    #[serde(default)]
    pub prev_lid: Lid,
    #[serde(default)]
    pub prev_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOperation {
    pub serial: SerialNum,
    pub bucket: BucketId,
    pub timestamp: Timestamp,
    pub update: DocumentUpdate,
    #[serde(default)]
    pub lid: Lid,
    #[serde(default)]
    pub prev_timestamp: Timestamp,
    /// The document did not exist and is created from the update.
    #[serde(default)]
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveOperation {
    pub serial: SerialNum,
    pub bucket: BucketId,
    pub timestamp: Timestamp,
    pub doc_id: DocumentId,
    /// Lid of the removed document, 0 when it was not present.
    #[serde(default)]
    pub lid: Lid,
    #[serde(default)]
    pub prev_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveOperation {
    pub serial: SerialNum,
    pub doc_id: DocumentId,
    pub source_bucket: BucketId,
    pub target_bucket: BucketId,
    #[serde(default)]
    pub source_lid: Lid,
    /// 0 keeps the source lid.
    #[serde(default)]
    pub target_lid: Lid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketOperation {
    pub serial: SerialNum,
    pub bucket: BucketId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinBucketsOperation {
    pub serial: SerialNum,
    pub sources: Vec<BucketId>,
    pub target: BucketId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitBucketOperation {
    pub serial: SerialNum,
    pub source: BucketId,
    pub target1: BucketId,
    pub target2: BucketId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneRemovedOperation {
    pub serial: SerialNum,
    pub older_than: Timestamp,
    #[serde(default)]
    pub bucket: Option<BucketId>,
}

/// Forget the tombstone a remove left for `doc_id` at `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropTombstoneOperation {
    pub serial: SerialNum,
    pub bucket: BucketId,
    pub doc_id: DocumentId,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactLidSpaceOperation {
    pub serial: SerialNum,
    pub lid_limit: Lid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedOperation {
    Put(PutOperation),
    Update(UpdateOperation),
    Remove(RemoveOperation),
    Move(MoveOperation),
    DeleteBucket(BucketOperation),
    CreateBucket(BucketOperation),
    JoinBuckets(JoinBucketsOperation),
    SplitBucket(SplitBucketOperation),
    PruneRemoved(PruneRemovedOperation),
    DropTombstone(DropTombstoneOperation),
    CompactLidSpace(CompactLidSpaceOperation),
}

impl FeedOperation {
    pub fn serial(&self) -> SerialNum {
        match self {
            FeedOperation::Put(op) => op.serial,
            FeedOperation::Update(op) => op.serial,
            FeedOperation::Remove(op) => op.serial,
            FeedOperation::Move(op) => op.serial,
            FeedOperation::DeleteBucket(op) | FeedOperation::CreateBucket(op) => op.serial,
            FeedOperation::JoinBuckets(op) => op.serial,
            FeedOperation::SplitBucket(op) => op.serial,
            FeedOperation::PruneRemoved(op) => op.serial,
            FeedOperation::DropTombstone(op) => op.serial,
            FeedOperation::CompactLidSpace(op) => op.serial,
        }
    }

    pub fn set_serial(&mut self, serial: SerialNum) {
        match self {
            FeedOperation::Put(op) => op.serial = serial,
            FeedOperation::Update(op) => op.serial = serial,
            FeedOperation::Remove(op) => op.serial = serial,
            FeedOperation::Move(op) => op.serial = serial,
            FeedOperation::DeleteBucket(op) | FeedOperation::CreateBucket(op) => op.serial = serial,
            FeedOperation::JoinBuckets(op) => op.serial = serial,
            FeedOperation::SplitBucket(op) => op.serial = serial,
            FeedOperation::PruneRemoved(op) => op.serial = serial,
            FeedOperation::DropTombstone(op) => op.serial = serial,
            FeedOperation::CompactLidSpace(op) => op.serial = serial,
        }
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedOperation::Put(_) => "put",
            FeedOperation::Update(_) => "update",
            FeedOperation::Remove(_) => "remove",
            FeedOperation::Move(_) => "move",
            FeedOperation::DeleteBucket(_) => "delete_bucket",
            FeedOperation::CreateBucket(_) => "create_bucket",
            FeedOperation::JoinBuckets(_) => "join_buckets",
            FeedOperation::SplitBucket(_) => "split_bucket",
            FeedOperation::PruneRemoved(_) => "prune_removed",
            FeedOperation::DropTombstone(_) => "drop_tombstone",
            FeedOperation::CompactLidSpace(_) => "compact_lid_space",
        }
    }

    /// Whether the reply may be acknowledged before commit under a visibility delay.
    pub fn allows_early_ack(&self) -> bool {
        matches!(
            self,
            FeedOperation::Put(_) | FeedOperation::Update(_) | FeedOperation::Remove(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    #[test]
    fn json_uses_type_tag() {
        let id = DocumentId::parse("id:ns:t:n=1:a").unwrap();
        let op = FeedOperation::Put(PutOperation {
            serial: 7,
            bucket: BucketId::new(16, 1),
            timestamp: 10,
            document: Document::new(id).with_field("year", FieldValue::Integer(1)),
            lid: 1,
            prev_lid: 0,
            prev_timestamp: 0,
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "put");
        assert_eq!(json["serial"], 7);
        let back: FeedOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn set_serial_and_kind() {
        let mut op = FeedOperation::CompactLidSpace(CompactLidSpaceOperation {
            serial: 0,
            lid_limit: 4,
        });
        op.set_serial(12);
        assert_eq!(op.serial(), 12);
        assert_eq!(op.kind(), "compact_lid_space");
        assert!(!op.allows_early_ack());
    }
}
