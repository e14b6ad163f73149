//! Commands accepted by the persistence shards and the replies they produce.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::filestor::BucketLockGuard;
use super::merge::{MergeGuard, MergePeer};
use super::provider::{Bucket, BucketEntry, FieldSet, IteratorId, IteratorSpec, PartitionId};
use crate::error::{FeedError, ResultCode};
use crate::types::{BucketId, BucketInfo, Document, DocumentId, DocumentUpdate, Timestamp};

/// One step of a [`Command::MultiOperation`].
#[derive(Debug, Clone, PartialEq)]
pub enum MultiOp {
    Put { timestamp: Timestamp, document: Document },
    Remove { timestamp: Timestamp, doc_id: DocumentId },
}

#[derive(Debug, Clone)]
pub enum Command {
    Put {
        bucket: Bucket,
        timestamp: Timestamp,
        document: Document,
        condition: Option<String>,
    },
    Remove {
        bucket: Bucket,
        timestamp: Timestamp,
        doc_id: DocumentId,
        condition: Option<String>,
    },
    Update {
        bucket: Bucket,
        timestamp: Timestamp,
        update: DocumentUpdate,
        condition: Option<String>,
    },
    Get {
        bucket: Bucket,
        doc_id: DocumentId,
        field_set: FieldSet,
    },
    MultiOperation {
        bucket: Bucket,
        operations: Vec<MultiOp>,
    },
    Revert {
        bucket: Bucket,
        timestamps: Vec<Timestamp>,
    },
    CreateBucket {
        bucket: Bucket,
    },
    /// Rejected when `expected` is given and differs from the backend's info.
    DeleteBucket {
        bucket: Bucket,
        expected: Option<BucketInfo>,
    },
    CreateIterator {
        bucket: Bucket,
        spec: IteratorSpec,
    },
    GetIter {
        bucket: Bucket,
        iterator: IteratorId,
        max_bytes: usize,
    },
    DestroyIterator {
        bucket: Bucket,
        iterator: IteratorId,
    },
    ReadBucketList {
        partition: PartitionId,
    },
    ReadBucketInfo {
        bucket: Bucket,
    },
    JoinBuckets {
        sources: Vec<BucketId>,
        target: Bucket,
    },
    SetBucketState {
        bucket: Bucket,
        active: bool,
    },
    /// Move `bucket.id` from `source_partition` into `bucket.partition`.
    InternalBucketJoin {
        bucket: Bucket,
        source_partition: PartitionId,
    },
    SplitBucket {
        bucket: Bucket,
    },
    RepairBucket {
        bucket: Bucket,
    },
    RecheckBucketInfo {
        bucket: Bucket,
    },
    MergeBucket {
        bucket: Bucket,
        peers: Vec<Arc<dyn MergePeer>>,
    },
    RemoveLocation {
        bucket: Bucket,
        timestamp: Timestamp,
        selection: String,
    },
    StatBucket {
        bucket: Bucket,
        selection: Option<String>,
    },
}

impl Command {
    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Remove { .. } => "remove",
            Command::Update { .. } => "update",
            Command::Get { .. } => "get",
            Command::MultiOperation { .. } => "multi_operation",
            Command::Revert { .. } => "revert",
            Command::CreateBucket { .. } => "create_bucket",
            Command::DeleteBucket { .. } => "delete_bucket",
            Command::CreateIterator { .. } => "create_iterator",
            Command::GetIter { .. } => "get_iter",
            Command::DestroyIterator { .. } => "destroy_iterator",
            Command::ReadBucketList { .. } => "read_bucket_list",
            Command::ReadBucketInfo { .. } => "read_bucket_info",
            Command::JoinBuckets { .. } => "join_buckets",
            Command::SetBucketState { .. } => "set_bucket_state",
            Command::InternalBucketJoin { .. } => "internal_bucket_join",
            Command::SplitBucket { .. } => "split_bucket",
            Command::RepairBucket { .. } => "repair_bucket",
            Command::RecheckBucketInfo { .. } => "recheck_bucket_info",
            Command::MergeBucket { .. } => "merge_bucket",
            Command::RemoveLocation { .. } => "remove_location",
            Command::StatBucket { .. } => "stat_bucket",
        }
    }

    /// Partition the command runs on; decides which shard receives it.
    pub fn partition(&self) -> PartitionId {
        match self {
            Command::ReadBucketList { partition } => *partition,
            Command::JoinBuckets { target, .. } => target.partition,
            other => other.bucket().map(|b| b.partition).unwrap_or(0),
        }
    }

    /// Bucket the command locks while it runs.
    pub fn bucket(&self) -> Option<Bucket> {
        match self {
            Command::Put { bucket, .. }
            | Command::Remove { bucket, .. }
            | Command::Update { bucket, .. }
            | Command::Get { bucket, .. }
            | Command::MultiOperation { bucket, .. }
            | Command::Revert { bucket, .. }
            | Command::CreateBucket { bucket }
            | Command::DeleteBucket { bucket, .. }
            | Command::CreateIterator { bucket, .. }
            | Command::GetIter { bucket, .. }
            | Command::DestroyIterator { bucket, .. }
            | Command::ReadBucketInfo { bucket }
            | Command::SetBucketState { bucket, .. }
            | Command::InternalBucketJoin { bucket, .. }
            | Command::SplitBucket { bucket }
            | Command::RepairBucket { bucket }
            | Command::RecheckBucketInfo { bucket }
            | Command::MergeBucket { bucket, .. }
            | Command::RemoveLocation { bucket, .. }
            | Command::StatBucket { bucket, .. } => Some(*bucket),
            Command::JoinBuckets { target, .. } => Some(*target),
            Command::ReadBucketList { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    None,
    BucketInfo(BucketInfo),
    /// Update and remove outcome.
    Mutation {
        info: BucketInfo,
        found: bool,
        existing_timestamp: Timestamp,
    },
    Get {
        document: Option<Document>,
        timestamp: Timestamp,
    },
    Iterator(IteratorId),
    Entries {
        entries: Vec<BucketEntry>,
        completed: bool,
    },
    BucketList(Vec<BucketId>),
    Split {
        target1: (BucketId, BucketInfo),
        target2: (BucketId, BucketInfo),
    },
    Repair {
        info: BucketInfo,
        altered: bool,
    },
    Merge {
        info: BucketInfo,
        applied: usize,
    },
    RemoveLocation {
        info: BucketInfo,
        removed: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: ResultCode,
    pub message: String,
    pub payload: ReplyPayload,
}

impl Reply {
    pub fn ok(payload: ReplyPayload) -> Self {
        Reply {
            code: ResultCode::Ok,
            message: String::new(),
            payload,
        }
    }

    pub fn from_error(err: &FeedError) -> Self {
        Reply {
            code: err.result_code(),
            message: err.to_string(),
            payload: ReplyPayload::None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn bucket_info(&self) -> Option<BucketInfo> {
        match &self.payload {
            ReplyPayload::BucketInfo(info)
            | ReplyPayload::Mutation { info, .. }
            | ReplyPayload::Repair { info, .. }
            | ReplyPayload::Merge { info, .. }
            | ReplyPayload::RemoveLocation { info, .. } => Some(*info),
            _ => None,
        }
    }
}

/// A dequeued command holding its bucket lock.
pub struct LockedMessage {
    pub id: Uuid,
    pub command: Command,
    pub reply: oneshot::Sender<Reply>,
    pub lock: BucketLockGuard,
    pub merge: Option<MergeGuard>,
    pub queued_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_follows_bucket_partition() {
        let bucket = Bucket::new(BucketId::new(16, 3), 1);
        let cmd = Command::SplitBucket { bucket };
        assert_eq!(cmd.partition(), 1);
        assert_eq!(cmd.bucket(), Some(bucket));
        assert_eq!(cmd.name(), "split_bucket");

        let list = Command::ReadBucketList { partition: 2 };
        assert_eq!(list.partition(), 2);
        assert_eq!(list.bucket(), None);
    }

    #[test]
    fn error_reply_carries_code_and_message() {
        let reply = Reply::from_error(&FeedError::PreconditionFailed("year > 2000".into()));
        assert_eq!(reply.code, ResultCode::TestAndSetConditionFailed);
        assert!(reply.message.contains("year > 2000"));
        assert!(!reply.is_success());
        assert_eq!(reply.bucket_info(), None);
    }
}
