//! Backend contract the persistence threads drive. Every mutation returns the
//! bucket's info as the backend sees it right after the change, so the
//! caller can cross-check it against a fresh `get_bucket_info`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::types::{BucketId, BucketInfo, Document, DocumentId, DocumentUpdate, Timestamp};

pub type PartitionId = u16;
pub type IteratorId = u64;

/// A bucket on a specific partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub partition: PartitionId,
}

impl Bucket {
    pub fn new(id: BucketId, partition: PartitionId) -> Self {
        Bucket { id, partition }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.partition)
    }
}

/// Which fields a read returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSet {
    #[default]
    All,
    DocIdOnly,
    Fields(Vec<String>),
}

impl FieldSet {
    pub fn project(&self, doc: Document) -> Document {
        match self {
            FieldSet::All => doc,
            FieldSet::DocIdOnly => Document::new(doc.id),
            FieldSet::Fields(names) => {
                let mut out = Document::new(doc.id);
                for (name, value) in doc.fields {
                    if names.iter().any(|n| *n == name) {
                        out.fields.insert(name, value);
                    }
                }
                out
            }
        }
    }
}

/// One live document or tombstone in a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub doc_id: DocumentId,
    pub timestamp: Timestamp,
    pub removed: bool,
    pub size: u64,
    /// Present for live entries when the field set asks for content.
    pub document: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IteratorSpec {
    pub selection: Option<String>,
    pub include_removes: bool,
    pub field_set: FieldSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterateResult {
    pub entries: Vec<BucketEntry>,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationResult {
    pub info: BucketInfo,
    pub found: bool,
    /// Timestamp of the version the mutation replaced, 0 when none.
    pub existing_timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitResult {
    pub target1: BucketInfo,
    pub target2: BucketInfo,
}

#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    fn partition_count(&self) -> usize;

    async fn list_buckets(&self, partition: PartitionId) -> Result<Vec<BucketId>>;
    async fn get_bucket_info(&self, bucket: &Bucket) -> Result<BucketInfo>;
    async fn create_bucket(&self, bucket: &Bucket) -> Result<BucketInfo>;
    async fn delete_bucket(&self, bucket: &Bucket) -> Result<()>;
    async fn set_active_state(&self, bucket: &Bucket, active: bool) -> Result<BucketInfo>;

    async fn put(&self, bucket: &Bucket, timestamp: Timestamp, doc: Document) -> Result<BucketInfo>;
    /// An absent document yields `found = false` and still records a tombstone.
    async fn remove(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        id: &DocumentId,
    ) -> Result<MutationResult>;
    /// An absent document without `create_if_missing` yields `found = false` and no change.
    async fn update(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        update: DocumentUpdate,
    ) -> Result<MutationResult>;
    /// Document and its timestamp, `None` when the bucket does not hold it.
    async fn get(
        &self,
        bucket: &Bucket,
        field_set: &FieldSet,
        id: &DocumentId,
    ) -> Result<Option<(Timestamp, Document)>>;

    /// All entries of a bucket, tombstones included when asked.
    async fn entries(&self, bucket: &Bucket, include_removes: bool) -> Result<Vec<BucketEntry>>;
    async fn create_iterator(&self, bucket: &Bucket, spec: IteratorSpec) -> Result<IteratorId>;
    async fn iterate(&self, iterator: IteratorId, max_bytes: usize) -> Result<IterateResult>;
    async fn destroy_iterator(&self, iterator: IteratorId) -> Result<()>;

    async fn split(&self, source: &Bucket, target1: &Bucket, target2: &Bucket)
        -> Result<SplitResult>;
    async fn join(&self, source1: &Bucket, source2: &Bucket, target: &Bucket)
        -> Result<BucketInfo>;
    /// Remove entries written at `timestamps` that are still the current version.
    async fn revert(&self, bucket: &Bucket, timestamps: &[Timestamp]) -> Result<BucketInfo>;
    /// Consistency pass over one bucket. Returns true when anything was corrected.
    async fn maintain(&self, bucket: &Bucket) -> Result<bool>;
}
