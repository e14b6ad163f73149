use dashmap::DashSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::provider::{Bucket, BucketEntry, PersistenceProvider};
use crate::error::{FeedError, Result};
use crate::types::{BucketId, BucketInfo, DocumentId, Timestamp};

/// Buckets with an active merge. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MergeTracker {
    inner: Arc<DashSet<BucketId>>,
}

/// Marks a bucket as merging until dropped.
pub struct MergeGuard {
    tracker: MergeTracker,
    bucket: BucketId,
}

impl MergeTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashSet::new()),
        }
    }

    /// Claim the bucket for a merge, or fail if one is already active.
    pub fn try_start(&self, bucket: BucketId) -> Result<MergeGuard> {
        if !self.inner.insert(bucket) {
            return Err(FeedError::MergeAlreadyActive(bucket.to_string()));
        }
        tracing::debug!("[MERGE] {} started", bucket);
        Ok(MergeGuard {
            tracker: self.clone(),
            bucket,
        })
    }

    pub fn is_merging(&self, bucket: &BucketId) -> bool {
        self.inner.contains(bucket)
    }

    pub fn active_count(&self) -> usize {
        self.inner.len()
    }
}

impl Default for MergeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.tracker.inner.remove(&self.bucket);
        tracing::debug!("[MERGE] {} finished", self.bucket);
    }
}

/// Another replica's view of a bucket.
pub trait MergePeer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    /// Live entries (with documents) and tombstones the peer holds for `bucket`.
    fn entries(&self, bucket: &BucketId) -> Result<Vec<BucketEntry>>;
}

/// Reconciles a bucket with its peers: for every document the newest
/// timestamp across local and peer entries wins.
pub struct MergeHandler {
    provider: Arc<dyn PersistenceProvider>,
}

impl MergeHandler {
    pub fn new(provider: Arc<dyn PersistenceProvider>) -> Self {
        MergeHandler { provider }
    }

    /// Apply every peer entry newer than the local one. Returns the bucket's
    /// info afterwards and how many entries were applied.
    pub async fn merge(
        &self,
        bucket: &Bucket,
        peers: &[Arc<dyn MergePeer>],
    ) -> Result<(BucketInfo, usize)> {
        let local: HashMap<DocumentId, Timestamp> = self
            .provider
            .entries(bucket, true)
            .await?
            .into_iter()
            .map(|e| (e.doc_id, e.timestamp))
            .collect();

        let mut newest: HashMap<DocumentId, BucketEntry> = HashMap::new();
        for peer in peers {
            let entries = peer.entries(&bucket.id)?;
            tracing::debug!(
                "[MERGE] {} peer {} offers {} entries",
                bucket,
                peer.name(),
                entries.len()
            );
            for entry in entries {
                if local
                    .get(&entry.doc_id)
                    .map(|ts| entry.timestamp <= *ts)
                    .unwrap_or(false)
                {
                    continue;
                }
                match newest.get(&entry.doc_id) {
                    Some(current) if current.timestamp >= entry.timestamp => {}
                    _ => {
                        newest.insert(entry.doc_id.clone(), entry);
                    }
                }
            }
        }

        let mut ordered: Vec<BucketEntry> = newest.into_values().collect();
        ordered.sort_by_key(|e| e.timestamp);
        let mut applied = 0;
        for entry in ordered {
            if entry.removed {
                self.provider
                    .remove(bucket, entry.timestamp, &entry.doc_id)
                    .await?;
            } else if let Some(doc) = entry.document {
                self.provider.put(bucket, entry.timestamp, doc).await?;
            } else {
                tracing::warn!(
                    "[MERGE] {} entry {} has no document, skipped",
                    bucket,
                    entry.doc_id
                );
                continue;
            }
            applied += 1;
        }
        let info = self.provider.get_bucket_info(bucket).await?;
        tracing::info!("[MERGE] {} applied {} entries", bucket, applied);
        Ok((info, applied))
    }
}
