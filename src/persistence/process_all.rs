//! Whole-bucket commands driven by a selection.

use std::sync::Arc;

use super::provider::{Bucket, BucketEntry, PersistenceProvider};
use crate::condition::Selection;
use crate::error::Result;
use crate::types::{BucketInfo, Timestamp};

pub struct ProcessAllHandler {
    provider: Arc<dyn PersistenceProvider>,
}

impl ProcessAllHandler {
    pub fn new(provider: Arc<dyn PersistenceProvider>) -> Self {
        ProcessAllHandler { provider }
    }

    /// Remove every live document in the bucket matching `selection`.
    /// Returns the bucket's info afterwards and the number removed.
    pub async fn remove_location(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        selection: &str,
    ) -> Result<(BucketInfo, usize)> {
        let selection = Selection::parse(selection)?;
        let doomed: Vec<BucketEntry> = self
            .provider
            .entries(bucket, false)
            .await?
            .into_iter()
            .filter(|e| e.document.as_ref().map(|d| selection.matches(d)).unwrap_or(false))
            .collect();
        let mut info = self.provider.get_bucket_info(bucket).await?;
        for entry in &doomed {
            info = self
                .provider
                .remove(bucket, timestamp, &entry.doc_id)
                .await?
                .info;
        }
        tracing::info!("[PROCESS_ALL] {} removed {} documents", bucket, doomed.len());
        Ok((info, doomed.len()))
    }

    /// Entries (tombstones included) matching `selection`, or all of them.
    pub async fn stat_bucket(
        &self,
        bucket: &Bucket,
        selection: Option<&str>,
    ) -> Result<Vec<BucketEntry>> {
        let selection = selection.map(Selection::parse).transpose()?;
        let entries = self.provider.entries(bucket, true).await?;
        Ok(match selection {
            None => entries,
            Some(sel) => entries
                .into_iter()
                .filter(|e| match &e.document {
                    Some(doc) => sel.matches(doc),
                    None => e.removed,
                })
                .collect(),
        })
    }
}
