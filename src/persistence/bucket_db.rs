use dashmap::DashMap;

use super::provider::{Bucket, PartitionId};
use crate::types::{BucketId, BucketInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntryInfo {
    pub info: BucketInfo,
    pub partition: PartitionId,
}

/// Node-wide bucket index. Only the persistence thread owning a bucket
/// writes its entry, and only after the backend has confirmed the change.
#[derive(Default)]
pub struct BucketDatabase {
    entries: DashMap<BucketId, BucketEntryInfo>,
}

impl BucketDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &BucketId) -> Option<BucketEntryInfo> {
        self.entries.get(bucket).map(|e| *e.value())
    }

    pub fn info(&self, bucket: &BucketId) -> Option<BucketInfo> {
        self.get(bucket).map(|e| e.info)
    }

    pub fn update(&self, bucket: &Bucket, info: BucketInfo) {
        self.entries.insert(
            bucket.id,
            BucketEntryInfo {
                info,
                partition: bucket.partition,
            },
        );
    }

    pub fn remove(&self, bucket: &BucketId) -> Option<BucketEntryInfo> {
        self.entries.remove(bucket).map(|(_, e)| e)
    }

    pub fn contains(&self, bucket: &BucketId) -> bool {
        self.entries.contains_key(bucket)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buckets on one partition, sorted.
    pub fn buckets_on(&self, partition: PartitionId) -> Vec<BucketId> {
        let mut out: Vec<BucketId> = self
            .entries
            .iter()
            .filter(|e| e.value().partition == partition)
            .map(|e| *e.key())
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_get_remove() {
        let db = BucketDatabase::new();
        let bucket = Bucket::new(BucketId::new(16, 4), 1);
        assert!(db.get(&bucket.id).is_none());
        let info = BucketInfo {
            doc_count: 3,
            ..BucketInfo::default()
        };
        db.update(&bucket, info);
        assert_eq!(db.info(&bucket.id), Some(info));
        assert_eq!(db.buckets_on(1), vec![bucket.id]);
        assert!(db.buckets_on(0).is_empty());
        assert_eq!(db.remove(&bucket.id).map(|e| e.partition), Some(1));
        assert!(db.is_empty());
    }
}
