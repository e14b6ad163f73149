#![allow(dead_code)]

use async_trait::async_trait;
use bucketfeed::error::Result;
use bucketfeed::metrics::MetricsRegistry;
use bucketfeed::persistence::{
    Bucket, BucketEntry, DocumentDbProvider, FieldSet, IterateResult, IteratorId, IteratorSpec,
    MergePeer, MutationResult, PartitionId, PersistenceProvider, PersistenceShards, SplitResult,
};
use bucketfeed::store::schema::DocSchema;
use bucketfeed::types::{
    BucketId, BucketInfo, Document, DocumentId, DocumentUpdate, FieldValue, Timestamp,
};
use bucketfeed::StorageConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub fn storage_config(shards: usize) -> StorageConfig {
    StorageConfig {
        node_id: "test-node".to_string(),
        shards,
        doc_type: "song".to_string(),
        schema: DocSchema::builder()
            .indexed("title")
            .attribute("year")
            .attribute("plays")
            .build(),
        ..StorageConfig::default()
    }
}

pub fn doc_id(location: u32, local: &str) -> DocumentId {
    DocumentId::parse(&format!("id:music:song:n={}:{}", location, local)).unwrap()
}

pub fn song(location: u32, local: &str, title: &str, year: i64) -> Document {
    Document::new(doc_id(location, local))
        .with_field("title", FieldValue::Text(title.to_string()))
        .with_field("year", FieldValue::Integer(year))
}

pub fn bucket_of(location: u32) -> BucketId {
    BucketId::new(16, location as u64)
}

pub struct Node {
    pub metrics: MetricsRegistry,
    pub provider: Arc<DocumentDbProvider>,
    pub shards: PersistenceShards,
}

impl Node {
    pub fn start(config: &StorageConfig) -> Self {
        let metrics = MetricsRegistry::new().unwrap();
        let provider = Arc::new(DocumentDbProvider::new(config, &metrics));
        let shards = PersistenceShards::start(config, provider.clone(), &metrics);
        Node {
            metrics,
            provider,
            shards,
        }
    }

    pub fn bucket(&self, location: u32) -> Bucket {
        self.shards.bucket(bucket_of(location))
    }
}

/// A replica holding a fixed set of entries per bucket.
#[derive(Debug, Default)]
pub struct StaticPeer {
    pub name: String,
    pub entries: HashMap<BucketId, Vec<BucketEntry>>,
}

impl StaticPeer {
    pub fn new(name: &str) -> Self {
        StaticPeer {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn with_put(mut self, bucket: BucketId, timestamp: Timestamp, doc: Document) -> Self {
        self.entries.entry(bucket).or_default().push(BucketEntry {
            doc_id: doc.id.clone(),
            timestamp,
            removed: false,
            size: doc.serialized_size(),
            document: Some(doc),
        });
        self
    }

    pub fn with_remove(mut self, bucket: BucketId, timestamp: Timestamp, id: DocumentId) -> Self {
        self.entries.entry(bucket).or_default().push(BucketEntry {
            size: id.as_str().len() as u64,
            doc_id: id,
            timestamp,
            removed: true,
            document: None,
        });
        self
    }
}

impl MergePeer for StaticPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries(&self, bucket: &BucketId) -> Result<Vec<BucketEntry>> {
        Ok(self.entries.get(bucket).cloned().unwrap_or_default())
    }
}

/// A peer whose `entries` blocks until released, keeping a merge active.
#[derive(Debug, Default)]
pub struct GatedPeer {
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedPeer {
    pub fn release(&self) {
        let (lock, cvar) = &*self.gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl MergePeer for GatedPeer {
    fn name(&self) -> &str {
        "gated"
    }

    fn entries(&self, _bucket: &BucketId) -> Result<Vec<BucketEntry>> {
        let (lock, cvar) = &*self.gate;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
        Ok(Vec::new())
    }
}

/// Delegates to a real provider, but while `tamper` is set reports a wrong
/// checksum from mutations.
pub struct TamperingProvider {
    pub inner: Arc<DocumentDbProvider>,
    pub tamper: AtomicBool,
}

impl TamperingProvider {
    pub fn new(inner: Arc<DocumentDbProvider>) -> Self {
        TamperingProvider {
            inner,
            tamper: AtomicBool::new(false),
        }
    }

    fn skew(&self, mut info: BucketInfo) -> BucketInfo {
        if self.tamper.load(Ordering::SeqCst) {
            info.checksum ^= 0x5a5a;
        }
        info
    }
}

#[async_trait]
impl PersistenceProvider for TamperingProvider {
    fn partition_count(&self) -> usize {
        self.inner.partition_count()
    }

    async fn list_buckets(&self, partition: PartitionId) -> Result<Vec<BucketId>> {
        self.inner.list_buckets(partition).await
    }

    async fn get_bucket_info(&self, bucket: &Bucket) -> Result<BucketInfo> {
        self.inner.get_bucket_info(bucket).await
    }

    async fn create_bucket(&self, bucket: &Bucket) -> Result<BucketInfo> {
        self.inner.create_bucket(bucket).await
    }

    async fn delete_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.inner.delete_bucket(bucket).await
    }

    async fn set_active_state(&self, bucket: &Bucket, active: bool) -> Result<BucketInfo> {
        self.inner.set_active_state(bucket, active).await
    }

    async fn put(&self, bucket: &Bucket, timestamp: Timestamp, doc: Document) -> Result<BucketInfo> {
        let info = self.inner.put(bucket, timestamp, doc).await?;
        Ok(self.skew(info))
    }

    async fn remove(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        id: &DocumentId,
    ) -> Result<MutationResult> {
        let mut result = self.inner.remove(bucket, timestamp, id).await?;
        result.info = self.skew(result.info);
        Ok(result)
    }

    async fn update(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        update: DocumentUpdate,
    ) -> Result<MutationResult> {
        let mut result = self.inner.update(bucket, timestamp, update).await?;
        result.info = self.skew(result.info);
        Ok(result)
    }

    async fn get(
        &self,
        bucket: &Bucket,
        field_set: &FieldSet,
        id: &DocumentId,
    ) -> Result<Option<(Timestamp, Document)>> {
        self.inner.get(bucket, field_set, id).await
    }

    async fn entries(&self, bucket: &Bucket, include_removes: bool) -> Result<Vec<BucketEntry>> {
        self.inner.entries(bucket, include_removes).await
    }

    async fn create_iterator(&self, bucket: &Bucket, spec: IteratorSpec) -> Result<IteratorId> {
        self.inner.create_iterator(bucket, spec).await
    }

    async fn iterate(&self, iterator: IteratorId, max_bytes: usize) -> Result<IterateResult> {
        self.inner.iterate(iterator, max_bytes).await
    }

    async fn destroy_iterator(&self, iterator: IteratorId) -> Result<()> {
        self.inner.destroy_iterator(iterator).await
    }

    async fn split(
        &self,
        source: &Bucket,
        target1: &Bucket,
        target2: &Bucket,
    ) -> Result<SplitResult> {
        self.inner.split(source, target1, target2).await
    }

    async fn join(&self, source1: &Bucket, source2: &Bucket, target: &Bucket) -> Result<BucketInfo> {
        self.inner.join(source1, source2, target).await
    }

    async fn revert(&self, bucket: &Bucket, timestamps: &[Timestamp]) -> Result<BucketInfo> {
        self.inner.revert(bucket, timestamps).await
    }

    async fn maintain(&self, bucket: &Bucket) -> Result<bool> {
        self.inner.maintain(bucket).await
    }
}
