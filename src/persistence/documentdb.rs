//! Document database: one set of stores behind a feed view, a serial
//! allocator and an optional operation log. [`DocumentDbProvider`] exposes a
//! document database per partition through [`PersistenceProvider`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::provider::{
    Bucket, BucketEntry, FieldSet, IterateResult, IteratorId, IteratorSpec, MutationResult,
    PartitionId, PersistenceProvider, SplitResult,
};
use crate::condition::Selection;
use crate::config::StorageConfig;
use crate::error::{FeedError, Result};
use crate::feed::operation::{
    BucketOperation, CompactLidSpaceOperation, DropTombstoneOperation, FeedOperation,
    JoinBucketsOperation, MoveOperation, PruneRemovedOperation, PutOperation, RemoveOperation,
    SplitBucketOperation, UpdateOperation,
};
use crate::feed::{CommitTimeTracker, CompletionContext, FeedStores, FeedToken, FeedView, OpLog};
use crate::feed::{PersistentParams, SubDbType};
use crate::fields::SerializeOptions;
use crate::metrics::MetricsRegistry;
use crate::store::meta::MetaEntry;
use crate::store::schema::DocSchema;
use crate::store::{
    AttributeStore, AttributeWriter, DocumentMetaStore, DocumentStore, IndexWriter, MemoryIndex,
    SummaryAdapter,
};
use crate::types::{
    BucketId, BucketInfo, Document, DocumentId, DocumentUpdate, Lid, SerialNum, Timestamp,
};

/// Highest serial each store has durably applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushedSerials {
    pub meta: SerialNum,
    pub document: SerialNum,
    pub index: SerialNum,
    pub attribute: SerialNum,
}

const FLUSHED_FILE: &str = "flushed.json";

impl FlushedSerials {
    pub fn max(&self) -> SerialNum {
        self.meta.max(self.document).max(self.index).max(self.attribute)
    }

    /// Watermarks recorded by the last flush in `dir`, if any.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(FLUSHED_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write through a temporary file so a crash never leaves a partial record.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", FLUSHED_FILE));
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, dir.join(FLUSHED_FILE))?;
        Ok(())
    }
}

/// Where [`DocumentDbProvider::open_with`] takes each partition's flushed
/// watermarks from before replaying its log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Watermarks {
    /// Replay every logged operation into every store.
    #[default]
    Zero,
    /// Use what the last flush recorded in the partition directory.
    Recorded,
    /// Use the same watermarks for every partition.
    Fixed(FlushedSerials),
}

/// Applied-write counters per store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreWrites {
    pub meta: u64,
    pub document: u64,
    pub index: u64,
    pub attribute: u64,
}

#[derive(Debug, Clone)]
pub struct DocumentDbConfig {
    pub name: String,
    pub doc_type: String,
    pub sub_db_id: u32,
    pub schema: DocSchema,
    pub flushed: FlushedSerials,
    pub visibility_delay: Duration,
    pub compression_threshold: usize,
}

impl DocumentDbConfig {
    pub fn from_storage(config: &StorageConfig, partition: PartitionId) -> Self {
        DocumentDbConfig {
            name: format!("{}.{}", config.doc_type, partition),
            doc_type: config.doc_type.clone(),
            sub_db_id: 0,
            schema: config.schema.clone(),
            flushed: FlushedSerials::default(),
            visibility_delay: config.visibility_delay(),
            compression_threshold: config.compression_threshold,
        }
    }
}

pub struct DocumentDb {
    name: String,
    view: FeedView,
    summary: Arc<DocumentStore>,
    index: Option<Arc<MemoryIndex>>,
    attributes: Option<Arc<AttributeStore>>,
    serial: AtomicU64,
    feed_lock: Mutex<()>,
    oplog: Option<OpLog>,
    commit_tracker: CommitTimeTracker,
    committed_serial: AtomicU64,
}

impl DocumentDb {
    /// Must be called within a tokio runtime.
    pub fn new(config: DocumentDbConfig, metrics: &MetricsRegistry, oplog: Option<OpLog>) -> Self {
        let flushed = config.flushed;
        let meta = Arc::new(DocumentMetaStore::new(flushed.meta));
        let summary = Arc::new(DocumentStore::new(
            flushed.document,
            SerializeOptions {
                compression_threshold: config.compression_threshold,
                metrics: Some(metrics.serialization.clone()),
            },
        ));
        let index = (!config.schema.indexed.is_empty())
            .then(|| Arc::new(MemoryIndex::new(config.schema.clone(), flushed.index)));
        let attributes = (!config.schema.attributes.is_empty())
            .then(|| Arc::new(AttributeStore::new(config.schema.clone(), flushed.attribute)));

        let stores = FeedStores {
            meta,
            summary: summary.clone() as Arc<dyn SummaryAdapter>,
            index: index.clone().map(|i| i as Arc<dyn IndexWriter>),
            attributes: attributes.clone().map(|a| a as Arc<dyn AttributeWriter>),
        };
        let view = FeedView::new(
            PersistentParams {
                flushed_meta_serial: flushed.meta,
                flushed_doc_serial: flushed.document,
                doc_type: config.doc_type.clone(),
                sub_db_id: config.sub_db_id,
                sub_db_type: SubDbType::Ready,
            },
            config.schema,
            stores,
            metrics.feed.clone(),
            config.visibility_delay,
        );
        let start = flushed
            .max()
            .max(oplog.as_ref().map(|l| l.last_serial()).unwrap_or(0));
        tracing::info!("[DDB {}] opened at serial {}", config.name, start);
        DocumentDb {
            name: config.name,
            view,
            summary,
            index,
            attributes,
            serial: AtomicU64::new(start),
            feed_lock: Mutex::new(()),
            oplog,
            commit_tracker: CommitTimeTracker::new(config.visibility_delay),
            committed_serial: AtomicU64::new(start),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn view(&self) -> &FeedView {
        &self.view
    }

    pub fn meta(&self) -> &Arc<DocumentMetaStore> {
        self.view.meta()
    }

    pub fn index(&self) -> Option<&Arc<MemoryIndex>> {
        self.index.as_ref()
    }

    pub fn current_serial(&self) -> SerialNum {
        self.serial.load(Ordering::Acquire)
    }

    // ── feeding ─────────────────────────────────────────────────────────

    /// Assign the next serial, prepare, log and apply one operation.
    /// Returns the operation as prepared (lids and previous state filled in).
    pub async fn feed(&self, op: FeedOperation) -> Result<FeedOperation> {
        let (token, op) = {
            let _guard = self.feed_lock.lock().await;
            let mut op = op;
            op.set_serial(self.current_serial() + 1);
            self.view.prepare(&mut op)?;
            self.serial.store(op.serial(), Ordering::Release);
            if let Some(oplog) = &self.oplog {
                oplog.append(&op)?;
            }
            let token = self.apply(&op).await;
            (token, op)
        };
        token.wait().await?;
        if self.commit_tracker.needs_commit() {
            self.commit().await?;
        }
        Ok(op)
    }

    async fn apply(&self, op: &FeedOperation) -> FeedToken {
        let (ctx, token) = CompletionContext::new(format!("{} {}#{}", self.name, op.kind(), op.serial()));
        if let Err(e) = self.view.handle(&ctx, op).await {
            ctx.fail(e);
        }
        ctx.seal();
        token
    }

    /// Re-apply logged operations with their recorded serials. Stores whose
    /// flushed serial covers an operation are skipped by the view. Returns the
    /// number of operations that applied cleanly.
    pub async fn replay<I>(&self, ops: I) -> Result<usize>
    where
        I: IntoIterator<Item = FeedOperation>,
    {
        let _guard = self.feed_lock.lock().await;
        let mut applied = 0;
        for mut op in ops {
            let serial = op.serial();
            self.serial.fetch_max(serial, Ordering::AcqRel);
            if let Err(e) = self.view.prepare(&mut op) {
                tracing::warn!("[DDB {}] replay of serial {} skipped: {}", self.name, serial, e);
                continue;
            }
            match self.apply(&op).await.wait().await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!("[DDB {}] replay of serial {} failed: {}", self.name, serial, e);
                }
            }
        }
        self.commit().await?;
        tracing::info!(
            "[DDB {}] replayed {} operations up to serial {}",
            self.name,
            applied,
            self.current_serial()
        );
        Ok(applied)
    }

    pub async fn commit(&self) -> Result<()> {
        let serial = self.current_serial();
        self.view
            .force_commit(serial, || self.commit_tracker.commit_done())
            .await?;
        self.committed_serial.fetch_max(serial, Ordering::AcqRel);
        Ok(())
    }

    /// Whether operations have been fed since the last commit.
    pub fn has_uncommitted(&self) -> bool {
        self.current_serial() > self.committed_serial.load(Ordering::Acquire)
    }

    /// Background task committing once the visibility delay has passed, so an
    /// idle feed still becomes visible. `None` without a visibility delay.
    /// The task stops once the database is dropped.
    pub fn spawn_commit_timer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.commit_tracker.has_visibility_delay() {
            return None;
        }
        let weak: Weak<DocumentDb> = Arc::downgrade(self);
        let name = self.name.clone();
        Some(tokio::spawn(async move {
            loop {
                let due = match weak.upgrade() {
                    Some(db) => db.commit_tracker.due_at(),
                    None => break,
                };
                tokio::time::sleep_until(due).await;
                let Some(db) = weak.upgrade() else {
                    break;
                };
                if !db.commit_tracker.needs_commit() {
                    continue;
                }
                if db.has_uncommitted() {
                    if let Err(e) = db.commit().await {
                        tracing::warn!("[DDB {}] timed commit failed: {}", db.name, e);
                    }
                } else {
                    db.commit_tracker.commit_done();
                }
            }
            tracing::debug!("[DDB {}] commit timer stopped", name);
        }))
    }

    pub async fn sync(&self) {
        self.view.sync().await;
    }

    pub fn heart_beat(&self) {
        self.view.heart_beat(self.current_serial());
    }

    // ── typed wrappers ──────────────────────────────────────────────────

    pub async fn put(
        &self,
        bucket: BucketId,
        timestamp: Timestamp,
        document: Document,
    ) -> Result<PutOperation> {
        let op = self
            .feed(FeedOperation::Put(PutOperation {
                serial: 0,
                bucket,
                timestamp,
                document,
                lid: 0,
                prev_lid: 0,
                prev_timestamp: 0,
            }))
            .await?;
        match op {
            FeedOperation::Put(op) => Ok(op),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn update(
        &self,
        bucket: BucketId,
        timestamp: Timestamp,
        update: DocumentUpdate,
    ) -> Result<UpdateOperation> {
        let op = self
            .feed(FeedOperation::Update(UpdateOperation {
                serial: 0,
                bucket,
                timestamp,
                update,
                lid: 0,
                prev_timestamp: 0,
                created: false,
            }))
            .await?;
        match op {
            FeedOperation::Update(op) => Ok(op),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn remove(
        &self,
        bucket: BucketId,
        timestamp: Timestamp,
        doc_id: DocumentId,
    ) -> Result<RemoveOperation> {
        let op = self
            .feed(FeedOperation::Remove(RemoveOperation {
                serial: 0,
                bucket,
                timestamp,
                doc_id,
                lid: 0,
                prev_timestamp: 0,
            }))
            .await?;
        match op {
            FeedOperation::Remove(op) => Ok(op),
            other => Err(unexpected(&other)),
        }
    }

    /// Move a document to `target_bucket`, and to `target_lid` unless it is 0.
    pub async fn move_document(
        &self,
        doc_id: DocumentId,
        target_bucket: BucketId,
        target_lid: Lid,
    ) -> Result<MoveOperation> {
        let op = self
            .feed(FeedOperation::Move(MoveOperation {
                serial: 0,
                doc_id,
                source_bucket: target_bucket,
                target_bucket,
                source_lid: 0,
                target_lid,
            }))
            .await?;
        match op {
            FeedOperation::Move(op) => Ok(op),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn create_bucket(&self, bucket: BucketId) -> Result<()> {
        self.feed(FeedOperation::CreateBucket(BucketOperation { serial: 0, bucket }))
            .await
            .map(drop)
    }

    pub async fn delete_bucket(&self, bucket: BucketId) -> Result<()> {
        self.feed(FeedOperation::DeleteBucket(BucketOperation { serial: 0, bucket }))
            .await
            .map(drop)
    }

    pub async fn split_bucket(
        &self,
        source: BucketId,
        target1: BucketId,
        target2: BucketId,
    ) -> Result<()> {
        self.feed(FeedOperation::SplitBucket(SplitBucketOperation {
            serial: 0,
            source,
            target1,
            target2,
        }))
        .await
        .map(drop)
    }

    pub async fn join_buckets(&self, sources: Vec<BucketId>, target: BucketId) -> Result<()> {
        self.feed(FeedOperation::JoinBuckets(JoinBucketsOperation {
            serial: 0,
            sources,
            target,
        }))
        .await
        .map(drop)
    }

    pub async fn prune_removed(&self, older_than: Timestamp, bucket: Option<BucketId>) -> Result<()> {
        self.feed(FeedOperation::PruneRemoved(PruneRemovedOperation {
            serial: 0,
            older_than,
            bucket,
        }))
        .await
        .map(drop)
    }

    pub async fn drop_tombstone(
        &self,
        bucket: BucketId,
        doc_id: DocumentId,
        timestamp: Timestamp,
    ) -> Result<()> {
        self.feed(FeedOperation::DropTombstone(DropTombstoneOperation {
            serial: 0,
            bucket,
            doc_id,
            timestamp,
        }))
        .await
        .map(drop)
    }

    /// Move the highest live documents into the lowest free lids, then
    /// shrink the lid space. Returns the new lid limit.
    pub async fn compact_lid_space(&self) -> Result<Lid> {
        let mut moved = 0;
        loop {
            let meta = self.meta();
            let (Some(high), Some(free)) = (meta.highest_live_lid(), meta.lowest_free_lid()) else {
                break;
            };
            if free >= high {
                break;
            }
            let Some(entry) = meta.get(high) else {
                break;
            };
            self.move_document(entry.doc_id, entry.bucket, free).await?;
            moved += 1;
        }
        self.commit().await?;
        let lid_limit = self.meta().highest_live_lid().map(|l| l + 1).unwrap_or(1);
        self.feed(FeedOperation::CompactLidSpace(CompactLidSpaceOperation {
            serial: 0,
            lid_limit,
        }))
        .await?;
        tracing::info!(
            "[DDB {}] compacted lid space to {} after {} moves",
            self.name,
            lid_limit,
            moved
        );
        Ok(lid_limit)
    }

    // ── reads and bucket state ──────────────────────────────────────────

    pub fn get(&self, id: &DocumentId) -> Result<Option<(MetaEntry, Document)>> {
        self.view.get_by_id(id)
    }

    pub fn bucket_info(&self, bucket: &BucketId) -> BucketInfo {
        self.meta().bucket_info(bucket)
    }

    pub fn bucket_exists(&self, bucket: &BucketId) -> bool {
        self.meta().bucket_exists(bucket)
    }

    pub fn list_buckets(&self) -> Vec<BucketId> {
        self.meta().list_buckets()
    }

    pub fn set_active(&self, bucket: BucketId, active: bool) {
        self.meta().set_active(bucket, active);
    }

    pub fn repair_bucket(&self, bucket: &BucketId) -> bool {
        let altered = self.meta().repair_bucket(bucket);
        if altered {
            tracing::warn!("[DDB {}] repaired bucket info of {}", self.name, bucket);
        }
        altered
    }

    /// Entries of a bucket in lid order, tombstones last when requested.
    pub fn entries(&self, bucket: &BucketId, include_removes: bool) -> Result<Vec<BucketEntry>> {
        let meta = self.meta();
        let mut out = Vec::new();
        for (lid, entry) in meta.entries_in(bucket) {
            out.push(BucketEntry {
                doc_id: entry.doc_id,
                timestamp: entry.timestamp,
                removed: false,
                size: entry.size,
                document: self.view.get_document(lid)?,
            });
        }
        if include_removes {
            for stone in meta.tombstones_in(bucket) {
                out.push(BucketEntry {
                    size: stone.doc_id.as_str().len() as u64,
                    doc_id: stone.doc_id,
                    timestamp: stone.timestamp,
                    removed: true,
                    document: None,
                });
            }
        }
        Ok(out)
    }

    pub fn store_writes(&self) -> StoreWrites {
        StoreWrites {
            meta: self.meta().write_count(),
            document: self.summary.write_count(),
            index: self.index.as_ref().map(|i| i.write_count()).unwrap_or(0),
            attribute: self.attributes.as_ref().map(|a| a.write_count()).unwrap_or(0),
        }
    }

    /// Mark everything applied so far as durable. Returns the new watermarks.
    pub async fn flush_all(&self) -> Result<FlushedSerials> {
        self.commit().await?;
        let flushed = FlushedSerials {
            meta: self.meta().flush(),
            document: self.summary.flush(),
            index: self.index.as_ref().map(|i| i.flush()).unwrap_or(0),
            attribute: self.attributes.as_ref().map(|a| a.flush()).unwrap_or(0),
        };
        if let Some(dir) = self.oplog.as_ref().and_then(|l| l.path().parent()) {
            flushed.save(dir)?;
        }
        tracing::info!("[DDB {}] flushed {:?}", self.name, flushed);
        Ok(flushed)
    }
}

pub fn partition_dir(data_dir: &Path, partition: PartitionId) -> PathBuf {
    data_dir.join(format!("partition-{}", partition))
}

fn unexpected(op: &FeedOperation) -> FeedError {
    FeedError::BackendFailure(format!("feed returned unexpected {} operation", op.kind()))
}

/// One document database per partition.
pub struct DocumentDbProvider {
    partitions: Vec<Arc<DocumentDb>>,
    iterators: DashMap<IteratorId, VecDeque<BucketEntry>>,
    next_iterator: AtomicU64,
    commit_timers: Vec<JoinHandle<()>>,
}

impl DocumentDbProvider {
    /// In-memory partitions without operation logs. Must be called within a tokio runtime.
    pub fn new(config: &StorageConfig, metrics: &MetricsRegistry) -> Self {
        let partitions = (0..config.shards)
            .map(|p| {
                Arc::new(DocumentDb::new(
                    DocumentDbConfig::from_storage(config, p as PartitionId),
                    metrics,
                    None,
                ))
            })
            .collect();
        Self::from_partitions(partitions)
    }

    /// Partitions logging under `data_dir/partition-N`, each recovered by
    /// replaying its whole log.
    pub async fn open(
        config: &StorageConfig,
        metrics: &MetricsRegistry,
        data_dir: &Path,
    ) -> Result<Self> {
        Self::open_with(config, metrics, data_dir, Watermarks::Zero).await
    }

    /// Like [`DocumentDbProvider::open`], but stores whose watermark covers a
    /// logged operation skip it during replay.
    pub async fn open_with(
        config: &StorageConfig,
        metrics: &MetricsRegistry,
        data_dir: &Path,
        watermarks: Watermarks,
    ) -> Result<Self> {
        let mut partitions = Vec::with_capacity(config.shards);
        for p in 0..config.shards {
            let dir = partition_dir(data_dir, p as PartitionId);
            let oplog = OpLog::open(&dir, &config.node_id)?;
            let ops = oplog.read_from(0)?;
            let mut db_config = DocumentDbConfig::from_storage(config, p as PartitionId);
            db_config.flushed = match watermarks {
                Watermarks::Zero => FlushedSerials::default(),
                Watermarks::Recorded => FlushedSerials::load(&dir)?.unwrap_or_default(),
                Watermarks::Fixed(flushed) => flushed,
            };
            tracing::info!(
                "[DDB {}] replaying {} logged operations over {:?}",
                db_config.name,
                ops.len(),
                db_config.flushed
            );
            let db = DocumentDb::new(db_config, metrics, Some(oplog));
            db.replay(ops).await?;
            partitions.push(Arc::new(db));
        }
        Ok(Self::from_partitions(partitions))
    }

    /// Must be called within a tokio runtime.
    pub fn from_partitions(partitions: Vec<Arc<DocumentDb>>) -> Self {
        let commit_timers = partitions
            .iter()
            .filter_map(|db| db.spawn_commit_timer())
            .collect();
        DocumentDbProvider {
            partitions,
            iterators: DashMap::new(),
            next_iterator: AtomicU64::new(1),
            commit_timers,
        }
    }

    pub fn live_iterators(&self) -> usize {
        self.iterators.len()
    }

    pub fn partition(&self, partition: PartitionId) -> Result<&Arc<DocumentDb>> {
        self.partitions.get(partition as usize).ok_or_else(|| {
            FeedError::InvalidRequest(format!(
                "partition {} out of range (have {})",
                partition,
                self.partitions.len()
            ))
        })
    }

    fn same_partition(&self, buckets: &[&Bucket]) -> Result<&Arc<DocumentDb>> {
        let first = buckets
            .first()
            .ok_or_else(|| FeedError::InvalidRequest("no buckets given".to_string()))?;
        if let Some(other) = buckets.iter().find(|b| b.partition != first.partition) {
            return Err(FeedError::InvalidRequest(format!(
                "{} and {} are on different partitions",
                first, other
            )));
        }
        self.partition(first.partition)
    }
}

impl Drop for DocumentDbProvider {
    fn drop(&mut self) {
        for timer in &self.commit_timers {
            timer.abort();
        }
    }
}

#[async_trait]
impl PersistenceProvider for DocumentDbProvider {
    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    async fn list_buckets(&self, partition: PartitionId) -> Result<Vec<BucketId>> {
        Ok(self.partition(partition)?.list_buckets())
    }

    async fn get_bucket_info(&self, bucket: &Bucket) -> Result<BucketInfo> {
        Ok(self.partition(bucket.partition)?.bucket_info(&bucket.id))
    }

    async fn create_bucket(&self, bucket: &Bucket) -> Result<BucketInfo> {
        let db = self.partition(bucket.partition)?;
        db.create_bucket(bucket.id).await?;
        Ok(db.bucket_info(&bucket.id))
    }

    async fn delete_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.partition(bucket.partition)?
            .delete_bucket(bucket.id)
            .await
    }

    async fn set_active_state(&self, bucket: &Bucket, active: bool) -> Result<BucketInfo> {
        let db = self.partition(bucket.partition)?;
        db.set_active(bucket.id, active);
        Ok(db.bucket_info(&bucket.id))
    }

    async fn put(&self, bucket: &Bucket, timestamp: Timestamp, doc: Document) -> Result<BucketInfo> {
        let db = self.partition(bucket.partition)?;
        db.put(bucket.id, timestamp, doc).await?;
        Ok(db.bucket_info(&bucket.id))
    }

    async fn remove(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        id: &DocumentId,
    ) -> Result<MutationResult> {
        let db = self.partition(bucket.partition)?;
        let op = db.remove(bucket.id, timestamp, id.clone()).await?;
        Ok(MutationResult {
            info: db.bucket_info(&bucket.id),
            found: op.lid != 0,
            existing_timestamp: op.prev_timestamp,
        })
    }

    async fn update(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        update: DocumentUpdate,
    ) -> Result<MutationResult> {
        let db = self.partition(bucket.partition)?;
        match db.update(bucket.id, timestamp, update).await {
            Ok(op) => Ok(MutationResult {
                info: db.bucket_info(&bucket.id),
                found: !op.created,
                existing_timestamp: op.prev_timestamp,
            }),
            Err(FeedError::NotFound(_)) => Ok(MutationResult {
                info: db.bucket_info(&bucket.id),
                found: false,
                existing_timestamp: 0,
            }),
            Err(e) => Err(e),
        }
    }

    async fn get(
        &self,
        bucket: &Bucket,
        field_set: &FieldSet,
        id: &DocumentId,
    ) -> Result<Option<(Timestamp, Document)>> {
        let db = self.partition(bucket.partition)?;
        Ok(db
            .get(id)?
            .filter(|(entry, _)| entry.bucket == bucket.id)
            .map(|(entry, doc)| (entry.timestamp, field_set.project(doc))))
    }

    async fn entries(&self, bucket: &Bucket, include_removes: bool) -> Result<Vec<BucketEntry>> {
        self.partition(bucket.partition)?
            .entries(&bucket.id, include_removes)
    }

    async fn create_iterator(&self, bucket: &Bucket, spec: IteratorSpec) -> Result<IteratorId> {
        let selection = spec.selection.as_deref().map(Selection::parse).transpose()?;
        let entries = self
            .partition(bucket.partition)?
            .entries(&bucket.id, spec.include_removes)?;
        let snapshot: VecDeque<BucketEntry> = entries
            .into_iter()
            .filter(|e| match (&selection, &e.document) {
                (Some(sel), Some(doc)) => sel.matches(doc),
                _ => true,
            })
            .map(|mut e| {
                e.document = e.document.map(|d| spec.field_set.project(d));
                e
            })
            .collect();
        let id = self.next_iterator.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            "[ITER {}] created over {} with {} entries",
            id,
            bucket,
            snapshot.len()
        );
        self.iterators.insert(id, snapshot);
        Ok(id)
    }

    async fn iterate(&self, iterator: IteratorId, max_bytes: usize) -> Result<IterateResult> {
        let mut queue = self
            .iterators
            .get_mut(&iterator)
            .ok_or_else(|| FeedError::NotFound(format!("iterator {}", iterator)))?;
        let mut entries = Vec::new();
        let mut used = 0usize;
        while let Some(front) = queue.front() {
            let size = front.size as usize;
            if !entries.is_empty() && used + size > max_bytes {
                break;
            }
            used += size;
            if let Some(entry) = queue.pop_front() {
                entries.push(entry);
            }
        }
        let completed = queue.is_empty();
        drop(queue);
        if completed && self.iterators.remove(&iterator).is_some() {
            tracing::debug!("[ITER {}] completed, snapshot released", iterator);
        }
        Ok(IterateResult { entries, completed })
    }

    async fn destroy_iterator(&self, iterator: IteratorId) -> Result<()> {
        if self.iterators.remove(&iterator).is_some() {
            tracing::debug!("[ITER {}] destroyed", iterator);
        }
        Ok(())
    }

    async fn split(
        &self,
        source: &Bucket,
        target1: &Bucket,
        target2: &Bucket,
    ) -> Result<SplitResult> {
        let db = self.same_partition(&[source, target1, target2])?;
        db.split_bucket(source.id, target1.id, target2.id).await?;
        Ok(SplitResult {
            target1: db.bucket_info(&target1.id),
            target2: db.bucket_info(&target2.id),
        })
    }

    async fn join(&self, source1: &Bucket, source2: &Bucket, target: &Bucket) -> Result<BucketInfo> {
        let db = self.same_partition(&[source1, source2, target])?;
        let mut sources = vec![source1.id];
        if source2.id != source1.id {
            sources.push(source2.id);
        }
        db.join_buckets(sources, target.id).await?;
        Ok(db.bucket_info(&target.id))
    }

    async fn revert(&self, bucket: &Bucket, timestamps: &[Timestamp]) -> Result<BucketInfo> {
        let db = self.partition(bucket.partition)?;
        for entry in db.entries(&bucket.id, true)? {
            if !timestamps.contains(&entry.timestamp) {
                continue;
            }
            tracing::debug!(
                "[DDB {}] reverting {} {} at {}",
                db.name(),
                if entry.removed { "remove of" } else { "put of" },
                entry.doc_id,
                entry.timestamp
            );
            if !entry.removed {
                db.remove(bucket.id, entry.timestamp, entry.doc_id.clone())
                    .await?;
            }
            db.drop_tombstone(bucket.id, entry.doc_id, entry.timestamp)
                .await?;
        }
        Ok(db.bucket_info(&bucket.id))
    }

    async fn maintain(&self, bucket: &Bucket) -> Result<bool> {
        Ok(self.partition(bucket.partition)?.repair_bucket(&bucket.id))
    }
}
