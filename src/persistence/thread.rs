//! Persistence shards. Each shard runs one task that takes locked messages
//! off its [`FileStorHandler`] and applies them to the provider.
//!
//! Mutating commands follow one protocol: evaluate the test-and-set
//! condition, check the bucket index against the backend, run the backend
//! operation, compare the info it reported with a fresh read, and only then
//! update the bucket index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::bucket_db::BucketDatabase;
use super::filestor::FileStorHandler;
use super::merge::{MergeHandler, MergePeer, MergeTracker};
use super::message::{Command, LockedMessage, MultiOp, Reply, ReplyPayload};
use super::process_all::ProcessAllHandler;
use super::provider::{
    Bucket, FieldSet, IteratorId, IteratorSpec, PartitionId, PersistenceProvider,
};
use super::tracker::MessageTracker;
use crate::condition::Selection;
use crate::config::StorageConfig;
use crate::error::{FeedError, Result, ResultCode};
use crate::metrics::{MetricsRegistry, PersistenceMetrics};
use crate::types::{
    BucketId, BucketInfo, Document, DocumentId, DocumentUpdate, Timestamp, MAX_USED_BITS,
};

pub struct PersistenceThread {
    shard: usize,
    provider: Arc<dyn PersistenceProvider>,
    bucket_db: Arc<BucketDatabase>,
    merge_handler: MergeHandler,
    process_all: ProcessAllHandler,
    metrics: PersistenceMetrics,
    slow_threshold: Duration,
    iterator_max_bytes: usize,
}

impl PersistenceThread {
    pub fn new(
        shard: usize,
        provider: Arc<dyn PersistenceProvider>,
        bucket_db: Arc<BucketDatabase>,
        metrics: PersistenceMetrics,
        config: &StorageConfig,
    ) -> Self {
        PersistenceThread {
            shard,
            merge_handler: MergeHandler::new(Arc::clone(&provider)),
            process_all: ProcessAllHandler::new(Arc::clone(&provider)),
            provider,
            bucket_db,
            metrics,
            slow_threshold: config.slow_operation_threshold(),
            iterator_max_bytes: config.iterator_max_bytes,
        }
    }

    pub fn spawn(self, handler: Arc<FileStorHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("[PT {}] started", self.shard);
            while let Some(msg) = handler.next().await {
                self.process(msg).await;
            }
            tracing::info!("[PT {}] stopped", self.shard);
        })
    }

    pub async fn process(&self, msg: LockedMessage) {
        let (command, tracker) = MessageTracker::start(msg);
        let bucket = command.bucket();
        let result = self.handle(command).await;
        let elapsed = tracker.elapsed();
        let name = tracker.command();

        let code = match &result {
            Ok(_) => ResultCode::Ok,
            Err(e) => {
                if e.is_consistency_violation() {
                    tracing::error!("[PT {}] {} failed: {}", self.shard, name, e);
                } else {
                    tracing::debug!("[PT {}] {} failed: {}", self.shard, name, e);
                }
                e.result_code()
            }
        };
        let failure = (!code.is_success()).then(|| format!("{:?}", code));
        self.metrics
            .record(self.shard, name, elapsed.as_secs_f64(), failure.as_deref());
        if elapsed > self.slow_threshold {
            self.metrics.record_slow(self.shard, name);
            tracing::warn!(
                "[PT {}] slow {} on {:?}: {}ms (queued {}ms)",
                self.shard,
                name,
                bucket.map(|b| b.id),
                elapsed.as_millis(),
                tracker.queue_time().as_millis()
            );
        }
        tracker.finish(result);
    }

    /// Run one command to completion without the queue.
    pub async fn handle(&self, command: Command) -> Result<ReplyPayload> {
        match command {
            Command::Put {
                bucket,
                timestamp,
                document,
                condition,
            } => self.handle_put(&bucket, timestamp, document, condition.as_deref()).await,
            Command::Remove {
                bucket,
                timestamp,
                doc_id,
                condition,
            } => self.handle_remove(&bucket, timestamp, &doc_id, condition.as_deref()).await,
            Command::Update {
                bucket,
                timestamp,
                update,
                condition,
            } => self.handle_update(&bucket, timestamp, update, condition.as_deref()).await,
            Command::Get {
                bucket,
                doc_id,
                field_set,
            } => self.handle_get(&bucket, &doc_id, &field_set).await,
            Command::MultiOperation { bucket, operations } => {
                self.handle_multi_operation(&bucket, operations).await
            }
            Command::Revert { bucket, timestamps } => self.handle_revert(&bucket, &timestamps).await,
            Command::CreateBucket { bucket } => self.handle_create_bucket(&bucket).await,
            Command::DeleteBucket { bucket, expected } => {
                self.handle_delete_bucket(&bucket, expected).await
            }
            Command::CreateIterator { bucket, spec } => {
                self.handle_create_iterator(&bucket, spec).await
            }
            Command::GetIter {
                iterator, max_bytes, ..
            } => self.handle_get_iter(iterator, max_bytes).await,
            Command::DestroyIterator { iterator, .. } => {
                self.provider.destroy_iterator(iterator).await?;
                Ok(ReplyPayload::None)
            }
            Command::ReadBucketList { partition } => Ok(ReplyPayload::BucketList(
                self.provider.list_buckets(partition).await?,
            )),
            Command::ReadBucketInfo { bucket } => Ok(ReplyPayload::BucketInfo(
                self.provider.get_bucket_info(&bucket).await?,
            )),
            Command::JoinBuckets { sources, target } => {
                self.handle_join_buckets(&sources, &target).await
            }
            Command::SetBucketState { bucket, active } => {
                self.handle_set_bucket_state(&bucket, active).await
            }
            Command::InternalBucketJoin {
                bucket,
                source_partition,
            } => self.handle_internal_join(&bucket, source_partition).await,
            Command::SplitBucket { bucket } => self.handle_split_bucket(&bucket).await,
            Command::RepairBucket { bucket } => self.handle_repair_bucket(&bucket).await,
            Command::RecheckBucketInfo { bucket } => self.handle_recheck(&bucket).await,
            Command::MergeBucket { bucket, peers } => self.handle_merge(&bucket, &peers).await,
            Command::RemoveLocation {
                bucket,
                timestamp,
                selection,
            } => self.handle_remove_location(&bucket, timestamp, &selection).await,
            Command::StatBucket { bucket, selection } => {
                let entries = self
                    .process_all
                    .stat_bucket(&bucket, selection.as_deref())
                    .await?;
                Ok(ReplyPayload::Entries {
                    entries,
                    completed: true,
                })
            }
        }
    }

    // ── protocol steps ──────────────────────────────────────────────────

    async fn check_condition(
        &self,
        bucket: &Bucket,
        doc_id: &DocumentId,
        condition: Option<&str>,
    ) -> Result<()> {
        let Some(condition) = condition else {
            return Ok(());
        };
        let selection = Selection::parse(condition)?;
        match self.provider.get(bucket, &FieldSet::All, doc_id).await? {
            None => Err(FeedError::PreconditionFailed(format!(
                "{} does not exist",
                doc_id
            ))),
            Some((_, doc)) if selection.matches(&doc) => Ok(()),
            Some(_) => Err(FeedError::PreconditionFailed(format!(
                "{} does not match '{}'",
                doc_id, condition
            ))),
        }
    }

    fn violation(&self, bucket: &Bucket, backend: BucketInfo, index: BucketInfo) -> FeedError {
        tracing::error!(
            "[PT {}] bucket info mismatch for {}: backend {} index {}",
            self.shard,
            bucket,
            backend,
            index
        );
        FeedError::ConsistencyViolation {
            bucket: bucket.to_string(),
            backend: backend.to_string(),
            index: index.to_string(),
        }
    }

    /// The index entry, when present, must equal the backend's info.
    async fn verify_index(&self, bucket: &Bucket) -> Result<()> {
        let Some(indexed) = self.bucket_db.info(&bucket.id) else {
            return Ok(());
        };
        let backend = self.provider.get_bucket_info(bucket).await?;
        if indexed != backend {
            return Err(self.violation(bucket, backend, indexed));
        }
        Ok(())
    }

    /// Compare reported info with a fresh read; on match record it in the index.
    async fn confirm(&self, bucket: &Bucket, reported: BucketInfo) -> Result<BucketInfo> {
        let fresh = self.provider.get_bucket_info(bucket).await?;
        if fresh != reported {
            return Err(self.violation(bucket, fresh, reported));
        }
        self.bucket_db.update(bucket, reported);
        Ok(reported)
    }

    async fn resync(&self, bucket: &Bucket) {
        match self.provider.get_bucket_info(bucket).await {
            Ok(info) => {
                tracing::warn!("[PT {}] resynced {} to {}", self.shard, bucket, info);
                self.bucket_db.update(bucket, info);
            }
            Err(e) => {
                tracing::warn!("[PT {}] could not resync {}: {}", self.shard, bucket, e);
            }
        }
    }

    // ── document commands ───────────────────────────────────────────────

    async fn handle_put(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        document: Document,
        condition: Option<&str>,
    ) -> Result<ReplyPayload> {
        self.check_condition(bucket, &document.id, condition).await?;
        self.verify_index(bucket).await?;
        let info = self.provider.put(bucket, timestamp, document).await?;
        Ok(ReplyPayload::BucketInfo(self.confirm(bucket, info).await?))
    }

    async fn handle_remove(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        doc_id: &DocumentId,
        condition: Option<&str>,
    ) -> Result<ReplyPayload> {
        self.check_condition(bucket, doc_id, condition).await?;
        self.verify_index(bucket).await?;
        let result = self.provider.remove(bucket, timestamp, doc_id).await?;
        let info = self.confirm(bucket, result.info).await?;
        Ok(ReplyPayload::Mutation {
            info,
            found: result.found,
            existing_timestamp: result.existing_timestamp,
        })
    }

    async fn handle_update(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        update: DocumentUpdate,
        condition: Option<&str>,
    ) -> Result<ReplyPayload> {
        self.check_condition(bucket, &update.id, condition).await?;
        self.verify_index(bucket).await?;
        let result = self.provider.update(bucket, timestamp, update).await?;
        let info = self.confirm(bucket, result.info).await?;
        Ok(ReplyPayload::Mutation {
            info,
            found: result.found,
            existing_timestamp: result.existing_timestamp,
        })
    }

    async fn handle_get(
        &self,
        bucket: &Bucket,
        doc_id: &DocumentId,
        field_set: &FieldSet,
    ) -> Result<ReplyPayload> {
        Ok(match self.provider.get(bucket, field_set, doc_id).await? {
            Some((timestamp, doc)) => ReplyPayload::Get {
                document: Some(doc),
                timestamp,
            },
            None => ReplyPayload::Get {
                document: None,
                timestamp: 0,
            },
        })
    }

    async fn handle_multi_operation(
        &self,
        bucket: &Bucket,
        operations: Vec<MultiOp>,
    ) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        let mut info = self.provider.get_bucket_info(bucket).await?;
        for (i, op) in operations.into_iter().enumerate() {
            let applied = match op {
                MultiOp::Put {
                    timestamp,
                    document,
                } => self.provider.put(bucket, timestamp, document).await,
                MultiOp::Remove { timestamp, doc_id } => self
                    .provider
                    .remove(bucket, timestamp, &doc_id)
                    .await
                    .map(|r| r.info),
            };
            match applied {
                Ok(next) => info = next,
                Err(e) => {
                    tracing::warn!(
                        "[PT {}] multi-operation on {} failed at step {}: {}",
                        self.shard,
                        bucket,
                        i,
                        e
                    );
                    if i > 0 {
                        self.resync(bucket).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(ReplyPayload::BucketInfo(self.confirm(bucket, info).await?))
    }

    async fn handle_revert(&self, bucket: &Bucket, timestamps: &[Timestamp]) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        let info = self.provider.revert(bucket, timestamps).await?;
        Ok(ReplyPayload::BucketInfo(self.confirm(bucket, info).await?))
    }

    // ── iteration ───────────────────────────────────────────────────────

    async fn handle_create_iterator(
        &self,
        bucket: &Bucket,
        spec: IteratorSpec,
    ) -> Result<ReplyPayload> {
        Ok(ReplyPayload::Iterator(
            self.provider.create_iterator(bucket, spec).await?,
        ))
    }

    async fn handle_get_iter(&self, iterator: IteratorId, max_bytes: usize) -> Result<ReplyPayload> {
        let budget = if max_bytes == 0 {
            self.iterator_max_bytes
        } else {
            max_bytes.min(self.iterator_max_bytes)
        };
        let result = self.provider.iterate(iterator, budget).await?;
        Ok(ReplyPayload::Entries {
            entries: result.entries,
            completed: result.completed,
        })
    }

    // ── bucket lifecycle ────────────────────────────────────────────────

    async fn handle_create_bucket(&self, bucket: &Bucket) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        let info = self.provider.create_bucket(bucket).await?;
        Ok(ReplyPayload::BucketInfo(self.confirm(bucket, info).await?))
    }

    async fn handle_delete_bucket(
        &self,
        bucket: &Bucket,
        expected: Option<BucketInfo>,
    ) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        if let Some(expected) = expected {
            let backend = self.provider.get_bucket_info(bucket).await?;
            if backend != expected {
                return Err(FeedError::Rejected(format!(
                    "{} changed: expected {}, found {}",
                    bucket, expected, backend
                )));
            }
        }
        self.provider.delete_bucket(bucket).await?;
        self.bucket_db.remove(&bucket.id);
        tracing::info!("[PT {}] deleted {}", self.shard, bucket);
        Ok(ReplyPayload::None)
    }

    async fn handle_set_bucket_state(&self, bucket: &Bucket, active: bool) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        let info = self.provider.set_active_state(bucket, active).await?;
        Ok(ReplyPayload::BucketInfo(self.confirm(bucket, info).await?))
    }

    async fn handle_join_buckets(
        &self,
        sources: &[BucketId],
        target: &Bucket,
    ) -> Result<ReplyPayload> {
        validate_join(sources, &target.id)?;
        let source1 = Bucket::new(sources[0], target.partition);
        let source2 = Bucket::new(sources[1], target.partition);
        for bucket in [&source1, &source2, target] {
            self.verify_index(bucket).await?;
        }
        let info = self.provider.join(&source1, &source2, target).await?;
        let info = self.confirm(target, info).await?;
        for source in sources {
            self.bucket_db.remove(source);
        }
        tracing::info!(
            "[PT {}] joined {} and {} into {}",
            self.shard,
            source1.id,
            source2.id,
            target
        );
        Ok(ReplyPayload::BucketInfo(info))
    }

    async fn handle_split_bucket(&self, bucket: &Bucket) -> Result<ReplyPayload> {
        if bucket.id.used_bits() >= MAX_USED_BITS {
            return Err(FeedError::InvalidRequest(format!(
                "{} cannot be split further",
                bucket.id
            )));
        }
        let (id1, id2) = bucket.id.split().ok_or_else(|| {
            FeedError::InvalidRequest(format!("{} cannot be split", bucket.id))
        })?;
        let target1 = Bucket::new(id1, bucket.partition);
        let target2 = Bucket::new(id2, bucket.partition);
        self.verify_index(bucket).await?;
        let result = self.provider.split(bucket, &target1, &target2).await?;
        let info1 = self.confirm(&target1, result.target1).await?;
        let info2 = self.confirm(&target2, result.target2).await?;
        self.bucket_db.remove(&bucket.id);
        tracing::info!(
            "[PT {}] split {} into {} ({} docs) and {} ({} docs)",
            self.shard,
            bucket,
            id1,
            info1.doc_count,
            id2,
            info2.doc_count
        );
        Ok(ReplyPayload::Split {
            target1: (id1, info1),
            target2: (id2, info2),
        })
    }

    /// Pull a bucket's entries from another partition into `bucket.partition`,
    /// newest timestamp winning, then delete the source copy.
    async fn handle_internal_join(
        &self,
        bucket: &Bucket,
        source_partition: PartitionId,
    ) -> Result<ReplyPayload> {
        if source_partition == bucket.partition {
            return Err(FeedError::InvalidRequest(format!(
                "{} is already on partition {}",
                bucket.id, source_partition
            )));
        }
        let source = Bucket::new(bucket.id, source_partition);
        let local: HashMap<DocumentId, Timestamp> = self
            .provider
            .entries(bucket, true)
            .await?
            .into_iter()
            .map(|e| (e.doc_id, e.timestamp))
            .collect();
        let mut info = self.provider.create_bucket(bucket).await?;
        let mut moved = 0usize;
        for entry in self.provider.entries(&source, true).await? {
            if local
                .get(&entry.doc_id)
                .map(|ts| *ts >= entry.timestamp)
                .unwrap_or(false)
            {
                continue;
            }
            info = match (entry.removed, entry.document) {
                (true, _) => {
                    self.provider
                        .remove(bucket, entry.timestamp, &entry.doc_id)
                        .await?
                        .info
                }
                (false, Some(doc)) => self.provider.put(bucket, entry.timestamp, doc).await?,
                (false, None) => continue,
            };
            moved += 1;
        }
        self.provider.delete_bucket(&source).await?;
        let info = self.confirm(bucket, info).await?;
        tracing::info!(
            "[PT {}] moved {} entries of {} from partition {} to {}",
            self.shard,
            moved,
            bucket.id,
            source_partition,
            bucket.partition
        );
        Ok(ReplyPayload::BucketInfo(info))
    }

    async fn handle_repair_bucket(&self, bucket: &Bucket) -> Result<ReplyPayload> {
        let altered = self.provider.maintain(bucket).await?;
        let info = self.provider.get_bucket_info(bucket).await?;
        self.bucket_db.update(bucket, info);
        Ok(ReplyPayload::Repair { info, altered })
    }

    async fn handle_recheck(&self, bucket: &Bucket) -> Result<ReplyPayload> {
        let info = self.provider.get_bucket_info(bucket).await?;
        if let Some(indexed) = self.bucket_db.info(&bucket.id) {
            if indexed != info {
                tracing::warn!(
                    "[PT {}] corrected index for {}: {} -> {}",
                    self.shard,
                    bucket,
                    indexed,
                    info
                );
            }
        }
        self.bucket_db.update(bucket, info);
        Ok(ReplyPayload::BucketInfo(info))
    }

    async fn handle_merge(
        &self,
        bucket: &Bucket,
        peers: &[Arc<dyn MergePeer>],
    ) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        let (info, applied) = self.merge_handler.merge(bucket, peers).await?;
        let info = self.confirm(bucket, info).await?;
        Ok(ReplyPayload::Merge { info, applied })
    }

    async fn handle_remove_location(
        &self,
        bucket: &Bucket,
        timestamp: Timestamp,
        selection: &str,
    ) -> Result<ReplyPayload> {
        self.verify_index(bucket).await?;
        let (info, removed) = self
            .process_all
            .remove_location(bucket, timestamp, selection)
            .await?;
        let info = self.confirm(bucket, info).await?;
        Ok(ReplyPayload::RemoveLocation { info, removed })
    }
}

/// Exactly two sources, neither equal to the target, both contained in it.
pub fn validate_join(sources: &[BucketId], target: &BucketId) -> Result<()> {
    if sources.len() != 2 {
        return Err(FeedError::InvalidRequest(format!(
            "join needs exactly two source buckets, got {}",
            sources.len()
        )));
    }
    for source in sources {
        if source == target {
            return Err(FeedError::InvalidRequest(format!(
                "join source {} equals its target",
                source
            )));
        }
        if !target.contains(source) {
            return Err(FeedError::InvalidRequest(format!(
                "join target {} does not contain {}",
                target, source
            )));
        }
    }
    Ok(())
}

/// The running shards of one node.
pub struct PersistenceShards {
    handlers: Vec<Arc<FileStorHandler>>,
    workers: Vec<JoinHandle<()>>,
    merges: MergeTracker,
    bucket_db: Arc<BucketDatabase>,
    partitions: usize,
}

impl PersistenceShards {
    /// Spawn one worker per configured shard. Must be called within a tokio runtime.
    pub fn start(
        config: &StorageConfig,
        provider: Arc<dyn PersistenceProvider>,
        metrics: &MetricsRegistry,
    ) -> Self {
        let shards = config.shards.max(1);
        let merges = MergeTracker::new();
        let bucket_db = Arc::new(BucketDatabase::new());
        let partitions = provider.partition_count().max(1);
        let mut handlers = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let handler = FileStorHandler::new(shard, merges.clone());
            let thread = PersistenceThread::new(
                shard,
                Arc::clone(&provider),
                Arc::clone(&bucket_db),
                metrics.persistence.clone(),
                config,
            );
            workers.push(thread.spawn(Arc::clone(&handler)));
            handlers.push(handler);
        }
        tracing::info!(
            "[PT] started {} shards over {} partitions",
            shards,
            partitions
        );
        PersistenceShards {
            handlers,
            workers,
            merges,
            bucket_db,
            partitions,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn shard_for(&self, partition: PartitionId) -> usize {
        partition as usize % self.handlers.len()
    }

    /// Where a bucket lives: its indexed partition, or by hash of its low
    /// 16 location bits so split siblings with at least 16 used bits share one.
    pub fn bucket(&self, id: BucketId) -> Bucket {
        let partition = self
            .bucket_db
            .get(&id)
            .map(|e| e.partition)
            .unwrap_or_else(|| ((id.raw() & 0xffff) as usize % self.partitions) as PartitionId);
        Bucket::new(id, partition)
    }

    pub fn bucket_db(&self) -> &Arc<BucketDatabase> {
        &self.bucket_db
    }

    pub fn is_merging(&self, bucket: &BucketId) -> bool {
        self.merges.is_merging(bucket)
    }

    /// Queue a command on its shard and wait for the reply.
    pub async fn submit(&self, command: Command) -> Reply {
        let shard = self.shard_for(command.partition());
        let name = command.name();
        let rx = match self.handlers[shard].schedule(command) {
            Ok(rx) => rx,
            Err(e) => {
                tracing::debug!("[PT {}] {} refused: {}", shard, name, e);
                return Reply::from_error(&e);
            }
        };
        rx.await.unwrap_or_else(|_| {
            Reply::from_error(&FeedError::Aborted(format!(
                "shard {} dropped {}",
                shard, name
            )))
        })
    }

    /// Wait until every shard's queue is drained.
    pub async fn flush(&self) {
        for handler in &self.handlers {
            handler.flush().await;
        }
    }

    /// Stop accepting commands, finish what is queued and stop the workers.
    pub async fn shutdown(self) {
        for handler in &self.handlers {
            handler.close();
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("[PT] worker ended abnormally: {}", e);
            }
        }
        tracing::info!("[PT] all shards stopped");
    }
}
