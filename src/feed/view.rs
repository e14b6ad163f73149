//! The feed view splits a logical operation into writes against the
//! metadata store (inline), the document store, the indexed-field store and
//! the attribute store (each on its own sequenced executor).
//!
//! Replay gating: an operation with serial `S` touches the metadata store
//! only if `S > flushed_meta_serial` and the document store only if
//! `S > flushed_doc_serial`; the index and attribute stores compare against
//! their own flushed serial.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::commit::LidReuseDelayer;
use super::completion::CompletionContext;
use super::executor::{Executor, WriteService};
use super::operation::{
    BucketOperation, CompactLidSpaceOperation, DropTombstoneOperation, FeedOperation,
    JoinBucketsOperation, MoveOperation, PruneRemovedOperation, PutOperation, RemoveOperation,
    SplitBucketOperation, UpdateOperation,
};
use super::pending_lid::{PendingLidToken, PendingLidTracker};
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::store::meta::MetaEntry;
use crate::store::schema::DocSchema;
use crate::store::{AttributeWriter, DocumentMetaStore, IndexWriter, SummaryAdapter};
use crate::types::{BucketId, Document, DocumentId, DocumentUpdate, Lid, SerialNum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubDbType {
    Ready,
    NotReady,
    Removed,
}

impl fmt::Display for SubDbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubDbType::Ready => "ready",
            SubDbType::NotReady => "notready",
            SubDbType::Removed => "removed",
        })
    }
}

/// Durability state of one sub-database, fixed when the view is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentParams {
    pub flushed_meta_serial: SerialNum,
    pub flushed_doc_serial: SerialNum,
    pub doc_type: String,
    pub sub_db_id: u32,
    pub sub_db_type: SubDbType,
}

/// Which stores an update has to touch beyond the attribute store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateScope {
    pub indexed_fields: bool,
    pub non_attribute_fields: bool,
}

impl UpdateScope {
    pub fn classify(schema: &DocSchema, has_attribute_store: bool, update: &DocumentUpdate) -> Self {
        let mut scope = UpdateScope::default();
        for field in update.updates.iter().map(|u| u.field()) {
            if schema.is_indexed(field) {
                scope.indexed_fields = true;
            }
            if !has_attribute_store || !schema.is_attribute(field) {
                scope.non_attribute_fields = true;
            }
        }
        scope
    }

    /// The prior document must be fetched and rewritten.
    pub fn needs_document(&self) -> bool {
        self.indexed_fields || self.non_attribute_fields
    }
}

/// The stores a view writes to.
#[derive(Clone)]
pub struct FeedStores {
    pub meta: Arc<DocumentMetaStore>,
    pub summary: Arc<dyn SummaryAdapter>,
    pub index: Option<Arc<dyn IndexWriter>>,
    pub attributes: Option<Arc<dyn AttributeWriter>>,
}

pub struct FeedView {
    label: String,
    params: PersistentParams,
    schema: DocSchema,
    meta: Arc<DocumentMetaStore>,
    summary: Arc<dyn SummaryAdapter>,
    index: Option<Arc<dyn IndexWriter>>,
    attributes: Option<Arc<dyn AttributeWriter>>,
    write_service: WriteService,
    pending_lids: Arc<PendingLidTracker>,
    lid_delayer: Arc<LidReuseDelayer>,
    metrics: FeedMetrics,
    visibility_delay: Duration,
}

impl FeedView {
    /// Build a view and spawn its executors. Must be called within a tokio runtime.
    pub fn new(
        params: PersistentParams,
        schema: DocSchema,
        stores: FeedStores,
        metrics: FeedMetrics,
        visibility_delay: Duration,
    ) -> Self {
        let label = format!("{}.{}", params.doc_type, params.sub_db_type);
        let lid_delayer = Arc::new(LidReuseDelayer::new(
            Arc::clone(&stores.meta),
            visibility_delay,
        ));
        tracing::info!(
            "[FEED {}] flushed meta={} doc={} visibility_delay={}ms",
            label,
            params.flushed_meta_serial,
            params.flushed_doc_serial,
            visibility_delay.as_millis()
        );
        FeedView {
            label,
            params,
            schema,
            meta: stores.meta,
            summary: stores.summary,
            index: stores.index,
            attributes: stores.attributes,
            write_service: WriteService::spawn(),
            pending_lids: PendingLidTracker::new(),
            lid_delayer,
            metrics,
            visibility_delay,
        }
    }

    pub fn params(&self) -> &PersistentParams {
        &self.params
    }

    pub fn schema(&self) -> &DocSchema {
        &self.schema
    }

    pub fn meta(&self) -> &Arc<DocumentMetaStore> {
        &self.meta
    }

    pub fn pending_lids(&self) -> &Arc<PendingLidTracker> {
        &self.pending_lids
    }

    pub fn lid_delayer(&self) -> &Arc<LidReuseDelayer> {
        &self.lid_delayer
    }

    pub fn visibility_delay(&self) -> Duration {
        self.visibility_delay
    }

    // ── gating ──────────────────────────────────────────────────────────

    fn use_meta_store(&self, serial: SerialNum) -> bool {
        serial > self.params.flushed_meta_serial
    }

    fn use_document_store(&self, serial: SerialNum) -> bool {
        serial > self.params.flushed_doc_serial
    }

    fn index_for(&self, serial: SerialNum) -> Option<Arc<dyn IndexWriter>> {
        self.index
            .as_ref()
            .filter(|index| serial > index.flushed_serial())
            .cloned()
    }

    fn attributes_for(&self, serial: SerialNum) -> Option<Arc<dyn AttributeWriter>> {
        self.attributes
            .as_ref()
            .filter(|attrs| serial > attrs.flushed_serial())
            .cloned()
    }

    fn commit_immediately(&self) -> bool {
        self.visibility_delay.is_zero()
    }

    fn dispatch<F>(
        &self,
        executor: &Executor,
        ctx: &CompletionContext,
        lids: &[Lid],
        job: F,
    ) where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sub = ctx.begin();
        let tokens: Vec<PendingLidToken> =
            lids.iter().map(|lid| self.pending_lids.produce(*lid)).collect();
        self.metrics
            .record_store_write(&self.params.doc_type, executor.name());
        executor.execute(move || {
            let result = job();
            drop(tokens);
            sub.finish(result);
        });
    }

    fn retire_on_done(&self, ctx: &CompletionContext, lids: Vec<Lid>) {
        let delayer = Arc::clone(&self.lid_delayer);
        let label = self.label.clone();
        ctx.on_done(move |ok| {
            if ok {
                delayer.delay_reuse(&lids);
            } else {
                tracing::warn!(
                    "[FEED {}] keeping lids {:?} held after failed removal",
                    label,
                    lids
                );
            }
        });
    }

    fn check_bucket(&self, bucket: &BucketId, id: &DocumentId) -> Result<()> {
        if id.doc_type() != self.params.doc_type {
            return Err(FeedError::InvalidRequest(format!(
                "document type '{}' does not match '{}'",
                id.doc_type(),
                self.params.doc_type
            )));
        }
        if !bucket.contains_document(id) {
            return Err(FeedError::InvalidRequest(format!(
                "{} does not belong to {}",
                id, bucket
            )));
        }
        Ok(())
    }

    // ── generic entry points ────────────────────────────────────────────

    pub fn prepare(&self, op: &mut FeedOperation) -> Result<()> {
        match op {
            FeedOperation::Put(op) => self.prepare_put(op),
            FeedOperation::Update(op) => self.prepare_update(op),
            FeedOperation::Remove(op) => self.prepare_remove(op),
            FeedOperation::Move(op) => self.prepare_move(op),
            FeedOperation::DeleteBucket(_)
            | FeedOperation::CreateBucket(_)
            | FeedOperation::JoinBuckets(_)
            | FeedOperation::SplitBucket(_)
            | FeedOperation::PruneRemoved(_)
            | FeedOperation::DropTombstone(_)
            | FeedOperation::CompactLidSpace(_) => Ok(()),
        }
    }

    pub async fn handle(&self, ctx: &CompletionContext, op: &FeedOperation) -> Result<()> {
        self.metrics
            .record_operation(&self.params.doc_type, op.kind());
        let result = match op {
            FeedOperation::Put(op) => self.handle_put(ctx, op),
            FeedOperation::Update(op) => self.handle_update(ctx, op).await,
            FeedOperation::Remove(op) => self.handle_remove(ctx, op),
            FeedOperation::Move(op) => self.handle_move(ctx, op),
            FeedOperation::DeleteBucket(op) => self.handle_delete_bucket(ctx, op).await,
            FeedOperation::CreateBucket(op) => self.handle_create_bucket(op),
            FeedOperation::JoinBuckets(op) => self.handle_join_buckets(op),
            FeedOperation::SplitBucket(op) => self.handle_split_bucket(op),
            FeedOperation::PruneRemoved(op) => self.handle_prune_removed(op),
            FeedOperation::DropTombstone(op) => self.handle_drop_tombstone(op),
            FeedOperation::CompactLidSpace(op) => self.handle_compact_lid_space(op).await,
        };
        match result {
            Ok(()) => {
                if op.allows_early_ack() && !self.commit_immediately() {
                    ctx.ack_early();
                }
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .record_failure(&self.params.doc_type, op.kind());
                tracing::debug!(
                    "[FEED {}] {} serial={} failed: {}",
                    self.label,
                    op.kind(),
                    op.serial(),
                    e
                );
                Err(e)
            }
        }
    }

    // ── put ─────────────────────────────────────────────────────────────

    pub fn prepare_put(&self, op: &mut PutOperation) -> Result<()> {
        self.check_bucket(&op.bucket, &op.document.id)?;
        if self.use_meta_store(op.serial) {
            let lookup = self.meta.lookup(&op.document.id.global_id());
            op.lid = lookup.lid;
            match lookup.existing {
                Some(prev) => {
                    op.prev_lid = lookup.lid;
                    op.prev_timestamp = prev.timestamp;
                }
                None => {
                    op.prev_lid = 0;
                    op.prev_timestamp = 0;
                }
            }
        } else if op.lid == 0 {
            return Err(FeedError::InvalidRequest(format!(
                "replayed put of {} at serial {} carries no lid",
                op.document.id, op.serial
            )));
        }
        Ok(())
    }

    pub fn handle_put(&self, ctx: &CompletionContext, op: &PutOperation) -> Result<()> {
        tracing::debug!(
            "[FEED {}] put {} lid={} serial={}",
            self.label,
            op.document.id,
            op.lid,
            op.serial
        );
        self.write_document(
            ctx,
            op.serial,
            op.lid,
            op.bucket,
            op.timestamp,
            Arc::new(op.document.clone()),
        )
    }

    /// Write a whole document to every store that has not yet seen `serial`.
    fn write_document(
        &self,
        ctx: &CompletionContext,
        serial: SerialNum,
        lid: Lid,
        bucket: BucketId,
        timestamp: u64,
        doc: Arc<Document>,
    ) -> Result<()> {
        if self.use_meta_store(serial) {
            self.meta.put(
                serial,
                lid,
                MetaEntry {
                    gid: doc.id.global_id(),
                    doc_id: doc.id.clone(),
                    bucket,
                    timestamp,
                    size: doc.serialized_size(),
                },
            )?;
        }
        if self.use_document_store(serial) {
            let summary = Arc::clone(&self.summary);
            let d = Arc::clone(&doc);
            self.dispatch(&self.write_service.summary, ctx, &[lid], move || {
                summary.put(serial, lid, &d)
            });
        }
        let commit = self.commit_immediately();
        if let Some(index) = self.index_for(serial) {
            let d = Arc::clone(&doc);
            self.dispatch(&self.write_service.index, ctx, &[lid], move || {
                index.put(serial, lid, &d)?;
                if commit {
                    index.commit(serial)?;
                }
                Ok(())
            });
        }
        if let Some(attrs) = self.attributes_for(serial) {
            self.dispatch(&self.write_service.attribute, ctx, &[lid], move || {
                attrs.put(serial, lid, &doc)?;
                if commit {
                    attrs.commit(serial)?;
                }
                Ok(())
            });
        }
        Ok(())
    }

    // ── update ──────────────────────────────────────────────────────────

    pub fn prepare_update(&self, op: &mut UpdateOperation) -> Result<()> {
        self.check_bucket(&op.bucket, &op.update.id)?;
        if self.use_meta_store(op.serial) {
            let lookup = self.meta.lookup(&op.update.id.global_id());
            op.lid = lookup.lid;
            match lookup.existing {
                Some(prev) => {
                    op.prev_timestamp = prev.timestamp;
                    op.created = false;
                }
                None if op.update.create_if_missing => {
                    op.prev_timestamp = 0;
                    op.created = true;
                }
                None => return Err(FeedError::NotFound(op.update.id.to_string())),
            }
        } else if op.lid == 0 {
            return Err(FeedError::NotFound(op.update.id.to_string()));
        }
        Ok(())
    }

    pub async fn handle_update(&self, ctx: &CompletionContext, op: &UpdateOperation) -> Result<()> {
        let serial = op.serial;
        let lid = op.lid;
        if op.created {
            tracing::debug!(
                "[FEED {}] update creates {} lid={} serial={}",
                self.label,
                op.update.id,
                lid,
                serial
            );
            let mut doc = Document::new(op.update.id.clone());
            op.update.apply_to(&mut doc)?;
            return self.write_document(ctx, serial, lid, op.bucket, op.timestamp, Arc::new(doc));
        }

        let scope = UpdateScope::classify(&self.schema, self.attributes.is_some(), &op.update);
        tracing::debug!(
            "[FEED {}] update {} lid={} serial={} scope={:?}",
            self.label,
            op.update.id,
            lid,
            serial,
            scope
        );
        let gid = op.update.id.global_id();
        let commit = self.commit_immediately();

        if !scope.needs_document() {
            if self.use_meta_store(serial) {
                self.meta.update(serial, &gid, op.timestamp, None)?;
            }
            if let Some(attrs) = self.attributes_for(serial) {
                let updates = op.update.updates.clone();
                self.dispatch(&self.write_service.attribute, ctx, &[lid], move || {
                    attrs.update(serial, lid, &updates)?;
                    if commit {
                        attrs.commit(serial)?;
                    }
                    Ok(())
                });
            }
            return Ok(());
        }

        self.pending_lids.wait_for_consumed(lid).await;
        let mut doc = self
            .get_document(lid)?
            .unwrap_or_else(|| Document::new(op.update.id.clone()));
        op.update.apply_to(&mut doc)?;
        if self.use_meta_store(serial) {
            self.meta
                .update(serial, &gid, op.timestamp, Some(doc.serialized_size()))?;
        }
        let doc = Arc::new(doc);
        if self.use_document_store(serial) {
            let summary = Arc::clone(&self.summary);
            let d = Arc::clone(&doc);
            self.dispatch(&self.write_service.summary, ctx, &[lid], move || {
                summary.put(serial, lid, &d)
            });
        }
        if scope.indexed_fields {
            if let Some(index) = self.index_for(serial) {
                let d = Arc::clone(&doc);
                self.dispatch(&self.write_service.index, ctx, &[lid], move || {
                    index.put(serial, lid, &d)?;
                    if commit {
                        index.commit(serial)?;
                    }
                    Ok(())
                });
            }
        }
        let touches_attributes = op
            .update
            .updates
            .iter()
            .any(|u| self.schema.is_attribute(u.field()));
        if touches_attributes {
            if let Some(attrs) = self.attributes_for(serial) {
                self.dispatch(&self.write_service.attribute, ctx, &[lid], move || {
                    attrs.put(serial, lid, &doc)?;
                    if commit {
                        attrs.commit(serial)?;
                    }
                    Ok(())
                });
            }
        }
        Ok(())
    }

    // ── remove ──────────────────────────────────────────────────────────

    pub fn prepare_remove(&self, op: &mut RemoveOperation) -> Result<()> {
        if !op.bucket.contains_document(&op.doc_id) {
            return Err(FeedError::InvalidRequest(format!(
                "{} does not belong to {}",
                op.doc_id, op.bucket
            )));
        }
        if self.use_meta_store(op.serial) {
            match self.meta.get_by_gid(&op.doc_id.global_id()) {
                Some((lid, entry)) => {
                    op.lid = lid;
                    op.prev_timestamp = entry.timestamp;
                }
                None => {
                    op.lid = 0;
                    op.prev_timestamp = 0;
                }
            }
        }
        Ok(())
    }

    pub fn handle_remove(&self, ctx: &CompletionContext, op: &RemoveOperation) -> Result<()> {
        tracing::debug!(
            "[FEED {}] remove {} lid={} serial={}",
            self.label,
            op.doc_id,
            op.lid,
            op.serial
        );
        let use_meta = self.use_meta_store(op.serial);
        if use_meta {
            self.meta
                .remove(op.serial, &op.doc_id, op.bucket, op.timestamp)?;
        }
        if op.lid != 0 {
            self.remove_from_stores(ctx, op.serial, vec![op.lid]);
            if use_meta {
                self.retire_on_done(ctx, vec![op.lid]);
            }
        }
        Ok(())
    }

    fn remove_from_stores(&self, ctx: &CompletionContext, serial: SerialNum, lids: Vec<Lid>) {
        let lids = Arc::new(lids);
        if self.use_document_store(serial) {
            let summary = Arc::clone(&self.summary);
            let l = Arc::clone(&lids);
            self.dispatch(&self.write_service.summary, ctx, &lids, move || {
                l.iter().try_for_each(|lid| summary.remove(serial, *lid))
            });
        }
        let commit = self.commit_immediately();
        if let Some(index) = self.index_for(serial) {
            let l = Arc::clone(&lids);
            self.dispatch(&self.write_service.index, ctx, &lids, move || {
                l.iter().try_for_each(|lid| index.remove(serial, *lid))?;
                if commit {
                    index.commit(serial)?;
                }
                Ok(())
            });
        }
        if let Some(attrs) = self.attributes_for(serial) {
            let l = Arc::clone(&lids);
            self.dispatch(&self.write_service.attribute, ctx, &lids, move || {
                l.iter().try_for_each(|lid| attrs.remove(serial, *lid))?;
                if commit {
                    attrs.commit(serial)?;
                }
                Ok(())
            });
        }
    }

    // ── move ────────────────────────────────────────────────────────────

    pub fn prepare_move(&self, op: &mut MoveOperation) -> Result<()> {
        if !op.target_bucket.contains_document(&op.doc_id) {
            return Err(FeedError::InvalidRequest(format!(
                "{} does not belong to {}",
                op.doc_id, op.target_bucket
            )));
        }
        if self.use_meta_store(op.serial) {
            let (lid, entry) = self
                .meta
                .get_by_gid(&op.doc_id.global_id())
                .ok_or_else(|| FeedError::NotFound(op.doc_id.to_string()))?;
            op.source_lid = lid;
            op.source_bucket = entry.bucket;
        } else if op.source_lid == 0 {
            return Err(FeedError::NotFound(op.doc_id.to_string()));
        }
        if op.target_lid == 0 {
            op.target_lid = op.source_lid;
        }
        Ok(())
    }

    pub fn handle_move(&self, ctx: &CompletionContext, op: &MoveOperation) -> Result<()> {
        tracing::debug!(
            "[FEED {}] move {} {}:{} -> {}:{} serial={}",
            self.label,
            op.doc_id,
            op.source_bucket,
            op.source_lid,
            op.target_bucket,
            op.target_lid,
            op.serial
        );
        let serial = op.serial;
        let use_meta = self.use_meta_store(serial);
        if use_meta {
            self.meta.move_entry(
                serial,
                &op.doc_id.global_id(),
                op.target_lid,
                op.target_bucket,
            )?;
        }
        if op.source_lid == op.target_lid {
            return Ok(());
        }
        let (from, to) = (op.source_lid, op.target_lid);
        if self.use_document_store(serial) {
            let summary = Arc::clone(&self.summary);
            self.dispatch(&self.write_service.summary, ctx, &[from, to], move || {
                summary.move_lid(serial, from, to)
            });
        }
        let commit = self.commit_immediately();
        if let Some(index) = self.index_for(serial) {
            self.dispatch(&self.write_service.index, ctx, &[from, to], move || {
                index.move_lid(serial, from, to)?;
                if commit {
                    index.commit(serial)?;
                }
                Ok(())
            });
        }
        if let Some(attrs) = self.attributes_for(serial) {
            self.dispatch(&self.write_service.attribute, ctx, &[from, to], move || {
                attrs.move_lid(serial, from, to)
            });
        }
        if use_meta {
            self.retire_on_done(ctx, vec![from]);
        }
        Ok(())
    }

    // ── bucket operations ───────────────────────────────────────────────

    pub async fn handle_delete_bucket(
        &self,
        ctx: &CompletionContext,
        op: &BucketOperation,
    ) -> Result<()> {
        let lids = self.meta.live_lids_in(&op.bucket);
        tracing::info!(
            "[FEED {}] delete {} ({} documents) serial={}",
            self.label,
            op.bucket,
            lids.len(),
            op.serial
        );
        self.pending_lids.wait_for_all(&lids).await;
        let use_meta = self.use_meta_store(op.serial);
        if use_meta {
            self.meta.delete_bucket(op.serial, &op.bucket);
        }
        if !lids.is_empty() {
            self.remove_from_stores(ctx, op.serial, lids.clone());
            if use_meta {
                self.retire_on_done(ctx, lids);
            }
        }
        Ok(())
    }

    pub fn handle_create_bucket(&self, op: &BucketOperation) -> Result<()> {
        if self.use_meta_store(op.serial) {
            self.meta.create_bucket(op.serial, op.bucket);
        }
        Ok(())
    }

    pub fn handle_join_buckets(&self, op: &JoinBucketsOperation) -> Result<()> {
        if self.use_meta_store(op.serial) {
            tracing::info!(
                "[FEED {}] join {:?} -> {} serial={}",
                self.label,
                op.sources,
                op.target,
                op.serial
            );
            self.meta.join_buckets(op.serial, &op.sources, op.target)?;
        }
        Ok(())
    }

    pub fn handle_split_bucket(&self, op: &SplitBucketOperation) -> Result<()> {
        if self.use_meta_store(op.serial) {
            tracing::info!(
                "[FEED {}] split {} -> {}, {} serial={}",
                self.label,
                op.source,
                op.target1,
                op.target2,
                op.serial
            );
            self.meta
                .split_bucket(op.serial, op.source, op.target1, op.target2)?;
        }
        Ok(())
    }

    pub fn handle_prune_removed(&self, op: &PruneRemovedOperation) -> Result<()> {
        if self.use_meta_store(op.serial) {
            let pruned = self
                .meta
                .prune_tombstones(op.serial, op.older_than, op.bucket);
            tracing::debug!(
                "[FEED {}] pruned {} tombstones older than {}",
                self.label,
                pruned,
                op.older_than
            );
        }
        Ok(())
    }

    pub fn handle_drop_tombstone(&self, op: &DropTombstoneOperation) -> Result<()> {
        if self.use_meta_store(op.serial) {
            let dropped = self.meta.drop_tombstone_at(
                op.serial,
                op.bucket,
                &op.doc_id.global_id(),
                op.timestamp,
            );
            if !dropped {
                tracing::debug!(
                    "[FEED {}] no tombstone for {} at {}",
                    self.label,
                    op.doc_id,
                    op.timestamp
                );
            }
        }
        Ok(())
    }

    pub async fn handle_compact_lid_space(&self, op: &CompactLidSpaceOperation) -> Result<()> {
        let serial = op.serial;
        if let Some(lid) = self.meta.highest_live_lid() {
            if lid >= op.lid_limit {
                return Err(FeedError::InvalidRequest(format!(
                    "cannot compact lid space to {}: lid {} is live",
                    op.lid_limit, lid
                )));
            }
        }
        self.write_service.sync().await;
        if self.use_meta_store(serial) {
            self.meta.compact_lid_space(serial, op.lid_limit)?;
        }
        if self.use_document_store(serial) {
            self.summary.compact_lid_space(serial, op.lid_limit)?;
        }
        if let Some(index) = self.index_for(serial) {
            index.commit(serial)?;
            index.compact_lid_space(serial, op.lid_limit)?;
        }
        if let Some(attrs) = self.attributes_for(serial) {
            attrs.compact_lid_space(serial, op.lid_limit)?;
        }
        tracing::info!(
            "[FEED {}] lid space compacted to {} serial={}",
            self.label,
            op.lid_limit,
            serial
        );
        Ok(())
    }

    // ── commit and reads ────────────────────────────────────────────────

    /// Make every write up to `serial` visible, retire delayed lids, then call `on_done`.
    pub async fn force_commit<F>(&self, serial: SerialNum, on_done: F) -> Result<()>
    where
        F: FnOnce(),
    {
        let started = Instant::now();
        self.write_service.sync().await;
        if let Some(index) = &self.index {
            index.commit(serial)?;
        }
        if let Some(attrs) = &self.attributes {
            attrs.commit(serial)?;
        }
        let released = self.lid_delayer.release_pending();
        let elapsed = started.elapsed();
        self.metrics.observe_commit(elapsed.as_secs_f64());
        tracing::debug!(
            "[FEED {}] commit serial={} released_lids={} took={}ms",
            self.label,
            serial,
            released,
            elapsed.as_millis()
        );
        on_done();
        Ok(())
    }

    /// Advance every store's last-seen serial without changing data.
    pub fn heart_beat(&self, serial: SerialNum) {
        self.meta.heart_beat(serial);
        self.summary.heart_beat(serial);
        if let Some(index) = &self.index {
            index.heart_beat(serial);
        }
        if let Some(attrs) = &self.attributes {
            attrs.heart_beat(serial);
        }
    }

    /// Wait for every dispatched sub-write to finish.
    pub async fn sync(&self) {
        self.write_service.sync().await;
    }

    /// Stored document at `lid` with current attribute values applied.
    pub fn get_document(&self, lid: Lid) -> Result<Option<Document>> {
        let Some(mut doc) = self.summary.get(lid)? else {
            return Ok(None);
        };
        if let Some(attrs) = &self.attributes {
            let values = attrs.get(lid);
            for name in &self.schema.attributes {
                match values.get(name) {
                    Some(v) => {
                        doc.fields.insert(name.clone(), v.clone());
                    }
                    None => {
                        doc.fields.remove(name);
                    }
                }
            }
        }
        Ok(Some(doc))
    }

    pub fn get_by_id(&self, id: &DocumentId) -> Result<Option<(MetaEntry, Document)>> {
        let Some((lid, entry)) = self.meta.get_by_gid(&id.global_id()) else {
            return Ok(None);
        };
        Ok(self.get_document(lid)?.map(|doc| (entry, doc)))
    }
}
