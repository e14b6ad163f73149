//! Document metadata store: gid ↔ lid mapping, per-document bucket and
//! timestamp, lid allocation and per-bucket summaries.
//!
//! Bucket checksums are maintained incrementally: every live document
//! contributes `entry_checksum(gid, timestamp)` XORed into its bucket.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::StoreSerials;
use crate::error::{FeedError, Result};
use crate::types::{
    entry_checksum, BucketId, BucketInfo, DocumentId, GlobalId, Lid, SerialNum, Timestamp,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub gid: GlobalId,
    pub doc_id: DocumentId,
    pub bucket: BucketId,
    pub timestamp: Timestamp,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub gid: GlobalId,
    pub doc_id: DocumentId,
    pub timestamp: Timestamp,
}

/// Outcome of looking up a gid ahead of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct LidLookup {
    pub lid: Lid,
    pub existing: Option<MetaEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketState {
    checksum: u32,
    doc_count: u32,
    total_size: u64,
    active: bool,
}

#[derive(Debug)]
struct MetaInner {
    by_gid: HashMap<GlobalId, Lid>,
    entries: BTreeMap<Lid, MetaEntry>,
    /// Retired lids available for reuse.
    free: BTreeSet<Lid>,
    /// Removed lids not yet retired.
    held: BTreeSet<Lid>,
    next_lid: Lid,
    buckets: BTreeMap<BucketId, BucketState>,
    tombstones: BTreeMap<BucketId, BTreeMap<GlobalId, Tombstone>>,
}

impl MetaInner {
    fn new() -> Self {
        MetaInner {
            by_gid: HashMap::new(),
            entries: BTreeMap::new(),
            free: BTreeSet::new(),
            held: BTreeSet::new(),
            next_lid: 1,
            buckets: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    fn next_free_lid(&self) -> Lid {
        self.free.iter().next().copied().unwrap_or(self.next_lid)
    }

    fn claim_lid(&mut self, lid: Lid) {
        if !self.free.remove(&lid) && lid >= self.next_lid {
            for skipped in self.next_lid..lid {
                self.free.insert(skipped);
            }
            self.next_lid = lid + 1;
        }
    }

    fn add_to_bucket(&mut self, entry: &MetaEntry) {
        let state = self.buckets.entry(entry.bucket).or_default();
        state.checksum ^= entry_checksum(&entry.gid, entry.timestamp);
        state.doc_count += 1;
        state.total_size += entry.size;
    }

    fn remove_from_bucket(&mut self, entry: &MetaEntry) {
        let state = self.buckets.entry(entry.bucket).or_default();
        state.checksum ^= entry_checksum(&entry.gid, entry.timestamp);
        state.doc_count = state.doc_count.saturating_sub(1);
        state.total_size = state.total_size.saturating_sub(entry.size);
    }

    fn drop_tombstone(&mut self, bucket: BucketId, gid: &GlobalId) {
        if let Some(stones) = self.tombstones.get_mut(&bucket) {
            stones.remove(gid);
        }
    }

    fn info(&self, bucket: &BucketId) -> BucketInfo {
        let state = self.buckets.get(bucket).copied().unwrap_or_default();
        let stones = self.tombstones.get(bucket).map(|t| t.len()).unwrap_or(0) as u32;
        BucketInfo {
            checksum: state.checksum,
            doc_count: state.doc_count,
            total_size: state.total_size,
            entry_count: state.doc_count + stones,
            ready: true,
            active: state.active,
        }
    }

    /// Re-tag every entry and tombstone of `from` with whatever `target_of` picks.
    fn retag_bucket<F>(&mut self, from: BucketId, target_of: F) -> Result<()>
    where
        F: Fn(&GlobalId) -> Option<BucketId>,
    {
        let lids: Vec<Lid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.bucket == from)
            .map(|(lid, _)| *lid)
            .collect();
        for lid in lids {
            let Some(mut entry) = self.entries.get(&lid).cloned() else {
                continue;
            };
            let target = target_of(&entry.gid).ok_or_else(|| {
                FeedError::BackendFailure(format!(
                    "{} in {} belongs to no target bucket",
                    entry.gid, from
                ))
            })?;
            self.remove_from_bucket(&entry);
            entry.bucket = target;
            self.add_to_bucket(&entry);
            self.entries.insert(lid, entry);
        }
        if let Some(stones) = self.tombstones.remove(&from) {
            for (gid, stone) in stones {
                if let Some(target) = target_of(&gid) {
                    self.tombstones.entry(target).or_default().insert(gid, stone);
                }
            }
        }
        Ok(())
    }
}

pub struct DocumentMetaStore {
    inner: RwLock<MetaInner>,
    serials: StoreSerials,
}

impl DocumentMetaStore {
    pub fn new(flushed_serial: SerialNum) -> Self {
        DocumentMetaStore {
            inner: RwLock::new(MetaInner::new()),
            serials: StoreSerials::new(flushed_serial),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MetaInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MetaInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── lookup ──────────────────────────────────────────────────────────

    /// Current lid for `gid`, or the lid a new document would get.
    pub fn lookup(&self, gid: &GlobalId) -> LidLookup {
        let inner = self.read();
        match inner.by_gid.get(gid) {
            Some(&lid) => LidLookup {
                lid,
                existing: inner.entries.get(&lid).cloned(),
            },
            None => LidLookup {
                lid: inner.next_free_lid(),
                existing: None,
            },
        }
    }

    pub fn get(&self, lid: Lid) -> Option<MetaEntry> {
        self.read().entries.get(&lid).cloned()
    }

    pub fn get_by_gid(&self, gid: &GlobalId) -> Option<(Lid, MetaEntry)> {
        let inner = self.read();
        let lid = *inner.by_gid.get(gid)?;
        inner.entries.get(&lid).cloned().map(|e| (lid, e))
    }

    pub fn live_lids_in(&self, bucket: &BucketId) -> Vec<Lid> {
        self.read()
            .entries
            .iter()
            .filter(|(_, e)| e.bucket == *bucket)
            .map(|(lid, _)| *lid)
            .collect()
    }

    pub fn entries_in(&self, bucket: &BucketId) -> Vec<(Lid, MetaEntry)> {
        self.read()
            .entries
            .iter()
            .filter(|(_, e)| e.bucket == *bucket)
            .map(|(lid, e)| (*lid, e.clone()))
            .collect()
    }

    pub fn tombstones_in(&self, bucket: &BucketId) -> Vec<Tombstone> {
        self.read()
            .tombstones
            .get(bucket)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn doc_count(&self) -> usize {
        self.read().entries.len()
    }

    /// One past the highest lid ever handed out.
    pub fn lid_limit(&self) -> Lid {
        self.read().next_lid
    }

    pub fn highest_live_lid(&self) -> Option<Lid> {
        self.read().entries.keys().next_back().copied()
    }

    pub fn lowest_free_lid(&self) -> Option<Lid> {
        self.read().free.iter().next().copied()
    }

    pub fn is_held(&self, lid: Lid) -> bool {
        self.read().held.contains(&lid)
    }

    // ── document writes ─────────────────────────────────────────────────

    pub fn put(&self, serial: SerialNum, lid: Lid, entry: MetaEntry) -> Result<()> {
        if lid == 0 {
            return Err(FeedError::BackendFailure(format!(
                "lid 0 is reserved ({})",
                entry.doc_id
            )));
        }
        let mut inner = self.write();
        if let Some(&existing) = inner.by_gid.get(&entry.gid) {
            if existing != lid {
                return Err(FeedError::BackendFailure(format!(
                    "{} already stored at lid {}, not {}",
                    entry.gid, existing, lid
                )));
            }
        } else if let Some(other) = inner.entries.get(&lid) {
            return Err(FeedError::BackendFailure(format!(
                "lid {} is occupied by {}",
                lid, other.gid
            )));
        } else if inner.held.contains(&lid) {
            return Err(FeedError::BackendFailure(format!(
                "lid {} has not been retired yet",
                lid
            )));
        }

        if let Some(previous) = inner.entries.remove(&lid) {
            inner.remove_from_bucket(&previous);
        } else {
            inner.claim_lid(lid);
        }
        inner.drop_tombstone(entry.bucket, &entry.gid);
        inner.add_to_bucket(&entry);
        inner.by_gid.insert(entry.gid, lid);
        inner.entries.insert(lid, entry);
        drop(inner);
        self.serials.record_write(serial);
        Ok(())
    }

    /// Change timestamp (and size, when known) of a live document.
    pub fn update(
        &self,
        serial: SerialNum,
        gid: &GlobalId,
        timestamp: Timestamp,
        size: Option<u64>,
    ) -> Result<()> {
        let mut inner = self.write();
        let lid = *inner
            .by_gid
            .get(gid)
            .ok_or_else(|| FeedError::NotFound(gid.to_string()))?;
        let Some(previous) = inner.entries.get(&lid).cloned() else {
            return Err(FeedError::NotFound(gid.to_string()));
        };
        let mut entry = previous.clone();
        entry.timestamp = timestamp;
        if let Some(size) = size {
            entry.size = size;
        }
        inner.remove_from_bucket(&previous);
        inner.add_to_bucket(&entry);
        inner.entries.insert(lid, entry);
        drop(inner);
        self.serials.record_write(serial);
        Ok(())
    }

    /// Remove a document and leave a tombstone. The freed lid is held until
    /// [`DocumentMetaStore::retire_lid`]. Returns the lid if the document was live.
    pub fn remove(
        &self,
        serial: SerialNum,
        doc_id: &DocumentId,
        bucket: BucketId,
        timestamp: Timestamp,
    ) -> Result<Option<Lid>> {
        let gid = doc_id.global_id();
        let mut inner = self.write();
        let mut tombstone_bucket = bucket;
        let removed = match inner.by_gid.remove(&gid) {
            Some(lid) => {
                if let Some(entry) = inner.entries.remove(&lid) {
                    inner.remove_from_bucket(&entry);
                    tombstone_bucket = entry.bucket;
                }
                inner.held.insert(lid);
                Some(lid)
            }
            None => None,
        };
        inner.buckets.entry(tombstone_bucket).or_default();
        inner.tombstones.entry(tombstone_bucket).or_default().insert(
            gid,
            Tombstone {
                gid,
                doc_id: doc_id.clone(),
                timestamp,
            },
        );
        drop(inner);
        self.serials.record_write(serial);
        Ok(removed)
    }

    /// Make a held lid available for reuse.
    pub fn retire_lid(&self, lid: Lid) {
        let mut inner = self.write();
        if inner.held.remove(&lid) {
            inner.free.insert(lid);
        }
    }

    /// Move a live document to `target_lid` and/or `target_bucket`. Returns the source lid.
    pub fn move_entry(
        &self,
        serial: SerialNum,
        gid: &GlobalId,
        target_lid: Lid,
        target_bucket: BucketId,
    ) -> Result<Lid> {
        let mut inner = self.write();
        let source_lid = *inner
            .by_gid
            .get(gid)
            .ok_or_else(|| FeedError::NotFound(gid.to_string()))?;
        if target_lid != source_lid
            && (inner.entries.contains_key(&target_lid) || inner.held.contains(&target_lid))
        {
            return Err(FeedError::BackendFailure(format!(
                "move target lid {} is not free",
                target_lid
            )));
        }
        let Some(mut entry) = inner.entries.remove(&source_lid) else {
            return Err(FeedError::NotFound(gid.to_string()));
        };
        inner.remove_from_bucket(&entry);
        entry.bucket = target_bucket;
        inner.add_to_bucket(&entry);
        if target_lid != source_lid {
            inner.claim_lid(target_lid);
            inner.held.insert(source_lid);
        }
        inner.by_gid.insert(*gid, target_lid);
        inner.entries.insert(target_lid, entry);
        drop(inner);
        self.serials.record_write(serial);
        Ok(source_lid)
    }

    // ── bucket lifecycle ────────────────────────────────────────────────

    pub fn bucket_exists(&self, bucket: &BucketId) -> bool {
        self.read().buckets.contains_key(bucket)
    }

    pub fn bucket_info(&self, bucket: &BucketId) -> BucketInfo {
        self.read().info(bucket)
    }

    pub fn list_buckets(&self) -> Vec<BucketId> {
        self.read().buckets.keys().copied().collect()
    }

    pub fn create_bucket(&self, serial: SerialNum, bucket: BucketId) {
        self.write().buckets.entry(bucket).or_default();
        self.serials.record_write(serial);
    }

    pub fn set_active(&self, bucket: BucketId, active: bool) {
        self.write().buckets.entry(bucket).or_default().active = active;
    }

    /// Drop the bucket with all of its documents and tombstones. Returns the
    /// removed lids, which stay held until retired.
    pub fn delete_bucket(&self, serial: SerialNum, bucket: &BucketId) -> Vec<Lid> {
        let mut inner = self.write();
        let doomed: Vec<(Lid, GlobalId)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.bucket == *bucket)
            .map(|(lid, e)| (*lid, e.gid))
            .collect();
        for (lid, gid) in &doomed {
            inner.entries.remove(lid);
            inner.by_gid.remove(gid);
            inner.held.insert(*lid);
        }
        inner.buckets.remove(bucket);
        inner.tombstones.remove(bucket);
        drop(inner);
        self.serials.record_write(serial);
        doomed.into_iter().map(|(lid, _)| lid).collect()
    }

    pub fn split_bucket(
        &self,
        serial: SerialNum,
        source: BucketId,
        target1: BucketId,
        target2: BucketId,
    ) -> Result<()> {
        let mut inner = self.write();
        inner.retag_bucket(source, |gid| {
            let doc_bucket = gid.bucket();
            if target1.contains(&doc_bucket) {
                Some(target1)
            } else if target2.contains(&doc_bucket) {
                Some(target2)
            } else {
                None
            }
        })?;
        let active = inner.buckets.remove(&source).map(|s| s.active).unwrap_or(false);
        for target in [target1, target2] {
            inner.buckets.entry(target).or_default().active |= active;
        }
        drop(inner);
        self.serials.record_write(serial);
        Ok(())
    }

    pub fn join_buckets(
        &self,
        serial: SerialNum,
        sources: &[BucketId],
        target: BucketId,
    ) -> Result<()> {
        let mut inner = self.write();
        let mut active = false;
        for source in sources {
            if *source == target {
                continue;
            }
            inner.retag_bucket(*source, |_| Some(target))?;
            active |= inner.buckets.remove(source).map(|s| s.active).unwrap_or(false);
        }
        inner.buckets.entry(target).or_default().active |= active;
        drop(inner);
        self.serials.record_write(serial);
        Ok(())
    }

    /// Drop tombstones older than `older_than`, optionally only in one bucket.
    pub fn prune_tombstones(
        &self,
        serial: SerialNum,
        older_than: Timestamp,
        bucket: Option<BucketId>,
    ) -> usize {
        let mut inner = self.write();
        let mut pruned = 0;
        for (b, stones) in inner.tombstones.iter_mut() {
            if bucket.map(|only| only != *b).unwrap_or(false) {
                continue;
            }
            let before = stones.len();
            stones.retain(|_, t| t.timestamp >= older_than);
            pruned += before - stones.len();
        }
        drop(inner);
        self.serials.record_write(serial);
        pruned
    }

    /// Drop the tombstone of `gid` in `bucket` if it was written at `timestamp`.
    pub fn drop_tombstone_at(
        &self,
        serial: SerialNum,
        bucket: BucketId,
        gid: &GlobalId,
        timestamp: Timestamp,
    ) -> bool {
        let mut inner = self.write();
        let matches = inner
            .tombstones
            .get(&bucket)
            .and_then(|stones| stones.get(gid))
            .map(|t| t.timestamp == timestamp)
            .unwrap_or(false);
        if matches {
            inner.drop_tombstone(bucket, gid);
        }
        drop(inner);
        self.serials.record_write(serial);
        matches
    }

    /// Shrink the lid space to `lid_limit`. Fails if any live or held lid is at or above it.
    pub fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()> {
        let mut inner = self.write();
        let limit = lid_limit.max(1);
        if let Some(lid) = inner.entries.range(limit..).next().map(|(lid, _)| *lid) {
            return Err(FeedError::InvalidRequest(format!(
                "cannot compact lid space to {}: lid {} is live",
                limit, lid
            )));
        }
        if let Some(lid) = inner.held.range(limit..).next().copied() {
            return Err(FeedError::InvalidRequest(format!(
                "cannot compact lid space to {}: lid {} is not yet retired",
                limit, lid
            )));
        }
        inner.free.retain(|lid| *lid < limit);
        inner.next_lid = inner.next_lid.min(limit);
        drop(inner);
        self.serials.record_write(serial);
        Ok(())
    }

    /// Recompute a bucket's summary from its entries. Returns true when the
    /// stored summary was wrong and has been replaced.
    pub fn repair_bucket(&self, bucket: &BucketId) -> bool {
        let mut inner = self.write();
        let mut fresh = BucketState {
            active: inner.buckets.get(bucket).map(|s| s.active).unwrap_or(false),
            ..BucketState::default()
        };
        for entry in inner.entries.values().filter(|e| e.bucket == *bucket) {
            fresh.checksum ^= entry_checksum(&entry.gid, entry.timestamp);
            fresh.doc_count += 1;
            fresh.total_size += entry.size;
        }
        let current = inner.buckets.get(bucket).copied().unwrap_or_default();
        let changed = current.checksum != fresh.checksum
            || current.doc_count != fresh.doc_count
            || current.total_size != fresh.total_size;
        if changed {
            inner.buckets.insert(*bucket, fresh);
        }
        changed
    }

    // ── serials ─────────────────────────────────────────────────────────

    pub fn heart_beat(&self, serial: SerialNum) {
        self.serials.observe(serial);
    }

    pub fn flushed_serial(&self) -> SerialNum {
        self.serials.flushed()
    }

    pub fn last_serial(&self) -> SerialNum {
        self.serials.last()
    }

    pub fn flush(&self) -> SerialNum {
        self.serials.flush()
    }

    pub fn write_count(&self) -> u64 {
        self.serials.writes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(raw: &str, bucket: BucketId, ts: Timestamp) -> MetaEntry {
        let doc_id = DocumentId::parse(raw).unwrap();
        MetaEntry {
            gid: doc_id.global_id(),
            doc_id,
            bucket,
            timestamp: ts,
            size: 10,
        }
    }

    fn bucket() -> BucketId {
        BucketId::new(16, 1)
    }

    #[test]
    fn lookup_hands_out_lids_from_one() {
        let meta = DocumentMetaStore::new(0);
        let e = entry("id:ns:t:n=1:a", bucket(), 5);
        let lookup = meta.lookup(&e.gid);
        assert_eq!(lookup.lid, 1);
        assert!(lookup.existing.is_none());
        meta.put(1, lookup.lid, e.clone()).unwrap();
        let again = meta.lookup(&e.gid);
        assert_eq!(again.lid, 1);
        assert_eq!(again.existing, Some(e));
        assert_eq!(meta.lookup(&entry("id:ns:t:n=1:b", bucket(), 1).gid).lid, 2);
    }

    #[test]
    fn bucket_info_tracks_puts_and_removes() {
        let meta = DocumentMetaStore::new(0);
        let a = entry("id:ns:t:n=1:a", bucket(), 5);
        let b = entry("id:ns:t:n=1:b", bucket(), 6);
        meta.put(1, 1, a.clone()).unwrap();
        meta.put(2, 2, b.clone()).unwrap();
        let info = meta.bucket_info(&bucket());
        assert_eq!(info.doc_count, 2);
        assert_eq!(info.total_size, 20);
        assert_eq!(
            info.checksum,
            entry_checksum(&a.gid, 5) ^ entry_checksum(&b.gid, 6)
        );

        let removed = meta.remove(3, &b.doc_id, bucket(), 7).unwrap();
        assert_eq!(removed, Some(2));
        let info = meta.bucket_info(&bucket());
        assert_eq!(info.doc_count, 1);
        assert_eq!(info.entry_count, 2);
        assert_eq!(info.checksum, entry_checksum(&a.gid, 5));
    }

    #[test]
    fn removed_lid_is_reused_only_after_retire() {
        let meta = DocumentMetaStore::new(0);
        let a = entry("id:ns:t:n=1:a", bucket(), 5);
        meta.put(1, 1, a.clone()).unwrap();
        meta.remove(2, &a.doc_id, bucket(), 6).unwrap();
        let c = entry("id:ns:t:n=1:c", bucket(), 7);
        assert_eq!(meta.lookup(&c.gid).lid, 2);
        assert!(meta.is_held(1));
        meta.retire_lid(1);
        assert_eq!(meta.lookup(&c.gid).lid, 1);
    }

    #[test]
    fn put_clears_tombstone() {
        let meta = DocumentMetaStore::new(0);
        let a = entry("id:ns:t:n=1:a", bucket(), 5);
        meta.remove(1, &a.doc_id, bucket(), 4).unwrap();
        assert_eq!(meta.tombstones_in(&bucket()).len(), 1);
        meta.put(2, 1, a).unwrap();
        assert!(meta.tombstones_in(&bucket()).is_empty());
        assert_eq!(meta.bucket_info(&bucket()).entry_count, 1);
    }

    #[test]
    fn put_rejects_conflicting_lids() {
        let meta = DocumentMetaStore::new(0);
        let a = entry("id:ns:t:n=1:a", bucket(), 5);
        let b = entry("id:ns:t:n=1:b", bucket(), 5);
        meta.put(1, 1, a.clone()).unwrap();
        assert!(meta.put(2, 1, b).is_err());
        assert!(meta.put(3, 2, a).is_err());
        assert!(meta.put(4, 0, entry("id:ns:t:n=1:z", bucket(), 1)).is_err());
    }

    #[test]
    fn split_and_join_retag_entries() {
        let meta = DocumentMetaStore::new(0);
        let parent = BucketId::new(1, 0);
        // n=0 and n=2 both have bit 0 clear; bit 1 separates them.
        let a = entry("id:ns:t:n=0:a", parent, 1);
        let b = entry("id:ns:t:n=2:b", parent, 2);
        meta.put(1, 1, a.clone()).unwrap();
        meta.put(2, 2, b.clone()).unwrap();
        let (left, right) = parent.split().unwrap();
        meta.split_bucket(3, parent, left, right).unwrap();
        assert!(!meta.bucket_exists(&parent));
        assert_eq!(meta.bucket_info(&left).doc_count, 1);
        assert_eq!(meta.bucket_info(&right).doc_count, 1);
        assert_eq!(meta.get(1).unwrap().bucket, left);

        meta.join_buckets(4, &[left, right], parent).unwrap();
        let info = meta.bucket_info(&parent);
        assert_eq!(info.doc_count, 2);
        assert_eq!(
            info.checksum,
            entry_checksum(&a.gid, 1) ^ entry_checksum(&b.gid, 2)
        );
        assert_eq!(meta.list_buckets(), vec![parent]);
    }

    #[test]
    fn delete_bucket_holds_lids_and_drops_tombstones() {
        let meta = DocumentMetaStore::new(0);
        let a = entry("id:ns:t:n=1:a", bucket(), 5);
        let b = entry("id:ns:t:n=1:b", bucket(), 5);
        meta.put(1, 1, a).unwrap();
        meta.remove(2, &b.doc_id, bucket(), 6).unwrap();
        let lids = meta.delete_bucket(3, &bucket());
        assert_eq!(lids, vec![1]);
        assert!(meta.is_held(1));
        assert!(!meta.bucket_exists(&bucket()));
        assert!(meta.tombstones_in(&bucket()).is_empty());
        assert_eq!(meta.doc_count(), 0);
    }

    #[test]
    fn prune_keeps_recent_tombstones() {
        let meta = DocumentMetaStore::new(0);
        let other = BucketId::new(16, 2);
        meta.remove(1, &DocumentId::parse("id:ns:t:n=1:a").unwrap(), bucket(), 5).unwrap();
        meta.remove(2, &DocumentId::parse("id:ns:t:n=1:b").unwrap(), bucket(), 50).unwrap();
        meta.remove(3, &DocumentId::parse("id:ns:t:n=2:c").unwrap(), other, 5).unwrap();
        assert_eq!(meta.prune_tombstones(4, 10, Some(bucket())), 1);
        assert_eq!(meta.tombstones_in(&bucket()).len(), 1);
        assert_eq!(meta.tombstones_in(&other).len(), 1);
        assert_eq!(meta.prune_tombstones(5, 10, None), 1);
    }

    #[test]
    fn drop_tombstone_needs_matching_timestamp() {
        let meta = DocumentMetaStore::new(0);
        let id = DocumentId::parse("id:ns:t:n=1:a").unwrap();
        meta.remove(1, &id, bucket(), 5).unwrap();
        assert!(!meta.drop_tombstone_at(2, bucket(), &id.global_id(), 6));
        assert_eq!(meta.tombstones_in(&bucket()).len(), 1);
        assert!(meta.drop_tombstone_at(3, bucket(), &id.global_id(), 5));
        assert!(meta.tombstones_in(&bucket()).is_empty());
        assert_eq!(meta.bucket_info(&bucket()).entry_count, 0);
    }

    #[test]
    fn compact_rejects_live_lid_above_limit() {
        let meta = DocumentMetaStore::new(0);
        meta.put(1, 1, entry("id:ns:t:n=1:a", bucket(), 1)).unwrap();
        meta.put(2, 2, entry("id:ns:t:n=1:b", bucket(), 1)).unwrap();
        assert!(matches!(
            meta.compact_lid_space(3, 2),
            Err(FeedError::InvalidRequest(_))
        ));
        assert!(meta.compact_lid_space(4, 3).is_ok());
        assert_eq!(meta.lid_limit(), 3);
    }

    #[test]
    fn move_entry_changes_lid_and_bucket() {
        let meta = DocumentMetaStore::new(0);
        let a = entry("id:ns:t:n=1:a", bucket(), 1);
        meta.put(1, 3, a.clone()).unwrap();
        assert_eq!(meta.lowest_free_lid(), Some(1));
        let target_bucket = BucketId::new(17, 1);
        let source = meta.move_entry(2, &a.gid, 1, target_bucket).unwrap();
        assert_eq!(source, 3);
        assert!(meta.is_held(3));
        assert_eq!(meta.get(1).unwrap().bucket, target_bucket);
        assert_eq!(meta.bucket_info(&bucket()).doc_count, 0);
        assert_eq!(meta.bucket_info(&target_bucket).doc_count, 1);
    }

    #[test]
    fn repair_detects_drift() {
        let meta = DocumentMetaStore::new(0);
        meta.put(1, 1, entry("id:ns:t:n=1:a", bucket(), 1)).unwrap();
        assert!(!meta.repair_bucket(&bucket()));
    }
}
