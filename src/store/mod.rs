//! Backing stores written by the feed view.
//!
//! The metadata store is concrete and written inline by the feed view. The
//! document, indexed-field and attribute stores sit behind traits so that the
//! feed view only sees their write contract; each one reports the serial it
//! has durably flushed and counts the writes it has applied.

pub mod attribute;
pub mod document;
pub mod index;
pub mod meta;
pub mod schema;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::types::{Document, FieldUpdate, FieldValue, Lid, SerialNum};

pub use attribute::AttributeStore;
pub use document::DocumentStore;
pub use index::MemoryIndex;
pub use meta::DocumentMetaStore;

/// Document (summary) store.
pub trait SummaryAdapter: Send + Sync {
    fn put(&self, serial: SerialNum, lid: Lid, doc: &Document) -> Result<()>;
    fn remove(&self, serial: SerialNum, lid: Lid) -> Result<()>;
    fn get(&self, lid: Lid) -> Result<Option<Document>>;
    fn move_lid(&self, serial: SerialNum, from: Lid, to: Lid) -> Result<()>;
    fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()>;
    fn heart_beat(&self, serial: SerialNum);
    fn flushed_serial(&self) -> SerialNum;
    fn write_count(&self) -> u64;
}

/// Indexed-field store. Writes become searchable at `commit`.
pub trait IndexWriter: Send + Sync {
    fn put(&self, serial: SerialNum, lid: Lid, doc: &Document) -> Result<()>;
    fn remove(&self, serial: SerialNum, lid: Lid) -> Result<()>;
    fn move_lid(&self, serial: SerialNum, from: Lid, to: Lid) -> Result<()>;
    fn commit(&self, serial: SerialNum) -> Result<()>;
    fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()>;
    fn heart_beat(&self, serial: SerialNum);
    fn flushed_serial(&self) -> SerialNum;
    fn write_count(&self) -> u64;
}

/// Attribute (fast-access field) store.
pub trait AttributeWriter: Send + Sync {
    fn put(&self, serial: SerialNum, lid: Lid, doc: &Document) -> Result<()>;
    /// Apply the attribute-field subset of an update in place.
    fn update(&self, serial: SerialNum, lid: Lid, updates: &[FieldUpdate]) -> Result<()>;
    fn remove(&self, serial: SerialNum, lid: Lid) -> Result<()>;
    fn get(&self, lid: Lid) -> BTreeMap<String, FieldValue>;
    fn move_lid(&self, serial: SerialNum, from: Lid, to: Lid) -> Result<()>;
    fn commit(&self, serial: SerialNum) -> Result<()>;
    fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()>;
    fn heart_beat(&self, serial: SerialNum);
    fn flushed_serial(&self) -> SerialNum;
    fn write_count(&self) -> u64;
}

/// Serial bookkeeping shared by the in-memory stores.
#[derive(Debug, Default)]
pub struct StoreSerials {
    flushed: AtomicU64,
    last: AtomicU64,
    writes: AtomicU64,
}

impl StoreSerials {
    pub fn new(flushed: SerialNum) -> Self {
        StoreSerials {
            flushed: AtomicU64::new(flushed),
            last: AtomicU64::new(flushed),
            writes: AtomicU64::new(0),
        }
    }

    pub fn record_write(&self, serial: SerialNum) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.last.fetch_max(serial, Ordering::AcqRel);
    }

    pub fn observe(&self, serial: SerialNum) {
        self.last.fetch_max(serial, Ordering::AcqRel);
    }

    pub fn flushed(&self) -> SerialNum {
        self.flushed.load(Ordering::Acquire)
    }

    pub fn last(&self) -> SerialNum {
        self.last.load(Ordering::Acquire)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Mark everything seen so far as flushed.
    pub fn flush(&self) -> SerialNum {
        let last = self.last();
        self.flushed.fetch_max(last, Ordering::AcqRel);
        last
    }
}
