//! In-memory inverted index over the schema's indexed fields.
//!
//! Writes are buffered and only become searchable once committed, mirroring
//! the visibility delay of a real index writer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use super::schema::DocSchema;
use super::{IndexWriter, StoreSerials};
use crate::error::{FeedError, Result};
use crate::types::{Document, FieldValue, Lid, SerialNum};

type Term = (String, String);

#[derive(Debug, Clone)]
enum PendingOp {
    Put(Lid, BTreeSet<Term>),
    Remove(Lid),
    Move(Lid, Lid),
}

#[derive(Default)]
struct IndexInner {
    pending: Vec<PendingOp>,
    postings: HashMap<Term, BTreeSet<Lid>>,
    terms_by_lid: BTreeMap<Lid, BTreeSet<Term>>,
}

impl IndexInner {
    fn unindex(&mut self, lid: Lid) -> Option<BTreeSet<Term>> {
        let terms = self.terms_by_lid.remove(&lid)?;
        for term in &terms {
            if let Some(lids) = self.postings.get_mut(term) {
                lids.remove(&lid);
                if lids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        Some(terms)
    }

    fn index(&mut self, lid: Lid, terms: BTreeSet<Term>) {
        self.unindex(lid);
        for term in &terms {
            self.postings.entry(term.clone()).or_default().insert(lid);
        }
        self.terms_by_lid.insert(lid, terms);
    }

    fn apply(&mut self, op: PendingOp) {
        match op {
            PendingOp::Put(lid, terms) => self.index(lid, terms),
            PendingOp::Remove(lid) => {
                self.unindex(lid);
            }
            PendingOp::Move(from, to) => {
                if let Some(terms) = self.unindex(from) {
                    self.index(to, terms);
                }
            }
        }
    }
}

pub struct MemoryIndex {
    schema: DocSchema,
    inner: Mutex<IndexInner>,
    serials: StoreSerials,
}

impl MemoryIndex {
    pub fn new(schema: DocSchema, flushed_serial: SerialNum) -> Self {
        MemoryIndex {
            schema,
            inner: Mutex::new(IndexInner::default()),
            serials: StoreSerials::new(flushed_serial),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn terms(&self, doc: &Document) -> BTreeSet<Term> {
        let mut terms = BTreeSet::new();
        for (name, value) in doc.fields.iter().filter(|(n, _)| self.schema.is_indexed(n)) {
            collect_terms(name, value, &mut terms);
        }
        terms
    }

    /// Committed lids whose `field` contains `token` (case-insensitive).
    pub fn search(&self, field: &str, token: &str) -> Vec<Lid> {
        let key = (field.to_string(), token.to_lowercase());
        self.lock()
            .postings
            .get(&key)
            .map(|lids| lids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn flush(&self) -> SerialNum {
        self.serials.flush()
    }
}

fn collect_terms(field: &str, value: &FieldValue, out: &mut BTreeSet<Term>) {
    match value {
        FieldValue::Text(s) => {
            for token in s.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
                out.insert((field.to_string(), token.to_lowercase()));
            }
        }
        FieldValue::Integer(i) => {
            out.insert((field.to_string(), i.to_string()));
        }
        FieldValue::Float(f) => {
            out.insert((field.to_string(), f.to_string()));
        }
        FieldValue::Array(items) => {
            for item in items {
                collect_terms(field, item, out);
            }
        }
    }
}

impl IndexWriter for MemoryIndex {
    fn put(&self, serial: SerialNum, lid: Lid, doc: &Document) -> Result<()> {
        let terms = self.terms(doc);
        self.lock().pending.push(PendingOp::Put(lid, terms));
        self.serials.record_write(serial);
        Ok(())
    }

    fn remove(&self, serial: SerialNum, lid: Lid) -> Result<()> {
        self.lock().pending.push(PendingOp::Remove(lid));
        self.serials.record_write(serial);
        Ok(())
    }

    fn move_lid(&self, serial: SerialNum, from: Lid, to: Lid) -> Result<()> {
        self.lock().pending.push(PendingOp::Move(from, to));
        self.serials.record_write(serial);
        Ok(())
    }

    fn commit(&self, serial: SerialNum) -> Result<()> {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.pending);
        for op in pending {
            inner.apply(op);
        }
        drop(inner);
        self.serials.observe(serial);
        Ok(())
    }

    fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()> {
        let inner = self.lock();
        if !inner.pending.is_empty() {
            return Err(FeedError::InvalidRequest(
                "index has uncommitted writes, commit before compacting".to_string(),
            ));
        }
        if let Some((&lid, _)) = inner.terms_by_lid.range(lid_limit..).next() {
            return Err(FeedError::InvalidRequest(format!(
                "index still holds lid {} above limit {}",
                lid, lid_limit
            )));
        }
        drop(inner);
        self.serials.observe(serial);
        Ok(())
    }

    fn heart_beat(&self, serial: SerialNum) {
        self.serials.observe(serial);
    }

    fn flushed_serial(&self) -> SerialNum {
        self.serials.flushed()
    }

    fn write_count(&self) -> u64 {
        self.serials.writes()
    }
}
