//! In-memory document (summary) store. Each document is kept as a serialized
//! [`FieldArray`]: the document id under [`DOC_ID_FIELD`] and every field as a
//! JSON `(name, value)` pair. Field entries get ordinal ids starting at
//! [`RESERVED_FIELD_ID_UPPER`] in name order; the name travels in the payload.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::schema::{DOC_ID_FIELD, RESERVED_FIELD_ID_UPPER};
use super::{StoreSerials, SummaryAdapter};
use crate::error::{FeedError, Result};
use crate::fields::{FieldArray, SerializeOptions};
use crate::types::{Document, DocumentId, FieldValue, Lid, SerialNum};

pub struct DocumentStore {
    docs: Mutex<BTreeMap<Lid, Vec<u8>>>,
    options: SerializeOptions,
    serials: StoreSerials,
}

impl DocumentStore {
    pub fn new(flushed_serial: SerialNum, options: SerializeOptions) -> Self {
        DocumentStore {
            docs: Mutex::new(BTreeMap::new()),
            options,
            serials: StoreSerials::new(flushed_serial),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> SerialNum {
        self.serials.flush()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Lid, Vec<u8>>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn encode_document(doc: &Document) -> Result<FieldArray> {
    let mut arr = FieldArray::new();
    arr.set(DOC_ID_FIELD, doc.id.as_str().as_bytes());
    for (ordinal, (name, value)) in doc.fields.iter().enumerate() {
        let id = u32::try_from(ordinal)
            .ok()
            .and_then(|n| n.checked_add(RESERVED_FIELD_ID_UPPER))
            .ok_or_else(|| {
                FeedError::InvalidRequest(format!("document {} has too many fields", doc.id))
            })?;
        let bytes = serde_json::to_vec(&(name, value))?;
        arr.set(id, &bytes);
    }
    Ok(arr)
}

pub fn decode_document(arr: &FieldArray) -> Result<Document> {
    let raw = std::str::from_utf8(arr.get(DOC_ID_FIELD))
        .map_err(|e| FeedError::BackendFailure(format!("stored document id is not utf-8: {}", e)))?;
    let mut doc = Document::new(DocumentId::parse(raw)?);
    for id in arr.ids().filter(|id| *id != DOC_ID_FIELD) {
        let (name, value): (String, FieldValue) = serde_json::from_slice(arr.get(id))?;
        doc.fields.insert(name, value);
    }
    Ok(doc)
}

impl SummaryAdapter for DocumentStore {
    fn put(&self, serial: SerialNum, lid: Lid, doc: &Document) -> Result<()> {
        let bytes = encode_document(doc)?.serialize(&self.options)?;
        self.lock().insert(lid, bytes);
        self.serials.record_write(serial);
        Ok(())
    }

    fn remove(&self, serial: SerialNum, lid: Lid) -> Result<()> {
        self.lock().remove(&lid);
        self.serials.record_write(serial);
        Ok(())
    }

    fn get(&self, lid: Lid) -> Result<Option<Document>> {
        let bytes = match self.lock().get(&lid) {
            Some(bytes) => bytes.clone(),
            None => return Ok(None),
        };
        let arr = FieldArray::deserialize(&bytes)?;
        decode_document(&arr).map(Some)
    }

    fn move_lid(&self, serial: SerialNum, from: Lid, to: Lid) -> Result<()> {
        let mut docs = self.lock();
        if let Some(bytes) = docs.remove(&from) {
            docs.insert(to, bytes);
        }
        drop(docs);
        self.serials.record_write(serial);
        Ok(())
    }

    fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()> {
        let mut docs = self.lock();
        if let Some((&lid, _)) = docs.range(lid_limit..).next() {
            return Err(FeedError::InvalidRequest(format!(
                "document store still holds lid {} above limit {}",
                lid, lid_limit
            )));
        }
        drop(docs);
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
