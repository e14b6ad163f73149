//! Compact field-id → bytes container used as the document store's payload.
//!
//! A deserialized array keeps one shared backing buffer and its entries point
//! into it by offset; values set afterwards are owned by the entry itself. The
//! last serialized form is cached until the array is modified.

use std::sync::Arc;

use crate::error::{FeedError, Result};
use crate::metrics::{SerializationMetrics, SerializationOutcome};

const MAGIC: u8 = b'F';
const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_DEFLATE: u8 = 1;
const HEADER_LEN: usize = 6;
const ENTRY_LEN: usize = 8;

#[derive(Debug, Clone)]
enum EntryData {
    /// Range inside the array's backing buffer.
    Offset { offset: u32, len: u32 },
    Owned(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    id: u32,
    data: EntryData,
}

/// Options for [`FieldArray::serialize`].
#[derive(Clone, Default)]
pub struct SerializeOptions {
    /// Bodies larger than this are compressed when that makes them smaller. 0 disables compression.
    pub compression_threshold: usize,
    pub metrics: Option<SerializationMetrics>,
}

impl SerializeOptions {
    fn record(&self, outcome: SerializationOutcome) {
        if let Some(ref metrics) = self.metrics {
            metrics.record(outcome);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldArray {
    entries: Vec<Entry>,
    backing: Option<Arc<[u8]>>,
    cached: Option<Vec<u8>>,
}

impl FieldArray {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, id: u32) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&id, |e| e.id)
    }

    pub fn set(&mut self, id: u32, value: &[u8]) {
        self.cached = None;
        let entry = Entry {
            id,
            data: EntryData::Owned(value.to_vec()),
        };
        match self.position(id) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    /// Value for `id`, or an empty slice when absent.
    pub fn get(&self, id: u32) -> &[u8] {
        match self.position(id) {
            Ok(pos) => self.entry_bytes(&self.entries[pos]),
            Err(_) => &[],
        }
    }

    fn entry_bytes<'a>(&'a self, entry: &'a Entry) -> &'a [u8] {
        match &entry.data {
            EntryData::Owned(bytes) => bytes,
            EntryData::Offset { offset, len } => match self.backing {
                Some(ref buf) => {
                    let start = *offset as usize;
                    &buf[start..start + *len as usize]
                }
                None => &[],
            },
        }
    }

    pub fn has(&self, id: u32) -> bool {
        self.position(id).is_ok()
    }

    pub fn clear(&mut self, id: u32) {
        if let Ok(pos) = self.position(id) {
            self.entries.remove(pos);
            self.cached = None;
        }
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.backing = None;
        self.cached = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn serialize(&mut self, opts: &SerializeOptions) -> Result<Vec<u8>> {
        if let Some(ref cached) = self.cached {
            opts.record(SerializationOutcome::UsedCached);
            return Ok(cached.clone());
        }
        let body = self.encode_body();
        let (compression, payload) = if opts.compression_threshold > 0
            && body.len() > opts.compression_threshold
        {
            match compress(&body)? {
                Some(compressed) if compressed.len() < body.len() => {
                    opts.record(SerializationOutcome::Compressed);
                    (COMPRESSION_DEFLATE, compressed)
                }
                _ => {
                    opts.record(SerializationOutcome::CompressionDidntHelp);
                    (COMPRESSION_NONE, body.clone())
                }
            }
        } else {
            opts.record(SerializationOutcome::Uncompressed);
            (COMPRESSION_NONE, body.clone())
        };

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(MAGIC);
        out.push(compression);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        self.cached = Some(out.clone());
        Ok(out)
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            body.extend_from_slice(&entry.id.to_le_bytes());
            body.extend_from_slice(&(self.entry_bytes(entry).len() as u32).to_le_bytes());
        }
        for entry in &self.entries {
            body.extend_from_slice(self.entry_bytes(entry));
        }
        body
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || bytes[0] != MAGIC {
            return Err(FeedError::Compression(
                "not a serialized field array".to_string(),
            ));
        }
        let uncompressed_len = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        let body: Vec<u8> = match bytes[1] {
            COMPRESSION_NONE => bytes[HEADER_LEN..].to_vec(),
            COMPRESSION_DEFLATE => decompress(&bytes[HEADER_LEN..], uncompressed_len)?,
            other => {
                return Err(FeedError::Compression(format!(
                    "unknown compression type {}",
                    other
                )))
            }
        };
        if body.len() != uncompressed_len {
            return Err(FeedError::Compression(format!(
                "body length {} does not match header {}",
                body.len(),
                uncompressed_len
            )));
        }

        let read_u32 = |at: usize| -> Result<u32> {
            body.get(at..at + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| FeedError::Compression("truncated field array".to_string()))
        };
        let truncated = || FeedError::Compression("truncated field array".to_string());
        let count = read_u32(0)? as usize;
        if count > body.len().saturating_sub(4) / ENTRY_LEN {
            return Err(FeedError::Compression(format!(
                "entry count {} does not fit a {} byte body",
                count,
                body.len()
            )));
        }
        let table_end = 4 + count * ENTRY_LEN;
        let mut entries = Vec::with_capacity(count);
        let mut offset = table_end;
        for i in 0..count {
            let id = read_u32(4 + i * ENTRY_LEN)?;
            let len = read_u32(8 + i * ENTRY_LEN)?;
            let end = offset.checked_add(len as usize).ok_or_else(truncated)?;
            if end > body.len() {
                return Err(truncated());
            }
            entries.push(Entry {
                id,
                data: EntryData::Offset {
                    offset: u32::try_from(offset).map_err(|_| truncated())?,
                    len,
                },
            });
            offset = end;
        }
        if offset != body.len() {
            return Err(FeedError::Compression(
                "field array payload length mismatch".to_string(),
            ));
        }
        entries.sort_by_key(|e| e.id);
        if let Some(pair) = entries.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(FeedError::Compression(format!(
                "duplicate field id {}",
                pair[0].id
            )));
        }

        Ok(FieldArray {
            entries,
            backing: Some(Arc::from(body.into_boxed_slice())),
            cached: Some(bytes.to_vec()),
        })
    }
}

#[cfg(feature = "compression")]
fn compress(body: &[u8]) -> Result<Option<Vec<u8>>> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(body)
        .map_err(|e| FeedError::Compression(e.to_string()))?;
    let out = encoder
        .finish()
        .map_err(|e| FeedError::Compression(e.to_string()))?;
    Ok(Some(out))
}

#[cfg(not(feature = "compression"))]
fn compress(_body: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(None)
}

#[cfg(feature = "compression")]
fn decompress(payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    let mut out = Vec::new();
    // One byte past the expected length is enough to detect a mismatch.
    DeflateDecoder::new(payload)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| FeedError::Compression(e.to_string()))?;
    Ok(out)
}

#[cfg(not(feature = "compression"))]
fn decompress(_payload: &[u8], _expected_len: usize) -> Result<Vec<u8>> {
    Err(FeedError::Compression(
        "built without compression support".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    #[test]
    fn get_missing_is_empty() {
        let arr = FieldArray::new();
        assert!(arr.get(200).is_empty());
        assert!(!arr.has(200));
    }

    #[test]
    fn set_overwrites_and_clear_removes() {
        let mut arr = FieldArray::new();
        arr.set(300, b"one");
        arr.set(200, b"two");
        arr.set(300, b"three");
        assert_eq!(arr.get(300), b"three");
        assert_eq!(arr.ids().collect::<Vec<_>>(), vec![200, 300]);
        arr.clear(200);
        assert!(!arr.has(200));
        assert_eq!(arr.ids().count(), 1);
    }

    #[test]
    fn deserialized_entries_borrow_backing_until_overwritten() {
        let mut arr = FieldArray::new();
        arr.set(130, b"alpha");
        arr.set(140, b"beta");
        let bytes = arr.serialize(&SerializeOptions::default()).unwrap();

        let mut copy = FieldArray::deserialize(&bytes).unwrap();
        assert_eq!(copy.get(130), b"alpha");
        assert_eq!(copy.get(140), b"beta");
        copy.set(140, b"gamma");
        assert_eq!(copy.get(140), b"gamma");
        assert_eq!(copy.get(130), b"alpha");
    }

    #[test]
    fn unchanged_array_reuses_cached_serialization() {
        let metrics = MetricsRegistry::new().unwrap();
        let opts = SerializeOptions {
            compression_threshold: 0,
            metrics: Some(metrics.serialization.clone()),
        };
        let mut arr = FieldArray::new();
        arr.set(150, b"x");
        let first = arr.serialize(&opts).unwrap();
        let second = arr.serialize(&opts).unwrap();
        assert_eq!(first, second);
        assert_eq!(metrics.serialization.count(SerializationOutcome::Uncompressed), 1);
        assert_eq!(metrics.serialization.count(SerializationOutcome::UsedCached), 1);

        arr.set(150, b"y");
        arr.serialize(&opts).unwrap();
        assert_eq!(metrics.serialization.count(SerializationOutcome::Uncompressed), 2);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn large_repetitive_payload_is_compressed() {
        let metrics = MetricsRegistry::new().unwrap();
        let opts = SerializeOptions {
            compression_threshold: 64,
            metrics: Some(metrics.serialization.clone()),
        };
        let mut arr = FieldArray::new();
        let value = vec![b'a'; 4096];
        arr.set(200, &value);
        let bytes = arr.serialize(&opts).unwrap();
        assert!(bytes.len() < 4096);
        assert_eq!(bytes[1], COMPRESSION_DEFLATE);
        assert_eq!(metrics.serialization.count(SerializationOutcome::Compressed), 1);

        let back = FieldArray::deserialize(&bytes).unwrap();
        assert_eq!(back.get(200), value.as_slice());
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(FieldArray::deserialize(b"").is_err());
        assert!(FieldArray::deserialize(b"Xjunkjunk").is_err());
        // Header claims one entry but the body is truncated.
        let mut bytes = vec![MAGIC, COMPRESSION_NONE];
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&130u32.to_le_bytes());
        assert!(FieldArray::deserialize(&bytes).is_err());
    }

    fn raw(body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![MAGIC, COMPRESSION_NONE];
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn deserialize_rejects_oversized_count() {
        let err = FieldArray::deserialize(&raw(&u32::MAX.to_le_bytes())).unwrap_err();
        assert!(matches!(err, FeedError::Compression(_)));
    }

    #[test]
    fn deserialize_rejects_entry_past_end() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&130u32.to_le_bytes());
        body.extend_from_slice(&u32::MAX.to_le_bytes());
        body.extend_from_slice(b"abc");
        assert!(matches!(
            FieldArray::deserialize(&raw(&body)),
            Err(FeedError::Compression(_))
        ));
    }

    #[test]
    fn deserialize_rejects_duplicate_ids() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..2 {
            body.extend_from_slice(&130u32.to_le_bytes());
            body.extend_from_slice(&1u32.to_le_bytes());
        }
        body.extend_from_slice(b"ab");
        assert!(matches!(
            FieldArray::deserialize(&raw(&body)),
            Err(FeedError::Compression(_))
        ));
    }
}
