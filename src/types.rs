use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FeedError, Result};

/// Position in the durability log.
pub type SerialNum = u64;
/// Local document id: dense slot key inside one document database. Lid 0 is never handed out.
pub type Lid = u32;
/// Document version assigned by the caller of the persistence layer (microseconds).
pub type Timestamp = u64;

/// Maximum number of bits a bucket id can use.
pub const MAX_USED_BITS: u8 = 58;

/// Parsed document identifier of the form `id:<namespace>:<doctype>:<key-values>:<local>`.
///
/// The key-values part may carry `n=<number>` or `g=<group>`, which pins the
/// document's bucket location; otherwise the location is hashed from the whole id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId {
    raw: String,
    namespace_end: usize,
    doctype_end: usize,
    key_values_end: usize,
}

impl DocumentId {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix("id:")
            .ok_or_else(|| FeedError::InvalidRequest(format!("document id must start with 'id:': {}", raw)))?;
        let parts: Vec<&str> = rest.splitn(4, ':').collect();
        if parts.len() != 4 {
            return Err(FeedError::InvalidRequest(format!(
                "document id needs namespace, type, key-values and local part: {}",
                raw
            )));
        }
        if parts[0].is_empty() || parts[1].is_empty() || parts[3].is_empty() {
            return Err(FeedError::InvalidRequest(format!(
                "empty component in document id: {}",
                raw
            )));
        }
        let namespace_end = 3 + parts[0].len();
        let doctype_end = namespace_end + 1 + parts[1].len();
        let key_values_end = doctype_end + 1 + parts[2].len();
        let id = DocumentId {
            raw: raw.to_string(),
            namespace_end,
            doctype_end,
            key_values_end,
        };
        // Reject unparsable n= values up front rather than at bucket resolution.
        if let Some(n) = id.key_value("n") {
            n.parse::<u64>().map_err(|_| {
                FeedError::InvalidRequest(format!("n= must be numeric in document id: {}", raw))
            })?;
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn namespace(&self) -> &str {
        &self.raw[3..self.namespace_end]
    }

    pub fn doc_type(&self) -> &str {
        &self.raw[self.namespace_end + 1..self.doctype_end]
    }

    pub fn local(&self) -> &str {
        &self.raw[self.key_values_end + 1..]
    }

    fn key_value(&self, key: &str) -> Option<&str> {
        let kv = &self.raw[self.doctype_end + 1..self.key_values_end];
        kv.split(',').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// 32-bit location used for the low bits of the document's bucket.
    pub fn location(&self) -> u32 {
        if let Some(n) = self.key_value("n").and_then(|v| v.parse::<u64>().ok()) {
            return n as u32;
        }
        if let Some(group) = self.key_value("g") {
            return hash_prefix(group.as_bytes());
        }
        hash_prefix(self.raw.as_bytes())
    }

    pub fn global_id(&self) -> GlobalId {
        let digest = Sha256::digest(self.raw.as_bytes());
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&self.location().to_le_bytes());
        bytes[4..].copy_from_slice(&digest[..8]);
        GlobalId(bytes)
    }

    /// The most specific bucket this document can live in.
    pub fn bucket(&self) -> BucketId {
        self.global_id().bucket()
    }
}

impl TryFrom<String> for DocumentId {
    type Error = FeedError;

    fn try_from(raw: String) -> Result<Self> {
        DocumentId::parse(&raw)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.raw
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn hash_prefix(bytes: &[u8]) -> u32 {
    let digest = Sha256::digest(bytes);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Location-independent 12-byte document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub [u8; 12]);

impl GlobalId {
    pub fn location(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn bucket(&self) -> BucketId {
        let high = u32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]) as u64;
        BucketId::new(MAX_USED_BITS, (high << 32) | self.location() as u64)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid(0x{})", hex::encode(self.0))
    }
}

/// A bucket: the `used_bits` low bits of `raw` identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId {
    used_bits: u8,
    raw: u64,
}

impl BucketId {
    pub fn new(used_bits: u8, raw: u64) -> Self {
        let used_bits = used_bits.min(MAX_USED_BITS);
        BucketId {
            used_bits,
            raw: raw & Self::mask(used_bits),
        }
    }

    fn mask(used_bits: u8) -> u64 {
        if used_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << used_bits) - 1
        }
    }

    pub fn used_bits(&self) -> u8 {
        self.used_bits
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn is_valid(&self) -> bool {
        self.used_bits >= 1 && self.used_bits <= MAX_USED_BITS
    }

    /// Combined key with the used-bit count in the top six bits.
    pub fn key(&self) -> u64 {
        ((self.used_bits as u64) << MAX_USED_BITS) | self.raw
    }

    pub fn contains(&self, other: &BucketId) -> bool {
        other.used_bits >= self.used_bits && (other.raw & Self::mask(self.used_bits)) == self.raw
    }

    pub fn contains_document(&self, id: &DocumentId) -> bool {
        self.contains(&id.bucket())
    }

    /// The two buckets one bit deeper, or `None` when already at the bit limit.
    pub fn split(&self) -> Option<(BucketId, BucketId)> {
        if self.used_bits >= MAX_USED_BITS {
            return None;
        }
        let bits = self.used_bits + 1;
        Some((
            BucketId::new(bits, self.raw),
            BucketId::new(bits, self.raw | (1u64 << self.used_bits)),
        ))
    }

    pub fn parent(&self) -> Option<BucketId> {
        (self.used_bits > 1).then(|| BucketId::new(self.used_bits - 1, self.raw))
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.key())
    }
}

/// A dynamically-typed field value stored in a [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Array(Vec<FieldValue>),
    Text(String),
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// A document with an id and a set of named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        Document {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Approximate stored size: id plus serialized field values.
    pub fn serialized_size(&self) -> u64 {
        let fields = serde_json::to_vec(&self.fields).map(|v| v.len()).unwrap_or(0);
        (self.id.as_str().len() + fields) as u64
    }
}

/// A single field change carried by a [`DocumentUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldUpdate {
    Assign { field: String, value: FieldValue },
    Clear { field: String },
    Increment { field: String, delta: f64 },
}

impl FieldUpdate {
    pub fn field(&self) -> &str {
        match self {
            FieldUpdate::Assign { field, .. }
            | FieldUpdate::Clear { field }
            | FieldUpdate::Increment { field, .. } => field,
        }
    }

    /// Compute the new value from the current one. `None` means the field is cleared.
    pub fn apply(&self, current: Option<&FieldValue>) -> Result<Option<FieldValue>> {
        match self {
            FieldUpdate::Assign { value, .. } => Ok(Some(value.clone())),
            FieldUpdate::Clear { .. } => Ok(None),
            FieldUpdate::Increment { field, delta } => match current {
                None => Ok(None),
                Some(FieldValue::Integer(i)) => Ok(Some(FieldValue::Integer(i + *delta as i64))),
                Some(FieldValue::Float(f)) => Ok(Some(FieldValue::Float(f + delta))),
                Some(other) => Err(FeedError::InvalidRequest(format!(
                    "cannot increment non-numeric field '{}' ({:?})",
                    field, other
                ))),
            },
        }
    }
}

/// A partial document update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub id: DocumentId,
    pub updates: Vec<FieldUpdate>,
    #[serde(default)]
    pub create_if_missing: bool,
}

impl DocumentUpdate {
    pub fn new(id: DocumentId) -> Self {
        DocumentUpdate {
            id,
            updates: Vec::new(),
            create_if_missing: false,
        }
    }

    pub fn assign(mut self, field: &str, value: FieldValue) -> Self {
        self.updates.push(FieldUpdate::Assign {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn increment(mut self, field: &str, delta: f64) -> Self {
        self.updates.push(FieldUpdate::Increment {
            field: field.to_string(),
            delta,
        });
        self
    }

    pub fn clear(mut self, field: &str) -> Self {
        self.updates.push(FieldUpdate::Clear {
            field: field.to_string(),
        });
        self
    }

    pub fn apply_to(&self, doc: &mut Document) -> Result<()> {
        for update in &self.updates {
            match update.apply(doc.fields.get(update.field()))? {
                Some(value) => {
                    doc.fields.insert(update.field().to_string(), value);
                }
                None => {
                    doc.fields.remove(update.field());
                }
            }
        }
        Ok(())
    }
}

/// Checksum/count/size summary of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub checksum: u32,
    pub doc_count: u32,
    pub total_size: u64,
    /// Live documents plus tombstones.
    pub entry_count: u32,
    pub ready: bool,
    pub active: bool,
}

impl BucketInfo {
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}

impl fmt::Display for BucketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BucketInfo(crc 0x{:08x}, docs {}, size {}, entries {}{}{})",
            self.checksum,
            self.doc_count,
            self.total_size,
            self.entry_count,
            if self.ready { ", ready" } else { "" },
            if self.active { ", active" } else { "" }
        )
    }
}

/// Per-entry contribution to a bucket checksum. XOR-combined so removal undoes addition.
pub fn entry_checksum(gid: &GlobalId, timestamp: Timestamp) -> u32 {
    let g = &gid.0;
    let a = u32::from_le_bytes([g[0], g[1], g[2], g[3]]);
    let b = u32::from_le_bytes([g[4], g[5], g[6], g[7]]).rotate_left(7);
    let c = u32::from_le_bytes([g[8], g[9], g[10], g[11]]).rotate_left(13);
    a ^ b ^ c ^ (timestamp as u32) ^ ((timestamp >> 32) as u32).rotate_left(17)
}
