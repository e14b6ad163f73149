use std::collections::BTreeMap;
use std::sync::RwLock;

use super::schema::DocSchema;
use super::{AttributeWriter, StoreSerials};
use crate::error::{FeedError, Result};
use crate::types::{Document, FieldUpdate, FieldValue, Lid, SerialNum};

/// Column-per-field attribute store holding only the schema's attribute fields.
pub struct AttributeStore {
    schema: DocSchema,
    columns: RwLock<BTreeMap<String, BTreeMap<Lid, FieldValue>>>,
    committed: std::sync::atomic::AtomicU64,
    serials: StoreSerials,
}

impl AttributeStore {
    pub fn new(schema: DocSchema, flushed_serial: SerialNum) -> Self {
        let columns = schema
            .attributes
            .iter()
            .map(|name| (name.clone(), BTreeMap::new()))
            .collect();
        AttributeStore {
            schema,
            columns: RwLock::new(columns),
            committed: std::sync::atomic::AtomicU64::new(flushed_serial),
            serials: StoreSerials::new(flushed_serial),
        }
    }

    pub fn committed_serial(&self) -> SerialNum {
        self.committed.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn flush(&self) -> SerialNum {
        self.serials.flush()
    }

    fn write_columns(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, BTreeMap<Lid, FieldValue>>> {
        self.columns.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl AttributeWriter for AttributeStore {
    fn put(&self, serial: SerialNum, lid: Lid, doc: &Document) -> Result<()> {
        let mut columns = self.write_columns();
        for (name, column) in columns.iter_mut() {
            match doc.get(name) {
                Some(value) => {
                    column.insert(lid, value.clone());
                }
                None => {
                    column.remove(&lid);
                }
            }
        }
        drop(columns);
        self.serials.record_write(serial);
        Ok(())
    }

    fn update(&self, serial: SerialNum, lid: Lid, updates: &[FieldUpdate]) -> Result<()> {
        let mut columns = self.write_columns();
        // Compute every new value before touching a column so a failing
        // increment leaves the lid unchanged.
        let mut staged: Vec<(String, Option<FieldValue>)> = Vec::new();
        for update in updates.iter().filter(|u| self.schema.is_attribute(u.field())) {
            let column = columns.get(update.field()).ok_or_else(|| {
                FeedError::BackendFailure(format!("no attribute column '{}'", update.field()))
            })?;
            let current = staged
                .iter()
                .rev()
                .find(|(name, _)| name == update.field())
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| column.get(&lid).cloned());
            staged.push((update.field().to_string(), update.apply(current.as_ref())?));
        }
        for (name, value) in staged {
            if let Some(column) = columns.get_mut(&name) {
                match value {
                    Some(v) => {
                        column.insert(lid, v);
                    }
                    None => {
                        column.remove(&lid);
                    }
                }
            }
        }
        drop(columns);
        self.serials.record_write(serial);
        Ok(())
    }

    fn remove(&self, serial: SerialNum, lid: Lid) -> Result<()> {
        for column in self.write_columns().values_mut() {
            column.remove(&lid);
        }
        self.serials.record_write(serial);
        Ok(())
    }

    fn get(&self, lid: Lid) -> BTreeMap<String, FieldValue> {
        let columns = self.columns.read().unwrap_or_else(|e| e.into_inner());
        columns
            .iter()
            .filter_map(|(name, column)| column.get(&lid).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    fn move_lid(&self, serial: SerialNum, from: Lid, to: Lid) -> Result<()> {
        for column in self.write_columns().values_mut() {
            if let Some(value) = column.remove(&from) {
                column.insert(to, value);
            }
        }
        self.serials.record_write(serial);
        Ok(())
    }

    fn commit(&self, serial: SerialNum) -> Result<()> {
        self.committed
            .fetch_max(serial, std::sync::atomic::Ordering::AcqRel);
        self.serials.observe(serial);
        Ok(())
    }

    fn compact_lid_space(&self, serial: SerialNum, lid_limit: Lid) -> Result<()> {
        let columns = self.columns.read().unwrap_or_else(|e| e.into_inner());
        for (name, column) in columns.iter() {
            if let Some((&lid, _)) = column.range(lid_limit..).next() {
                return Err(FeedError::InvalidRequest(format!(
                    "attribute '{}' still holds lid {} above limit {}",
                    name, lid, lid_limit
                )));
            }
        }
        drop(columns);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;

    fn store() -> AttributeStore {
        AttributeStore::new(DocSchema::builder().attribute("year").attribute("plays").build(), 0)
    }

    fn doc() -> Document {
        Document::new(DocumentId::parse("id:music:song::1").unwrap())
            .with_field("year", FieldValue::Integer(1959))
            .with_field("plays", FieldValue::Integer(10))
            .with_field("title", FieldValue::Text("So What".into()))
    }

    #[test]
    fn put_keeps_only_attribute_fields() {
        let attrs = store();
        attrs.put(1, 1, &doc()).unwrap();
        let values = attrs.get(1);
        assert_eq!(values.len(), 2);
        assert_eq!(values.get("year"), Some(&FieldValue::Integer(1959)));
        assert!(values.get("title").is_none());
    }

    #[test]
    fn update_applies_in_place() {
        let attrs = store();
        attrs.put(1, 1, &doc()).unwrap();
        let updates = vec![
            FieldUpdate::Increment {
                field: "plays".into(),
                delta: 5.0,
            },
            FieldUpdate::Increment {
                field: "plays".into(),
                delta: 1.0,
            },
            FieldUpdate::Assign {
                field: "title".into(),
                value: FieldValue::Text("ignored".into()),
            },
        ];
        attrs.update(2, 1, &updates).unwrap();
        assert_eq!(attrs.get(1).get("plays"), Some(&FieldValue::Integer(16)));
        assert_eq!(attrs.write_count(), 2);
    }

    #[test]
    fn failing_update_changes_nothing() {
        let attrs = AttributeStore::new(
            DocSchema::builder().attribute("year").attribute("label").build(),
            0,
        );
        let d = doc().with_field("label", FieldValue::Text("columbia".into()));
        attrs.put(1, 1, &d).unwrap();
        let updates = vec![
            FieldUpdate::Assign {
                field: "year".into(),
                value: FieldValue::Integer(2000),
            },
            FieldUpdate::Increment {
                field: "label".into(),
                delta: 1.0,
            },
        ];
        assert!(attrs.update(2, 1, &updates).is_err());
        assert_eq!(attrs.get(1).get("year"), Some(&FieldValue::Integer(1959)));
    }

    #[test]
    fn remove_move_and_compact() {
        let attrs = store();
        attrs.put(1, 7, &doc()).unwrap();
        assert!(attrs.compact_lid_space(2, 7).is_err());
        attrs.move_lid(2, 7, 2).unwrap();
        assert!(attrs.get(7).is_empty());
        assert!(attrs.compact_lid_space(3, 3).is_ok());
        attrs.remove(4, 2).unwrap();
        assert!(attrs.get(2).is_empty());
    }

    #[test]
    fn commit_advances_committed_serial() {
        let attrs = store();
        assert_eq!(attrs.committed_serial(), 0);
        attrs.commit(9).unwrap();
        assert_eq!(attrs.committed_serial(), 9);
    }
}
