use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{FeedError, Result};

/// Field ids below this are reserved for document-level entries.
pub const RESERVED_FIELD_ID_UPPER: u32 = 128;
/// Reserved field id holding the document id in a serialized document.
pub const DOC_ID_FIELD: u32 = 1;

/// Which fields of a document type are indexed and which are attributes.
///
/// Fields not listed in either set are stored only in the document store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocSchema {
    pub indexed: BTreeSet<String>,
    pub attributes: BTreeSet<String>,
}

impl DocSchema {
    pub fn builder() -> DocSchemaBuilder {
        DocSchemaBuilder::default()
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexed.contains(field)
    }

    pub fn is_attribute(&self, field: &str) -> bool {
        self.attributes.contains(field)
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.indexed.iter().chain(self.attributes.iter()) {
            if name.is_empty() || name == "id" {
                return Err(FeedError::Config(format!(
                    "invalid schema field name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct DocSchemaBuilder {
    schema: DocSchema,
}

impl DocSchemaBuilder {
    pub fn indexed(mut self, name: &str) -> Self {
        self.schema.indexed.insert(name.to_string());
        self
    }

    pub fn attribute(mut self, name: &str) -> Self {
        self.schema.attributes.insert(name.to_string());
        self
    }

    pub fn build(self) -> DocSchema {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_classifies_fields() {
        let schema = DocSchema::builder()
            .indexed("title")
            .attribute("year")
            .attribute("title")
            .build();
        assert!(schema.is_indexed("title"));
        assert!(schema.is_attribute("title"));
        assert!(schema.is_attribute("year"));
        assert!(!schema.is_indexed("year"));
        assert!(!schema.is_attribute("body"));
    }

    #[test]
    fn reserved_names_rejected() {
        let schema = DocSchema::builder().attribute("id").build();
        assert!(schema.validate().is_err());
        assert!(DocSchema::default().validate().is_ok());
    }
}
