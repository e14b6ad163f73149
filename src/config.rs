use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FeedError, Result};
use crate::store::schema::DocSchema;

/// Node-level settings for the feed view and the persistence shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub node_id: String,
    /// Number of persistence shards (one worker task and one partition each).
    pub shards: usize,
    /// Non-zero enables early acknowledgement of feed operations before commit.
    pub visibility_delay_ms: u64,
    /// Operations slower than this are counted and logged, never failed.
    pub warn_on_slow_operations_ms: u64,
    /// Serialized documents above this many bytes are considered for compression.
    pub compression_threshold: usize,
    pub iterator_max_bytes: usize,
    pub doc_type: String,
    pub schema: DocSchema,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            node_id: default_node_id(),
            shards: 2,
            visibility_delay_ms: 0,
            warn_on_slow_operations_ms: 5000,
            compression_threshold: 4096,
            iterator_max_bytes: 1024 * 1024,
            doc_type: "document".to_string(),
            schema: DocSchema::default(),
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

impl StorageConfig {
    /// Load `{data_dir}/storage.json` when present, fall back to defaults, then apply
    /// `BUCKETFEED_*` environment overrides.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join("storage.json");
        let mut config = if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    tracing::info!(
                        "Loaded storage config: node_id={}, shards={}",
                        config.node_id,
                        config.shards
                    );
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to load {}: {}, using defaults", path.display(), e);
                    StorageConfig::default()
                }
            }
        } else {
            tracing::info!("No storage.json found, using defaults");
            StorageConfig::default()
        };
        config.apply_env_overrides();
        config
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StorageConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("BUCKETFEED_NODE_ID") {
            if !node_id.trim().is_empty() {
                self.node_id = node_id;
            }
        }
        if let Some(v) = env_parse("BUCKETFEED_SHARDS") {
            self.shards = v;
        }
        if let Some(v) = env_parse("BUCKETFEED_VISIBILITY_DELAY_MS") {
            self.visibility_delay_ms = v;
        }
        if let Some(v) = env_parse("BUCKETFEED_SLOW_OP_MS") {
            self.warn_on_slow_operations_ms = v;
        }
        if let Some(v) = env_parse("BUCKETFEED_COMPRESSION_THRESHOLD") {
            self.compression_threshold = v;
        }
        if let Some(v) = env_parse("BUCKETFEED_ITERATOR_MAX_BYTES") {
            self.iterator_max_bytes = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(FeedError::Config("shards must be at least 1".to_string()));
        }
        if self.iterator_max_bytes == 0 {
            return Err(FeedError::Config(
                "iterator_max_bytes must be positive".to_string(),
            ));
        }
        self.schema.validate()
    }

    pub fn visibility_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_delay_ms)
    }

    pub fn slow_operation_threshold(&self) -> Duration {
        Duration::from_millis(self.warn_on_slow_operations_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for key in [
            "BUCKETFEED_NODE_ID",
            "BUCKETFEED_SHARDS",
            "BUCKETFEED_VISIBILITY_DELAY_MS",
            "BUCKETFEED_SLOW_OP_MS",
            "BUCKETFEED_COMPRESSION_THRESHOLD",
            "BUCKETFEED_ITERATOR_MAX_BYTES",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::load_or_default(dir.path());
        assert_eq!(config.shards, 2);
        assert_eq!(config.visibility_delay_ms, 0);
        assert_eq!(config.warn_on_slow_operations_ms, 5000);
        assert!(!config.node_id.is_empty());
    }

    #[test]
    #[serial]
    fn loads_file_with_partial_fields() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("storage.json")).unwrap();
        file.write_all(
            br#"{
                "node_id": "storage-0",
                "shards": 4,
                "visibility_delay_ms": 250,
                "schema": {"indexed": ["title"], "attributes": ["year"]}
            }"#,
        )
        .unwrap();

        let config = StorageConfig::load_or_default(dir.path());
        assert_eq!(config.node_id, "storage-0");
        assert_eq!(config.shards, 4);
        assert_eq!(config.visibility_delay(), Duration::from_millis(250));
        assert!(config.schema.is_indexed("title"));
        assert!(config.schema.is_attribute("year"));
        // Unset fields keep their defaults.
        assert_eq!(config.iterator_max_bytes, 1024 * 1024);
    }

    #[test]
    #[serial]
    fn invalid_file_falls_back_to_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("storage.json"), "{ not json").unwrap();
        let config = StorageConfig::load_or_default(dir.path());
        assert_eq!(config.shards, 2);
    }

    #[test]
    #[serial]
    fn zero_shards_rejected_by_load() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{"shards": 0}"#).unwrap();
        assert!(matches!(
            StorageConfig::load(&path),
            Err(FeedError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn env_overrides_file_values() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("storage.json"), r#"{"shards": 3}"#).unwrap();
        std::env::set_var("BUCKETFEED_SHARDS", "8");
        std::env::set_var("BUCKETFEED_SLOW_OP_MS", "10");
        std::env::set_var("BUCKETFEED_NODE_ID", "node-b");
        let config = StorageConfig::load_or_default(dir.path());
        clear_env();
        assert_eq!(config.shards, 8);
        assert_eq!(config.slow_operation_threshold(), Duration::from_millis(10));
        assert_eq!(config.node_id, "node-b");
    }

    #[test]
    #[serial]
    fn unparsable_env_value_is_ignored() {
        clear_env();
        std::env::set_var("BUCKETFEED_VISIBILITY_DELAY_MS", "soon");
        let mut config = StorageConfig::default();
        config.apply_env_overrides();
        clear_env();
        assert_eq!(config.visibility_delay_ms, 0);
    }
}
