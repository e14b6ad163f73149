pub mod condition;
pub mod config;
pub mod error;
pub mod feed;
pub mod fields;
pub mod metrics;
pub mod persistence;
pub mod store;
pub mod types;

pub use config::StorageConfig;
pub use error::{FeedError, Result, ResultCode};
pub use feed::{FeedOperation, FeedView};
pub use metrics::MetricsRegistry;
pub use persistence::{Command, DocumentDbProvider, PersistenceShards, Reply, ReplyPayload};
pub use types::{BucketId, BucketInfo, Document, DocumentId, DocumentUpdate, FieldValue};
