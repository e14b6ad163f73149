//! Persistence layer: the provider contract, the document database that
//! implements it, and the per-shard threads that apply bucket commands.

pub mod bucket_db;
pub mod documentdb;
pub mod filestor;
pub mod merge;
pub mod message;
pub mod process_all;
pub mod provider;
pub mod thread;
pub mod tracker;

pub use bucket_db::{BucketDatabase, BucketEntryInfo};
pub use documentdb::{
    partition_dir, DocumentDb, DocumentDbConfig, DocumentDbProvider, FlushedSerials, StoreWrites,
    Watermarks,
};
pub use filestor::{BucketLockGuard, FileStorHandler};
pub use merge::{MergeGuard, MergeHandler, MergePeer, MergeTracker};
pub use message::{Command, LockedMessage, MultiOp, Reply, ReplyPayload};
pub use process_all::ProcessAllHandler;
pub use provider::{
    Bucket, BucketEntry, FieldSet, IterateResult, IteratorId, IteratorSpec, MutationResult,
    PartitionId, PersistenceProvider, SplitResult,
};
pub use thread::{validate_join, PersistenceShards, PersistenceThread};
pub use tracker::MessageTracker;
