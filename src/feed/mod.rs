//! Feed pipeline: logical operations, the view that fans them out to the
//! stores, and the bookkeeping that ties the sub-writes back together.

pub mod commit;
pub mod completion;
pub mod executor;
pub mod operation;
pub mod oplog;
pub mod pending_lid;
pub mod view;

pub use commit::{CommitTimeTracker, LidReuseDelayer};
pub use completion::{CompletionContext, FeedToken, SubWrite};
pub use executor::{Executor, WriteService};
pub use operation::FeedOperation;
pub use oplog::OpLog;
pub use pending_lid::{PendingLidToken, PendingLidTracker};
pub use view::{FeedStores, FeedView, PersistentParams, SubDbType, UpdateScope};
