//! Per-shard message queue with per-bucket locking. A message is handed out
//! only when no other message for its bucket is in flight; messages for the
//! same bucket leave the queue in submission order.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use super::merge::{MergeGuard, MergeTracker};
use super::message::{Command, LockedMessage, Reply};
use crate::error::{FeedError, Result};
use crate::types::BucketId;

struct Queued {
    id: Uuid,
    command: Command,
    reply: oneshot::Sender<Reply>,
    merge: Option<MergeGuard>,
    queued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Queued>,
    locked: HashSet<BucketId>,
    in_flight: usize,
    closed: bool,
}

pub struct FileStorHandler {
    shard: usize,
    state: Mutex<QueueState>,
    changed: Notify,
    merges: MergeTracker,
}

/// Held while a message runs. Dropping it unlocks the bucket.
pub struct BucketLockGuard {
    handler: Arc<FileStorHandler>,
    bucket: Option<BucketId>,
}

impl FileStorHandler {
    pub fn new(shard: usize, merges: MergeTracker) -> Arc<Self> {
        Arc::new(FileStorHandler {
            shard,
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
            merges,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Queue a command. A merge for a bucket that is already merging is
    /// rejected here rather than queued.
    pub fn schedule(&self, command: Command) -> Result<oneshot::Receiver<Reply>> {
        let merge = match &command {
            Command::MergeBucket { bucket, .. } => Some(self.merges.try_start(bucket.id)?),
            _ => None,
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(FeedError::Aborted(format!(
                    "shard {} is shutting down",
                    self.shard
                )));
            }
            state.queue.push_back(Queued {
                id: Uuid::new_v4(),
                command,
                reply: tx,
                merge,
                queued_at: Instant::now(),
            });
        }
        self.changed.notify_waiters();
        Ok(rx)
    }

    /// Next message whose bucket is idle. `None` once closed and drained.
    pub async fn next(self: &Arc<Self>) -> Option<LockedMessage> {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.lock_state();
                let position = state.queue.iter().position(|q| {
                    q.command
                        .bucket()
                        .map(|b| !state.locked.contains(&b.id))
                        .unwrap_or(true)
                });
                if let Some(queued) = position.and_then(|p| state.queue.remove(p)) {
                    let bucket = queued.command.bucket().map(|b| b.id);
                    if let Some(b) = bucket {
                        state.locked.insert(b);
                    }
                    state.in_flight += 1;
                    return Some(LockedMessage {
                        id: queued.id,
                        command: queued.command,
                        reply: queued.reply,
                        lock: BucketLockGuard {
                            handler: Arc::clone(self),
                            bucket,
                        },
                        merge: queued.merge,
                        queued_at: queued.queued_at,
                    });
                }
                if state.closed && state.queue.is_empty() {
                    return None;
                }
            }
            changed.await;
        }
    }

    fn unlock(&self, bucket: Option<BucketId>) {
        {
            let mut state = self.lock_state();
            if let Some(b) = bucket {
                state.locked.remove(&b);
            }
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    pub fn is_locked(&self, bucket: &BucketId) -> bool {
        self.lock_state().locked.contains(bucket)
    }

    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Wait until nothing is queued or in flight.
    pub async fn flush(&self) {
        loop {
            let changed = self.changed.notified();
            {
                let state = self.lock_state();
                if state.queue.is_empty() && state.in_flight == 0 {
                    return;
                }
            }
            changed.await;
        }
    }

    /// Stop accepting commands. Queued ones are still handed out.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.changed.notify_waiters();
    }
}

impl Drop for BucketLockGuard {
    fn drop(&mut self) {
        self.handler.unlock(self.bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::provider::Bucket;
    use std::time::Duration;

    fn info(raw: u64) -> Command {
        Command::ReadBucketInfo {
            bucket: Bucket::new(BucketId::new(16, raw), 0),
        }
    }

    #[tokio::test]
    async fn same_bucket_waits_for_lock() {
        let handler = FileStorHandler::new(0, MergeTracker::new());
        let _a = handler.schedule(info(1)).unwrap();
        let _b = handler.schedule(info(1)).unwrap();
        let _c = handler.schedule(info(2)).unwrap();

        let first = handler.next().await.unwrap();
        assert!(handler.is_locked(&BucketId::new(16, 1)));
        // Bucket 1 is busy, so the bucket 2 message is next.
        let second = handler.next().await.unwrap();
        assert_eq!(second.command.bucket().unwrap().id, BucketId::new(16, 2));

        let pending = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.next().await.map(|m| m.command.name()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        drop(first);
        let name = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, Some("read_bucket_info"));
        drop(second);
    }

    #[tokio::test]
    async fn flush_waits_for_in_flight() {
        let handler = FileStorHandler::new(0, MergeTracker::new());
        let _rx = handler.schedule(info(1)).unwrap();
        let msg = handler.next().await.unwrap();
        let flushed = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flushed.is_finished());
        drop(msg);
        tokio::time::timeout(Duration::from_secs(1), flushed)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_drains() {
        let handler = FileStorHandler::new(0, MergeTracker::new());
        let _rx = handler.schedule(info(1)).unwrap();
        handler.close();
        assert!(matches!(
            handler.schedule(info(2)),
            Err(FeedError::Aborted(_))
        ));
        assert!(handler.next().await.is_some());
        assert!(handler.next().await.is_none());
    }
}
