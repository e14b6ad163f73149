use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::filestor::BucketLockGuard;
use super::merge::MergeGuard;
use super::message::{Command, LockedMessage, Reply, ReplyPayload};
use crate::error::{FeedError, Result, ResultCode};

/// Owns a running message's reply channel and locks. Consumed by
/// [`MessageTracker::finish`], which replies before releasing the bucket;
/// a tracker dropped unfinished replies `Aborted`.
pub struct MessageTracker {
    id: Uuid,
    command: &'static str,
    reply: Option<oneshot::Sender<Reply>>,
    lock: Option<BucketLockGuard>,
    merge: Option<MergeGuard>,
    queued_at: Instant,
    started: Instant,
}

impl MessageTracker {
    /// Split a locked message into its command and a tracker.
    pub fn start(msg: LockedMessage) -> (Command, Self) {
        let tracker = MessageTracker {
            id: msg.id,
            command: msg.command.name(),
            reply: Some(msg.reply),
            lock: Some(msg.lock),
            merge: msg.merge,
            queued_at: msg.queued_at,
            started: Instant::now(),
        };
        (msg.command, tracker)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    /// Time spent waiting in the queue before the message was picked up.
    pub fn queue_time(&self) -> Duration {
        self.started.saturating_duration_since(self.queued_at)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Send the reply, then release the bucket. Returns the reply's code.
    pub fn finish(mut self, result: Result<ReplyPayload>) -> ResultCode {
        let reply = match result {
            Ok(payload) => Reply::ok(payload),
            Err(e) => Reply::from_error(&e),
        };
        let code = reply.code;
        self.send(reply);
        self.lock.take();
        self.merge.take();
        code
    }

    fn send(&mut self, reply: Reply) {
        if let Some(tx) = self.reply.take() {
            if tx.send(reply).is_err() {
                tracing::debug!("[MSG {}] {} caller went away", self.id, self.command);
            }
        }
    }
}

impl Drop for MessageTracker {
    fn drop(&mut self) {
        if self.reply.is_some() {
            let err = FeedError::Aborted(format!("{} dropped without reply", self.command));
            tracing::warn!("[MSG {}] {}", self.id, err);
            self.send(Reply::from_error(&err));
        }
        self.lock.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::filestor::FileStorHandler;
    use crate::persistence::merge::MergeTracker;
    use crate::persistence::provider::Bucket;
    use crate::types::BucketId;

    async fn locked(
        handler: &std::sync::Arc<FileStorHandler>,
    ) -> (LockedMessage, oneshot::Receiver<Reply>) {
        let rx = handler
            .schedule(Command::ReadBucketInfo {
                bucket: Bucket::new(BucketId::new(16, 1), 0),
            })
            .unwrap();
        (handler.next().await.unwrap(), rx)
    }

    #[tokio::test]
    async fn reply_precedes_unlock() {
        let handler = FileStorHandler::new(0, MergeTracker::new());
        let (msg, mut rx) = locked(&handler).await;
        let (_, tracker) = MessageTracker::start(msg);
        assert!(handler.is_locked(&BucketId::new(16, 1)));
        let code = tracker.finish(Ok(ReplyPayload::None));
        assert_eq!(code, ResultCode::Ok);
        assert!(rx.try_recv().unwrap().is_success());
        assert!(!handler.is_locked(&BucketId::new(16, 1)));
    }

    #[tokio::test]
    async fn dropped_tracker_replies_aborted() {
        let handler = FileStorHandler::new(0, MergeTracker::new());
        let (msg, rx) = locked(&handler).await;
        let (_, tracker) = MessageTracker::start(msg);
        drop(tracker);
        assert_eq!(rx.await.unwrap().code, ResultCode::Aborted);
        assert!(!handler.is_locked(&BucketId::new(16, 1)));
    }
}
