use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::types::Lid;

/// Lids with in-flight writes. Readers of a lid's prior state wait until
/// every token produced for that lid has been dropped.
#[derive(Default)]
pub struct PendingLidTracker {
    pending: DashMap<Lid, usize>,
    consumed: Notify,
}

/// Marks one in-flight write on a lid; dropping it consumes the write.
pub struct PendingLidToken {
    tracker: Arc<PendingLidTracker>,
    lid: Lid,
}

impl PendingLidTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn produce(self: &Arc<Self>, lid: Lid) -> PendingLidToken {
        *self.pending.entry(lid).or_insert(0) += 1;
        PendingLidToken {
            tracker: Arc::clone(self),
            lid,
        }
    }

    fn consume(&self, lid: Lid) {
        if let Entry::Occupied(mut e) = self.pending.entry(lid) {
            *e.get_mut() -= 1;
            if *e.get() == 0 {
                e.remove();
            }
        }
        self.consumed.notify_waiters();
    }

    pub fn is_pending(&self, lid: Lid) -> bool {
        self.pending.contains_key(&lid)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.iter().map(|e| *e.value()).sum()
    }

    pub async fn wait_for_consumed(&self, lid: Lid) {
        loop {
            // Registered before the check, so a consume in between still wakes us.
            let notified = self.consumed.notified();
            if !self.is_pending(lid) {
                return;
            }
            tracing::trace!("[PENDING] waiting for lid {}", lid);
            notified.await;
        }
    }

    pub async fn wait_for_all(&self, lids: &[Lid]) {
        for lid in lids {
            self.wait_for_consumed(*lid).await;
        }
    }
}

impl Drop for PendingLidToken {
    fn drop(&mut self) {
        self.tracker.consume(self.lid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unpending_lid_returns_immediately() {
        let tracker = PendingLidTracker::new();
        tracker.wait_for_consumed(7).await;
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn waits_for_every_token_of_the_lid() {
        let tracker = PendingLidTracker::new();
        let a = tracker.produce(3);
        let b = tracker.produce(3);
        let other = tracker.produce(4);
        assert_eq!(tracker.pending_count(), 3);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_consumed(3).await })
        };
        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once lid 3 is consumed")
            .unwrap();
        assert!(tracker.is_pending(4));
        drop(other);
        assert!(!tracker.is_pending(4));
    }
}
