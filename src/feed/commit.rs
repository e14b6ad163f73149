use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::store::DocumentMetaStore;
use crate::types::Lid;

/// Holds removed lids back from reuse. Without a visibility delay a lid is
/// retired as soon as its removal has completed in every store; with a delay
/// it waits for the next commit so readers of the old commit never see the
/// slot reused.
pub struct LidReuseDelayer {
    meta: Arc<DocumentMetaStore>,
    immediate: bool,
    pending: Mutex<Vec<Lid>>,
}

impl LidReuseDelayer {
    pub fn new(meta: Arc<DocumentMetaStore>, visibility_delay: Duration) -> Self {
        LidReuseDelayer {
            meta,
            immediate: visibility_delay.is_zero(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn delay_reuse(&self, lids: &[Lid]) {
        if lids.is_empty() {
            return;
        }
        if self.immediate {
            for lid in lids {
                self.meta.retire_lid(*lid);
            }
        } else {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(lids);
        }
    }

    /// Retire everything held back. Called after a commit. Returns how many lids were retired.
    pub fn release_pending(&self) -> usize {
        let lids = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        for lid in &lids {
            self.meta.retire_lid(*lid);
        }
        lids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Decides when a visibility-delayed feed is due for a commit.
pub struct CommitTimeTracker {
    delay: Duration,
    last_commit: Mutex<Instant>,
}

impl CommitTimeTracker {
    pub fn new(delay: Duration) -> Self {
        CommitTimeTracker {
            delay,
            last_commit: Mutex::new(Instant::now()),
        }
    }

    pub fn visibility_delay(&self) -> Duration {
        self.delay
    }

    pub fn has_visibility_delay(&self) -> bool {
        !self.delay.is_zero()
    }

    pub fn needs_commit(&self) -> bool {
        if !self.has_visibility_delay() {
            return false;
        }
        Instant::now() >= self.due_at()
    }

    /// When the next commit is due.
    pub fn due_at(&self) -> Instant {
        *self.last_commit.lock().unwrap_or_else(|e| e.into_inner()) + self.delay
    }

    pub fn commit_done(&self) {
        *self.last_commit.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}
