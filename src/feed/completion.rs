//! Completion context: correlates one logical feed operation with the
//! sub-writes it fans out to, and replies exactly once.
//!
//! The creator holds one reference until [`CompletionContext::seal`]; every
//! [`SubWrite`] holds another. Whoever drops the count to zero wins a CAS on
//! `fired` and delivers the result. The first failure is the one reported;
//! later failures are logged.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::error::{FeedError, Result};

type DoneCallback = Box<dyn FnOnce(bool) + Send>;

struct Inner {
    label: String,
    outstanding: AtomicUsize,
    fired: AtomicBool,
    first_error: Mutex<Option<FeedError>>,
    reply: Mutex<Option<oneshot::Sender<Result<()>>>>,
    on_done: Mutex<Vec<DoneCallback>>,
}

impl Inner {
    fn record_failure(&self, err: FeedError) {
        let mut slot = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::debug!("[COMPLETION {}] sub-write failed: {}", self.label, err);
            *slot = Some(err);
        } else {
            tracing::warn!(
                "[COMPLETION {}] additional sub-write failure: {}",
                self.label,
                err
            );
        }
    }

    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.fire();
    }

    fn fire(&self) {
        let error = self
            .first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let callbacks: Vec<DoneCallback> =
            std::mem::take(&mut *self.on_done.lock().unwrap_or_else(|e| e.into_inner()));
        for callback in callbacks {
            callback(error.is_none());
        }
        let reply = self.reply.lock().unwrap_or_else(|e| e.into_inner()).take();
        match (reply, error) {
            (Some(tx), None) => {
                let _ = tx.send(Ok(()));
            }
            (Some(tx), Some(err)) => {
                let _ = tx.send(Err(err));
            }
            (None, Some(err)) => {
                tracing::error!(
                    "[COMPLETION {}] failed after early acknowledgement: {}",
                    self.label,
                    err
                );
            }
            (None, None) => {}
        }
    }
}

/// Creator's handle. Clone to hand to code that registers callbacks or starts sub-writes.
#[derive(Clone)]
pub struct CompletionContext {
    inner: Arc<Inner>,
}

/// Receiving half of a completion context: resolves to the operation's result.
pub struct FeedToken {
    rx: oneshot::Receiver<Result<()>>,
}

impl FeedToken {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Aborted(
                "completion context dropped without reply".to_string(),
            )),
        }
    }
}

impl CompletionContext {
    pub fn new(label: impl Into<String>) -> (Self, FeedToken) {
        let (tx, rx) = oneshot::channel();
        let ctx = CompletionContext {
            inner: Arc::new(Inner {
                label: label.into(),
                outstanding: AtomicUsize::new(1),
                fired: AtomicBool::new(false),
                first_error: Mutex::new(None),
                reply: Mutex::new(Some(tx)),
                on_done: Mutex::new(Vec::new()),
            }),
        };
        (ctx, FeedToken { rx })
    }

    /// Register one more outstanding sub-write.
    pub fn begin(&self) -> SubWrite {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        SubWrite {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Record a failure without completing anything.
    pub fn fail(&self, err: FeedError) {
        self.inner.record_failure(err);
    }

    /// Run `f(success)` when the context fires, before the reply is sent.
    pub fn on_done<F>(&self, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.inner
            .on_done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(f));
    }

    /// Reply success now; the context still fires normally later.
    pub fn ack_early(&self) {
        if let Some(tx) = self
            .inner
            .reply
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tracing::trace!("[COMPLETION {}] early ack", self.inner.label);
            let _ = tx.send(Ok(()));
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Drop the creator's reference. Fires immediately if no sub-write is outstanding.
    pub fn seal(self) {
        self.inner.release();
    }
}

/// One outstanding sub-write. Must be finished with [`SubWrite::done`],
/// [`SubWrite::fail`] or [`SubWrite::finish`]; dropping it unfinished counts as aborted.
pub struct SubWrite {
    inner: Option<Arc<Inner>>,
}

impl SubWrite {
    pub fn done(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }

    pub fn fail(mut self, err: FeedError) {
        if let Some(inner) = self.inner.take() {
            inner.record_failure(err);
            inner.release();
        }
    }

    pub fn finish(self, result: Result<()>) {
        match result {
            Ok(()) => self.done(),
            Err(e) => self.fail(e),
        }
    }
}

impl Drop for SubWrite {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.record_failure(FeedError::Aborted(format!(
                "sub-write of {} dropped before completion",
                inner.label
            )));
            inner.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(ctx: &CompletionContext) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        ctx.on_done(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        fired
    }

    #[tokio::test]
    async fn seal_without_sub_writes_fires_immediately() {
        let (ctx, token) = CompletionContext::new("t");
        let fired = counting(&ctx);
        ctx.seal();
        assert!(token.wait().await.is_ok());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fires_once_after_last_sub_write() {
        for stores in 1..=4 {
            let (ctx, token) = CompletionContext::new("t");
            let fired = counting(&ctx);
            let subs: Vec<SubWrite> = (0..stores).map(|_| ctx.begin()).collect();
            let observer = ctx.clone();
            ctx.seal();
            assert!(!observer.is_fired());
            let mut handles = Vec::new();
            for sub in subs {
                handles.push(tokio::spawn(async move { sub.done() }));
            }
            for h in handles {
                h.await.unwrap();
            }
            assert!(token.wait().await.is_ok());
            assert!(observer.is_fired());
            assert_eq!(fired.load(Ordering::SeqCst), 1, "stores={}", stores);
        }
    }

    #[tokio::test]
    async fn first_failure_is_reported() {
        let (ctx, token) = CompletionContext::new("t");
        let a = ctx.begin();
        let b = ctx.begin();
        let succeeded = Arc::new(AtomicBool::new(true));
        let s = Arc::clone(&succeeded);
        ctx.on_done(move |ok| s.store(ok, Ordering::SeqCst));
        ctx.seal();
        a.fail(FeedError::BackendFailure("first".into()));
        b.fail(FeedError::BackendFailure("second".into()));
        assert_eq!(
            token.wait().await,
            Err(FeedError::BackendFailure("first".into()))
        );
        assert!(!succeeded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_sub_write_aborts() {
        let (ctx, token) = CompletionContext::new("t");
        let sub = ctx.begin();
        ctx.seal();
        drop(sub);
        assert!(matches!(token.wait().await, Err(FeedError::Aborted(_))));
    }

    #[tokio::test]
    async fn early_ack_replies_before_sub_writes_finish() {
        let (ctx, token) = CompletionContext::new("t");
        let fired = counting(&ctx);
        let sub = ctx.begin();
        ctx.ack_early();
        let observer = ctx.clone();
        ctx.seal();
        assert!(token.wait().await.is_ok());
        assert!(!observer.is_fired());
        sub.done();
        assert!(observer.is_fired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn context_level_failure_fails_reply() {
        let (ctx, token) = CompletionContext::new("t");
        ctx.fail(FeedError::NotFound("id:ns:t::x".into()));
        ctx.seal();
        assert!(matches!(token.wait().await, Err(FeedError::NotFound(_))));
    }
}
