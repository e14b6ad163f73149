use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

enum Task {
    Run(Job),
    Sync(oneshot::Sender<()>),
}

/// Sequenced executor: jobs run one at a time, in submission order, on a
/// dedicated tokio task. Separate executors overlap with each other.
#[derive(Clone)]
pub struct Executor {
    name: &'static str,
    tx: mpsc::UnboundedSender<Task>,
}

impl Executor {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            tracing::debug!("[EXEC {}] started", name);
            while let Some(task) = rx.recv().await {
                match task {
                    Task::Run(job) => job(),
                    Task::Sync(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("[EXEC {}] stopped", name);
        });
        Executor { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a job. If the worker is gone the job is dropped, which aborts
    /// any sub-write it owns.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Task::Run(Box::new(job))).is_err() {
            tracing::warn!("[EXEC {}] worker gone, job dropped", self.name);
        }
    }

    /// Wait until every job queued before this call has run.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Task::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The three executors the feed view writes through.
#[derive(Clone)]
pub struct WriteService {
    pub summary: Executor,
    pub index: Executor,
    pub attribute: Executor,
}

impl WriteService {
    pub fn spawn() -> Self {
        WriteService {
            summary: Executor::spawn("summary"),
            index: Executor::spawn("index"),
            attribute: Executor::spawn("attribute"),
        }
    }

    pub async fn sync(&self) {
        self.summary.sync().await;
        self.index.sync().await;
        self.attribute.sync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let exec = Executor::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            exec.execute(move || seen.lock().unwrap().push(i));
        }
        exec.sync().await;
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn write_service_sync_drains_all_executors() {
        let ws = WriteService::spawn();
        let count = Arc::new(Mutex::new(0));
        for exec in [&ws.summary, &ws.index, &ws.attribute] {
            let count = Arc::clone(&count);
            exec.execute(move || *count.lock().unwrap() += 1);
        }
        ws.sync().await;
        assert_eq!(*count.lock().unwrap(), 3);
    }
}
