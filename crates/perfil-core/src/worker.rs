use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::key::CompanyKey;
use crate::queue::{FailOutcome, QueueEntry, WorkQueue};

/// One stage's work, invoked per claimed entry.
pub trait StageHandler: Send + Sync {
    /// Stage name for logs ("discovery", "profile").
    fn stage(&self) -> &'static str;

    fn handle(&self, key: &CompanyKey) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Configuration for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Entries claimed per poll.
    pub claim_batch: usize,
    /// Sleep between empty polls.
    pub idle_sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            claim_batch: 1,
            idle_sleep: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn with_claim_batch(mut self, batch: usize) -> Self {
        self.claim_batch = batch.max(1);
        self
    }
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started { worker_id: &'a str, stage: &'a str },
    Polling,
    EntryClaimed { entry: &'a QueueEntry },
    EntryCompleted { entry_id: i64, key: &'a CompanyKey },
    EntryFailed {
        entry_id: i64,
        key: &'a CompanyKey,
        error: &'a str,
        will_retry: bool,
    },
    Stopped { worker_id: &'a str },
}

/// Receives worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter backed by the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id, stage } => {
                tracing::info!(%worker_id, %stage, "worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("polling queue");
            }
            WorkerEvent::EntryClaimed { entry } => {
                tracing::info!(entry_id = entry.id, key = %entry.key, attempts = entry.attempts, "entry claimed");
            }
            WorkerEvent::EntryCompleted { entry_id, key } => {
                tracing::info!(entry_id, %key, "entry done");
            }
            WorkerEvent::EntryFailed {
                entry_id,
                key,
                error,
                will_retry,
            } => {
                tracing::warn!(entry_id, %key, %error, %will_retry, "entry failed");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "worker stopped");
            }
        }
    }
}

/// Long-running loop: claim a small batch, run the stage per entry,
/// translate the outcome into a queue transition.
///
/// Shutdown is cooperative: cancellation stops new claims, in-flight
/// entries finish. Entries abandoned by a crash are reclaimed by the
/// queue's visibility timeout, so there is nothing to release here.
pub struct StageWorker<Q, H>
where
    Q: WorkQueue,
    H: StageHandler,
{
    queue: Q,
    handler: H,
    config: WorkerConfig,
}

impl<Q, H> StageWorker<Q, H>
where
    Q: WorkQueue,
    H: StageHandler,
{
    pub fn new(queue: Q, handler: H, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
            stage: self.handler.stage(),
        });

        loop {
            if cancel.is_cancelled() {
                break;
            }
            reporter.report(WorkerEvent::Polling);

            match self
                .queue
                .claim(&self.config.worker_id, self.config.claim_batch)
                .await
            {
                Ok(entries) if entries.is_empty() => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.idle_sleep) => {}
                        () = cancel.cancelled() => break,
                    }
                }
                Ok(entries) => {
                    for entry in entries {
                        reporter.report(WorkerEvent::EntryClaimed { entry: &entry });
                        self.process_entry(&entry, reporter).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, stage = self.handler.stage(), "claim failed");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.idle_sleep * 2) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }

        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });
        Ok(())
    }

    /// Process a single entry. Public for tests.
    pub async fn process_entry<WR: WorkerReporter>(&self, entry: &QueueEntry, reporter: &WR) {
        match self.handler.handle(&entry.key).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(entry.id, &self.config.worker_id).await {
                    tracing::error!(entry_id = entry.id, error = %e, "failed to mark entry done");
                }
                reporter.report(WorkerEvent::EntryCompleted {
                    entry_id: entry.id,
                    key: &entry.key,
                });
            }
            Err(e) => {
                let message = e.queue_message();
                let outcome = self
                    .queue
                    .fail_or_retry(entry.id, &self.config.worker_id, &message)
                    .await;
                let will_retry = matches!(outcome, Ok(FailOutcome::Retried { .. }));
                if let Err(e) = outcome {
                    tracing::error!(entry_id = entry.id, error = %e, "failed to record entry failure");
                }
                reporter.report(WorkerEvent::EntryFailed {
                    entry_id: entry.id,
                    key: &entry.key,
                    error: &message,
                    will_retry,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;
    use crate::testutil::{MockQueue, MockReporter};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CountingHandler {
        fn ok() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }
        }
    }

    impl StageHandler for CountingHandler {
        fn stage(&self) -> &'static str {
            "test"
        }

        async fn handle(&self, _key: &CompanyKey) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::Transport("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id("test-worker")
            .with_idle_sleep(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn processes_entry_and_completes() {
        let queue = MockQueue::empty();
        queue
            .enqueue(&CompanyKey::new("12345678").unwrap())
            .await
            .unwrap();
        let handler = CountingHandler::ok();
        let worker = StageWorker::new(queue.clone(), handler.clone(), config());
        let reporter = MockReporter::new();

        let entries = queue.claim("test-worker", 1).await.unwrap();
        worker.process_entry(&entries[0], &reporter).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status_of(entries[0].id), Some(QueueStatus::Done));
        assert!(reporter.events().contains(&"EntryCompleted".to_string()));
    }

    #[tokio::test]
    async fn failing_entry_is_retried_with_message() {
        let queue = MockQueue::empty();
        queue
            .enqueue(&CompanyKey::new("12345678").unwrap())
            .await
            .unwrap();
        let worker = StageWorker::new(queue.clone(), CountingHandler::failing(), config());
        let reporter = MockReporter::new();

        let entries = queue.claim("test-worker", 1).await.unwrap();
        worker.process_entry(&entries[0], &reporter).await;

        assert_eq!(queue.status_of(entries[0].id), Some(QueueStatus::Queued));
        let entry = queue.entry(entries[0].id).unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.as_deref().unwrap().starts_with("transport:"));
        assert!(reporter.events().contains(&"EntryFailed".to_string()));
    }

    #[tokio::test]
    async fn run_loop_drains_queue_then_stops_on_cancel() {
        let queue = MockQueue::empty();
        for i in 0..3 {
            queue
                .enqueue(&CompanyKey::new(&format!("1234567{i}")).unwrap())
                .await
                .unwrap();
        }
        let handler = CountingHandler::ok();
        let worker = StageWorker::new(queue.clone(), handler.clone(), config());
        let reporter = MockReporter::new();
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        worker.run(cancel, &reporter).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let events = reporter.events();
        assert!(events.contains(&"Started".to_string()));
        assert!(events.contains(&"Stopped".to_string()));
    }

    #[tokio::test]
    async fn cancelled_before_start_claims_nothing() {
        let queue = MockQueue::empty();
        queue
            .enqueue(&CompanyKey::new("12345678").unwrap())
            .await
            .unwrap();
        let handler = CountingHandler::ok();
        let worker = StageWorker::new(queue.clone(), handler.clone(), config());
        let reporter = MockReporter::new();

        let cancel = CancellationToken::new();
        cancel.cancel();
        worker.run(cancel, &reporter).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
