use crate::config::OrchestratorConfig;
use crate::driver::WorkflowDriver;
use crate::error::OrchestrationError;
use crate::queue::WorkQueue;
use crate::record::DocumentId;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Bounded-concurrency harness that pulls runnable documents off the work
/// queue and dispatches them to the [`WorkflowDriver`].
///
/// Workflow concurrency is capped at `max_concurrent_workflows` (step
/// concurrency is bounded separately inside the executor). Transient errors
/// re-enqueue the document; queue or storage outages back off with a growing
/// delay instead of crash-looping.
pub struct WorkerPool {
    driver: Arc<WorkflowDriver>,
    queue: Arc<dyn WorkQueue>,
    config: Arc<OrchestratorConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Creates a pool over the given driver and queue.
    pub fn new(
        driver: Arc<WorkflowDriver>,
        queue: Arc<dyn WorkQueue>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            driver,
            queue,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signals the polling loop to stop after the current batch.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Runs the polling loop until [`shutdown`](WorkerPool::shutdown).
    pub async fn run(&self) {
        info!(
            max_workflows = self.config.max_concurrent_workflows,
            max_activities = self.config.max_concurrent_activities,
            "worker pool started"
        );
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_workflows.max(1)));
        let mut shutdown = self.shutdown_rx.clone();
        let mut backoff = self.config.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch_size = self.config.max_concurrent_workflows.max(1);
            match self.queue.dequeue_ready(SystemTime::now(), batch_size).await {
                Ok(batch) if !batch.is_empty() => {
                    backoff = self.config.poll_interval;
                    for document_id in batch {
                        let permit = match permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let driver = self.driver.clone();
                        let queue = self.queue.clone();
                        let retry_delay = self.config.poll_interval;
                        tokio::spawn(async move {
                            dispatch(driver, queue, document_id, retry_delay).await;
                            drop(permit);
                        });
                    }
                }
                Ok(_) => {
                    // Idle: fall back to polling, but wake early on shutdown.
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        () = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    warn!("work queue unavailable, backing off: {err}");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        info!("worker pool stopped");
    }
}

/// Advances one document, absorbing transient failures by re-enqueueing.
async fn dispatch(
    driver: Arc<WorkflowDriver>,
    queue: Arc<dyn WorkQueue>,
    document_id: DocumentId,
    retry_delay: Duration,
) {
    match driver.advance(&document_id).await {
        Ok(progress) => {
            debug!(%document_id, ?progress, "advance finished");
        }
        Err(err) if err.is_transient() => {
            debug!(%document_id, "transient advance failure, re-enqueueing: {err}");
            requeue(&*queue, document_id, retry_delay).await;
        }
        Err(err) => {
            // Fatal for this document: surfaces via status, never re-queued.
            error!(%document_id, "advance failed: {err}");
        }
    }
}

/// Best-effort re-enqueue with one short retry when the queue is busy.
async fn requeue(queue: &dyn WorkQueue, document_id: DocumentId, delay: Duration) {
    let not_before = SystemTime::now() + delay;
    if let Err(err) = queue.enqueue(document_id.clone(), not_before).await {
        warn!(%document_id, "re-enqueue failed, retrying once: {err}");
        sleep(delay).await;
        if let Err(err) = queue.enqueue(document_id.clone(), not_before).await {
            error!(%document_id, "dropping work item after repeated enqueue failure: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyQueue {
        fail_enqueues: AtomicUsize,
        inner: InMemoryQueue,
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn enqueue(
            &self,
            document_id: DocumentId,
            not_before: SystemTime,
        ) -> Result<(), OrchestrationError> {
            if self.fail_enqueues.load(Ordering::SeqCst) > 0 {
                self.fail_enqueues.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchestrationError::QueueFull { capacity: 0 });
            }
            self.inner.enqueue(document_id, not_before).await
        }

        async fn dequeue_ready(
            &self,
            now: SystemTime,
            max: usize,
        ) -> Result<Vec<DocumentId>, OrchestrationError> {
            self.inner.dequeue_ready(now, max).await
        }

        async fn depth(&self) -> usize {
            self.inner.depth().await
        }
    }

    #[tokio::test]
    async fn test_requeue_retries_once_on_busy() {
        let queue = FlakyQueue {
            fail_enqueues: AtomicUsize::new(1),
            inner: InMemoryQueue::new(16),
        };
        requeue(&queue, DocumentId::new("doc-1"), Duration::from_millis(1)).await;
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_requeue_gives_up_after_second_failure() {
        let queue = FlakyQueue {
            fail_enqueues: AtomicUsize::new(2),
            inner: InMemoryQueue::new(16),
        };
        requeue(&queue, DocumentId::new("doc-1"), Duration::from_millis(1)).await;
        assert_eq!(queue.depth().await, 0);
    }
}
