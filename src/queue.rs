use crate::error::OrchestrationError;
use crate::record::DocumentId;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Queue of documents awaiting an `advance` call.
///
/// Feeds the worker pool from three sources: new uploads, scheduled retries
/// (entries whose `not_before` lies in the future), and explicit resume
/// requests. Delivery is at-least-once; a dequeued document that fails
/// transiently is simply enqueued again.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Schedules a document to be advanced no earlier than `not_before`.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::QueueFull`] when the queue is at capacity; a
    /// retryable busy signal rather than unbounded growth.
    async fn enqueue(
        &self,
        document_id: DocumentId,
        not_before: SystemTime,
    ) -> Result<(), OrchestrationError>;

    /// Removes and returns up to `max` documents whose `not_before` has
    /// passed, soonest first.
    async fn dequeue_ready(
        &self,
        now: SystemTime,
        max: usize,
    ) -> Result<Vec<DocumentId>, OrchestrationError>;

    /// Current queue depth, including not-yet-due entries.
    async fn depth(&self) -> usize;
}

struct Scheduled {
    not_before: SystemTime,
    seq: u64,
    document_id: DocumentId,
}

// BinaryHeap is a max-heap; invert the ordering to pop the soonest entry,
// with the insertion sequence as a FIFO tie-breaker.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

struct QueueInner {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

/// In-memory delay queue for tests and single-process embedding.
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl InMemoryQueue {
    /// Creates a queue that rejects enqueues past `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        document_id: DocumentId,
        not_before: SystemTime,
    ) -> Result<(), OrchestrationError> {
        let mut inner = self.lock();
        if inner.heap.len() >= self.capacity {
            return Err(OrchestrationError::QueueFull {
                capacity: self.capacity,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Scheduled {
            not_before,
            seq,
            document_id,
        });
        Ok(())
    }

    async fn dequeue_ready(
        &self,
        now: SystemTime,
        max: usize,
    ) -> Result<Vec<DocumentId>, OrchestrationError> {
        let mut inner = self.lock();
        let mut ready = Vec::new();
        while ready.len() < max {
            match inner.heap.peek() {
                Some(entry) if entry.not_before <= now => {
                    if let Some(entry) = inner.heap.pop() {
                        ready.push(entry.document_id);
                    }
                }
                _ => break,
            }
        }
        Ok(ready)
    }

    async fn depth(&self) -> usize {
        self.lock().heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_due_entries_come_out_soonest_first() {
        let queue = InMemoryQueue::new(16);
        let now = SystemTime::now();

        queue
            .enqueue(DocumentId::new("later"), now + Duration::from_millis(5))
            .await
            .unwrap();
        queue.enqueue(DocumentId::new("sooner"), now).await.unwrap();

        let ready = queue
            .dequeue_ready(now + Duration::from_secs(1), 10)
            .await
            .unwrap();
        assert_eq!(ready, vec![DocumentId::new("sooner"), DocumentId::new("later")]);
    }

    #[tokio::test]
    async fn test_future_entries_stay_queued() {
        let queue = InMemoryQueue::new(16);
        let now = SystemTime::now();

        queue
            .enqueue(DocumentId::new("doc-1"), now + Duration::from_secs(60))
            .await
            .unwrap();

        assert!(queue.dequeue_ready(now, 10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await, 1);

        let ready = queue
            .dequeue_ready(now + Duration::from_secs(61), 10)
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_fifo_among_equal_deadlines() {
        let queue = InMemoryQueue::new(16);
        let now = SystemTime::now();
        for i in 0..4 {
            queue
                .enqueue(DocumentId::new(format!("doc-{i}")), now)
                .await
                .unwrap();
        }
        let ready = queue.dequeue_ready(now, 10).await.unwrap();
        let names: Vec<_> = ready.iter().map(DocumentId::as_str).collect();
        assert_eq!(names, vec!["doc-0", "doc-1", "doc-2", "doc-3"]);
    }

    #[tokio::test]
    async fn test_backpressure_rejects_when_full() {
        let queue = InMemoryQueue::new(2);
        let now = SystemTime::now();
        queue.enqueue(DocumentId::new("a"), now).await.unwrap();
        queue.enqueue(DocumentId::new("b"), now).await.unwrap();

        let err = queue.enqueue(DocumentId::new("c"), now).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::QueueFull { capacity: 2 }
        ));

        // Draining makes room again.
        queue.dequeue_ready(now, 1).await.unwrap();
        queue.enqueue(DocumentId::new("c"), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_respects_max() {
        let queue = InMemoryQueue::new(16);
        let now = SystemTime::now();
        for i in 0..5 {
            queue
                .enqueue(DocumentId::new(format!("doc-{i}")), now)
                .await
                .unwrap();
        }
        assert_eq!(queue.dequeue_ready(now, 2).await.unwrap().len(), 2);
        assert_eq!(queue.depth().await, 3);
    }
}
