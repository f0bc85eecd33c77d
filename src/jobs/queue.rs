use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::Task;
use crate::error::QueueError;

const DEFAULT_CAPACITY: usize = 256;

/// A task plus its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub task: Task,
    /// 1-based delivery attempt
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Next delivery of the same task.
    pub fn retry(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a task for at-least-once delivery and return its id.
    async fn enqueue(&self, task: Task) -> Result<Uuid, QueueError>;
}

/// Bounded in-process queue. Cloning shares the same channel.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::Sender<Envelope>,
}

pub type TaskReceiver = mpsc::Receiver<Envelope>;

impl MemoryQueue {
    pub fn new() -> (Self, TaskReceiver) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn push(&self, envelope: Envelope) -> Result<Uuid, QueueError> {
        let id = envelope.id;
        self.tx.send(envelope).await.map_err(|_| QueueError::Closed)?;
        Ok(id)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: Task) -> Result<Uuid, QueueError> {
        self.push(Envelope::new(task)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_reports_closure() {
        let (queue, mut rx) = MemoryQueue::new();
        let first = queue.enqueue(Task::ScrapeAll).await.unwrap();
        queue
            .enqueue(Task::SweepStale { slug: None })
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id, first);
        assert_eq!(envelope.attempt, 1);
        assert_eq!(envelope.retry().attempt, 2);
        assert_eq!(rx.recv().await.unwrap().task.kind(), "sweep_stale");

        drop(rx);
        assert!(matches!(
            queue.enqueue(Task::ScrapeAll).await,
            Err(QueueError::Closed)
        ));
    }
}
