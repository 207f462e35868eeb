//! mb-queue
//!
//! Named job queues (`import`, `identify`, `matching`, `export`).
//!
//! [`JobQueue`] is the at-least-once backend contract: a dequeued job stays
//! claimed until it is acked (done) or nacked (redelivered later, or parked
//! once it has failed too often). [`Queues`] is what directors hold: it adds
//! the soft capacity check and bounded, jittered enqueue retry.

mod enqueue;
mod memory;
mod postgres;

pub use enqueue::Queues;
pub use memory::MemoryQueue;
pub use postgres::PgJobQueue;

use async_trait::async_trait;
use mb_schemas::{Job, QueueName};

/// One claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub queue: QueueName,
    pub job: Job,
    /// Deliveries so far, including this one.
    pub attempts: i32,
}

#[derive(Debug)]
pub enum QueueError {
    /// Backend unreachable or the operation failed; retryable.
    Unavailable(anyhow::Error),
    /// Enqueue kept failing after bounded retry.
    Exhausted { attempts: usize, last: String },
    /// Job could not be serialised.
    Payload(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Unavailable(e) => write!(f, "queue unavailable: {e:#}"),
            QueueError::Exhausted { attempts, last } => {
                write!(f, "enqueue failed after {attempts} attempts: {last}")
            }
            QueueError::Payload(msg) => write!(f, "job payload invalid: {msg}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<anyhow::Error> for QueueError {
    fn from(e: anyhow::Error) -> Self {
        QueueError::Unavailable(e)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Single attempt; retry policy lives in [`Queues`].
    async fn enqueue(&self, job: &Job) -> Result<i64, QueueError>;

    /// Claim the oldest ready job on `queue`, if any.
    async fn dequeue(&self, queue: QueueName, worker_id: &str)
        -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a failed delivery for redelivery. Past the configured attempt
    /// cap the job is parked instead.
    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;

    /// Ready plus claimed jobs on `queue`.
    async fn len(&self, queue: QueueName) -> Result<u64, QueueError>;
}
