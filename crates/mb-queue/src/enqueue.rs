use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, warn};

use mb_config::{BackoffSettings, QueueLimits};
use mb_schemas::{Job, QueueName};

use crate::{JobQueue, QueueError};

/// Producer-side handle shared by every director.
#[derive(Clone)]
pub struct Queues {
    backend: Arc<dyn JobQueue>,
    limits: QueueLimits,
    retry: BackoffSettings,
}

impl Queues {
    pub fn new(backend: Arc<dyn JobQueue>, limits: QueueLimits, retry: BackoffSettings) -> Self {
        Self {
            backend,
            limits,
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn JobQueue> {
        &self.backend
    }

    pub fn limit(&self, queue: QueueName) -> u64 {
        match queue {
            QueueName::Import => self.limits.import,
            QueueName::Identify => self.limits.identify,
            QueueName::Matching => self.limits.matching,
            QueueName::Export => self.limits.export,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_max_times(self.retry.max_attempts)
            .with_jitter()
    }

    /// `false` when `queue` is at or over its configured limit. The limit is
    /// advisory: callers log and enqueue anyway.
    pub async fn has_capacity(&self, queue: QueueName) -> bool {
        match self.backend.len(queue).await {
            Ok(depth) => {
                let limit = self.limit(queue);
                if depth >= limit {
                    warn!(queue = %queue, depth, limit, "queue over capacity");
                    false
                } else {
                    true
                }
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "queue depth unavailable for capacity check");
                true
            }
        }
    }

    /// Enqueue with the capacity check and bounded retry. Payload errors are
    /// not retried.
    pub async fn enqueue(&self, job: Job) -> Result<i64, QueueError> {
        let queue = job.queue();
        self.has_capacity(queue).await;

        let attempts = self.retry.max_attempts + 1;
        let backend = self.backend.clone();
        let res = (|| {
            let backend = backend.clone();
            let job = job.clone();
            async move { backend.enqueue(&job).await }
        })
        .retry(self.backoff())
        .when(|e: &QueueError| matches!(e, QueueError::Unavailable(_)))
        .notify(|e: &QueueError, dur: Duration| {
            warn!(queue = %queue, error = %e, delay = ?dur, "enqueue failed, retrying");
        })
        .await;

        match res {
            Ok(id) => {
                debug!(queue = %queue, job = job.kind(), job_id = id, "enqueued");
                Ok(id)
            }
            Err(QueueError::Unavailable(e)) => Err(QueueError::Exhausted {
                attempts,
                last: format!("{e:#}"),
            }),
            Err(other) => Err(other),
        }
    }

    pub async fn depths(&self) -> Result<Vec<(QueueName, u64)>, QueueError> {
        let mut out = Vec::with_capacity(QueueName::ALL.len());
        for q in QueueName::ALL {
            out.push((q, self.backend.len(q).await?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueue;

    fn fast_retry(max_attempts: usize) -> BackoffSettings {
        BackoffSettings {
            min_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn transient_enqueue_failures_are_retried() {
        let mem = Arc::new(MemoryQueue::new(5));
        mem.fail_next_enqueues(2);
        let queues = Queues::new(mem.clone(), QueueLimits::default(), fast_retry(3));

        queues
            .enqueue(Job::MatchPayment {
                payment_transaction_id: 7,
            })
            .await
            .unwrap();
        assert_eq!(
            mem.jobs(QueueName::Matching),
            vec![Job::MatchPayment {
                payment_transaction_id: 7
            }]
        );
    }

    #[tokio::test]
    async fn exhausted_retry_is_a_hard_fault() {
        let mem = Arc::new(MemoryQueue::new(5));
        mem.fail_next_enqueues(10);
        let queues = Queues::new(mem.clone(), QueueLimits::default(), fast_retry(2));

        let err = queues
            .enqueue(Job::IdentifyPayment {
                payment_transaction_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Exhausted { attempts: 3, .. }), "{err}");
        assert!(mem.jobs(QueueName::Identify).is_empty());
    }

    #[tokio::test]
    async fn over_capacity_still_enqueues() {
        let mem = Arc::new(MemoryQueue::new(5));
        let limits = QueueLimits {
            export: 1,
            ..QueueLimits::default()
        };
        let queues = Queues::new(mem.clone(), limits, fast_retry(0));

        for id in 1..=2 {
            queues
                .enqueue(Job::ExportPending {
                    pending_export_id: id,
                })
                .await
                .unwrap();
        }
        assert!(!queues.has_capacity(QueueName::Export).await);
        assert_eq!(mem.jobs(QueueName::Export).len(), 2);
    }
}
