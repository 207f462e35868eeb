//! Queue worker: dequeue, dispatch, then ack or nack.
//!
//! Each delivery runs to completion before the next is pulled. Transient
//! failures are nacked for redelivery; data-quality and configuration
//! failures are acked and logged, since retrying identical input cannot help.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mb_pipeline::{DebugMode, Dispatcher, ErrorClass};
use mb_queue::JobQueue;
use mb_schemas::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Queue empty.
    Idle,
    Acked,
    /// Nacked for redelivery.
    Redelivered,
    /// Failed with a non-retryable class; acked and logged.
    Dropped,
}

pub struct Worker {
    id: String,
    queue: QueueName,
    backend: Arc<dyn JobQueue>,
    dispatcher: Dispatcher,
    debug: DebugMode,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: QueueName,
        backend: Arc<dyn JobQueue>,
        dispatcher: Dispatcher,
        debug: DebugMode,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            backend,
            dispatcher,
            debug,
        }
    }

    pub async fn work_once(&self) -> Result<WorkOutcome> {
        let Some(delivery) = self.backend.dequeue(self.queue, &self.id).await? else {
            return Ok(WorkOutcome::Idle);
        };

        let err = match self.dispatcher.dispatch(&delivery.job).await {
            Ok(()) => {
                self.backend.ack(&delivery).await?;
                return Ok(WorkOutcome::Acked);
            }
            Err(e) => e,
        };

        let class = err.class();
        let outcome = if class.is_retryable() {
            warn!(
                worker = %self.id,
                job = delivery.job.kind(),
                delivery_id = delivery.id,
                attempts = delivery.attempts,
                class = class.as_str(),
                error = %err,
                "job failed; redelivering"
            );
            self.backend.nack(&delivery, &err.to_string()).await?;
            WorkOutcome::Redelivered
        } else if class == ErrorClass::Configuration {
            warn!(
                worker = %self.id,
                job = delivery.job.kind(),
                delivery_id = delivery.id,
                error = %err,
                "job skipped; slug not configured"
            );
            self.backend.ack(&delivery).await?;
            WorkOutcome::Dropped
        } else {
            error!(
                worker = %self.id,
                job = delivery.job.kind(),
                delivery_id = delivery.id,
                class = class.as_str(),
                error = %err,
                "job failed; dropped"
            );
            self.backend.ack(&delivery).await?;
            WorkOutcome::Dropped
        };

        if self.debug.enabled() {
            return Err(anyhow::Error::new(err).context(format!("worker {}", self.id)));
        }
        Ok(outcome)
    }

    /// Work until `shutdown` flips to `true`. An in-flight job always
    /// finishes; only the idle wait is interrupted.
    pub async fn run(self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(worker = %self.id, queue = %self.queue, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.work_once().await {
                Ok(WorkOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) if self.debug.enabled() => return Err(e),
                Err(e) => {
                    error!(worker = %self.id, error = %format!("{e:#}"), "worker step failed");
                    true
                }
            };
            if pause {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!(worker = %self.id, "worker stopped");
        Ok(())
    }
}
