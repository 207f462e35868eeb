use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::warn;

use mb_schemas::{Job, QueueName};

use crate::{Delivery, JobQueue, QueueError};

#[derive(Default)]
struct State {
    next_id: i64,
    ready: HashMap<QueueName, VecDeque<Delivery>>,
    claimed: BTreeMap<i64, Delivery>,
    dead: Vec<Delivery>,
    fail_enqueues: usize,
}

/// In-process queue for tests and single-node runs. Redelivery is immediate
/// (no delay); the attempt cap matches [`crate::PgJobQueue`].
pub struct MemoryQueue {
    max_attempts: i32,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable(anyhow!("memory queue lock poisoned")))
    }

    /// Make the next `n` enqueue calls fail as if the backend were down.
    pub fn fail_next_enqueues(&self, n: usize) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_enqueues = n;
        }
    }

    /// Ready jobs on `queue`, oldest first. Claimed jobs are not included.
    pub fn jobs(&self, queue: QueueName) -> Vec<Job> {
        match self.state.lock() {
            Ok(st) => st
                .ready
                .get(&queue)
                .map(|q| q.iter().map(|d| d.job.clone()).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove and return every ready job on `queue`.
    pub fn drain(&self, queue: QueueName) -> Vec<Job> {
        match self.state.lock() {
            Ok(mut st) => st
                .ready
                .get_mut(&queue)
                .map(|q| q.drain(..).map(|d| d.job).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn dead_letters(&self) -> Vec<Job> {
        match self.state.lock() {
            Ok(st) => st.dead.iter().map(|d| d.job.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<i64, QueueError> {
        let mut st = self.lock()?;
        if st.fail_enqueues > 0 {
            st.fail_enqueues -= 1;
            return Err(QueueError::Unavailable(anyhow!("injected enqueue failure")));
        }
        st.next_id += 1;
        let id = st.next_id;
        let queue = job.queue();
        st.ready.entry(queue).or_default().push_back(Delivery {
            id,
            queue,
            job: job.clone(),
            attempts: 0,
        });
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        _worker_id: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut st = self.lock()?;
        let Some(mut delivery) = st.ready.get_mut(&queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        delivery.attempts += 1;
        st.claimed.insert(delivery.id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock()?.claimed.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut st = self.lock()?;
        let Some(claimed) = st.claimed.remove(&delivery.id) else {
            return Ok(());
        };
        if claimed.attempts >= self.max_attempts {
            warn!(
                job_id = claimed.id,
                queue = %claimed.queue,
                attempts = claimed.attempts,
                error,
                "job parked after max attempts"
            );
            st.dead.push(claimed);
        } else {
            st.ready.entry(claimed.queue).or_default().push_back(claimed);
        }
        Ok(())
    }

    async fn len(&self, queue: QueueName) -> Result<u64, QueueError> {
        let st = self.lock()?;
        let ready = st.ready.get(&queue).map(VecDeque::len).unwrap_or(0);
        let claimed = st.claimed.values().filter(|d| d.queue == queue).count();
        Ok((ready + claimed) as u64)
    }
}
