//! Wiring shared by the scenario tests: real directors over `MemStore` and
//! `MemoryQueue`, with scripted doubles at the network edges.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use mb_config::Settings;
use mb_pipeline::{
    AgentRegistry, Dispatcher, ExportAgent, ExportAgentError, FieldMatchMode, FieldMatchingAgent,
    IdentityResolver, MatchingAgent, PipelineContext,
};
use mb_queue::{MemoryQueue, Queues};
use mb_schemas::{
    ExportTransaction, FeedType, Job, PaymentTransaction, PendingExport, QueueName,
    ResolvedIdentity, TransactionRecord,
};
use mb_testkit::{identity, merchant_identifier, ts, MemStore, RecordBuilder};

pub const SCHEME: &str = "iceland";

/// Every card resolves to loyalty member `L-1`.
pub struct EnrolledResolver;

#[async_trait]
impl IdentityResolver for EnrolledResolver {
    async fn resolve(
        &self,
        _payment: &PaymentTransaction,
    ) -> anyhow::Result<Option<ResolvedIdentity>> {
        Ok(Some(identity("L-1")))
    }
}

/// Destination that fails the first `failures` deliveries, then accepts.
#[derive(Default)]
pub struct FlakyDestination {
    failures: AtomicUsize,
    delivered: AtomicUsize,
}

impl FlakyDestination {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExportAgent for FlakyDestination {
    async fn export(
        &self,
        _export: &ExportTransaction,
        _pending: &PendingExport,
    ) -> Result<(), ExportAgentError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ExportAgentError::Transport(anyhow::anyhow!("destination down")));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Pipeline {
    pub store: Arc<MemStore>,
    pub queue: Arc<MemoryQueue>,
    pub ctx: PipelineContext,
    pub dispatcher: Dispatcher,
}

/// Loyalty field matching for [`SCHEME`] and `destination` registered for
/// the same slug.
pub fn pipeline(destination: Arc<FlakyDestination>) -> Pipeline {
    let mut settings = Settings::default();
    settings.queues.enqueue_retry.min_delay_ms = 1;
    settings.queues.enqueue_retry.max_delay_ms = 2;

    let store = Arc::new(MemStore::new());
    store.set_now(ts(2024, 3, 1, 13, 0));
    let queue = Arc::new(MemoryQueue::new(settings.queues.redelivery.max_attempts));
    let queues = Queues::new(
        queue.clone(),
        settings.queues.limits.clone(),
        settings.queues.enqueue_retry.clone(),
    );

    let mut matching: AgentRegistry<dyn MatchingAgent> = AgentRegistry::new();
    let agent = FieldMatchingAgent::new(Duration::hours(24), FieldMatchMode::Loyalty);
    matching
        .register(SCHEME, Arc::new(agent))
        .expect("register matching agent");
    let mut exports: AgentRegistry<dyn ExportAgent> = AgentRegistry::new();
    exports
        .register(SCHEME, destination)
        .expect("register export agent");

    let clock_store = store.clone();
    let ctx = PipelineContext::new(
        Arc::new(settings),
        store.clone(),
        queues,
        Arc::new(EnrolledResolver),
    )
    .with_matching_agents(matching)
    .with_export_agents(exports)
    .with_clock(Arc::new(move || clock_store.now()));

    Pipeline {
        store,
        queue,
        dispatcher: Dispatcher::new(ctx.clone()),
        ctx,
    }
}

impl Pipeline {
    /// Dispatch everything ready on `queue`, including jobs the dispatch
    /// itself puts back on it. Returns the jobs processed.
    pub async fn run_queue(&self, queue: QueueName) -> Vec<Job> {
        let mut seen = Vec::new();
        loop {
            let batch = self.queue.drain(queue);
            if batch.is_empty() {
                return seen;
            }
            for job in batch {
                self.dispatcher.dispatch(&job).await.expect("dispatch");
                seen.push(job);
            }
        }
    }

    /// Drain every queue in pipeline order until all are empty.
    pub async fn settle(&self) {
        loop {
            let mut ran = 0;
            for q in QueueName::ALL {
                ran += self.run_queue(q).await.len();
            }
            if ran == 0 {
                return;
            }
        }
    }

    /// Make the next enqueue fail even after its in-process retries.
    pub fn fail_next_enqueue(&self) {
        let attempts = self.ctx.settings.queues.enqueue_retry.max_attempts + 1;
        self.queue.fail_next_enqueues(attempts);
    }

    pub async fn merchant_identifier(&self) -> i64 {
        merchant_identifier(self.store.as_ref(), SCHEME, "MID-1")
            .await
            .expect("seed merchant identifier")
    }
}

/// Settled payment leg against `mid`, no settlement key.
pub fn settled_payment(transaction_id: &str, mid: i64, amount: i64) -> TransactionRecord {
    RecordBuilder::new("visa", transaction_id, FeedType::Settled)
        .merchant_identifiers(&[mid])
        .card("424242", "4242")
        .amount(amount)
        .build()
}

/// Scheme-feed leg for `mid`.
pub fn scheme_leg(transaction_id: &str, mid: i64, amount: i64) -> TransactionRecord {
    RecordBuilder::new(SCHEME, transaction_id, FeedType::Merchant)
        .merchant_identifiers(&[mid])
        .amount(amount)
        .build()
}
