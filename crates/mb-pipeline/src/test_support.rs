//! Shared harness for director unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use mb_config::Settings;
use mb_db::{ExportStore, IdentityStore, MatchingStore, TransactionStore};
use mb_queue::{MemoryQueue, Queues};
use mb_schemas::{
    ExportTransaction, FeedType, MatchingType, NewExportTransaction, NewMatchedTransaction,
    PaymentTransaction, PendingExport, ResolvedIdentity,
};
use mb_testkit::{identity, merchant_identifier, MemStore, RecordBuilder};

use crate::context::PipelineContext;
use crate::error::ExportAgentError;
use crate::export::{ExportAgent, ExportDirector, ExportMode};
use crate::identify::{IdentifyDirector, IdentityResolver};
use crate::import::ImportDirector;
use crate::matching::{FieldMatchMode, FieldMatchingAgent, MatchingAgent, MatchingDirector};
use crate::registry::AgentRegistry;
use crate::retry::RetrySweeper;

// ---------------------------------------------------------------------------
// Identity resolver double
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StubResolver {
    reply: Mutex<Option<Result<Option<ResolvedIdentity>, String>>>,
    calls: Mutex<usize>,
}

impl StubResolver {
    pub fn respond(&self, identity: Option<ResolvedIdentity>) {
        *self.reply.lock().unwrap() = Some(Ok(identity));
    }

    pub fn fail_with(&self, msg: &str) {
        *self.reply.lock().unwrap() = Some(Err(msg.to_string()));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl IdentityResolver for StubResolver {
    async fn resolve(
        &self,
        _payment: &PaymentTransaction,
    ) -> anyhow::Result<Option<ResolvedIdentity>> {
        *self.calls.lock().unwrap() += 1;
        match self.reply.lock().unwrap().clone() {
            Some(Ok(identity)) => Ok(identity),
            Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Export agent double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorded {
    delivered: Vec<i64>,
    batches: Vec<(i64, usize)>,
    fail_next: usize,
}

/// Clones share state, so a test can keep one handle and register another.
#[derive(Clone)]
pub struct RecordingExportAgent {
    mode: ExportMode,
    state: Arc<Mutex<Recorded>>,
}

impl RecordingExportAgent {
    pub fn singular() -> Self {
        Self {
            mode: ExportMode::Singular,
            state: Arc::default(),
        }
    }

    pub fn batch() -> Self {
        Self {
            mode: ExportMode::Batch,
            state: Arc::default(),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Export transaction ids delivered one at a time.
    pub fn delivered(&self) -> Vec<i64> {
        self.state.lock().unwrap().delivered.clone()
    }

    /// `(sequence_number, size)` per delivered batch.
    pub fn batches(&self) -> Vec<(i64, usize)> {
        self.state.lock().unwrap().batches.clone()
    }

    fn take_failure(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.fail_next > 0 {
            st.fail_next -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ExportAgent for RecordingExportAgent {
    fn mode(&self) -> ExportMode {
        self.mode
    }

    async fn export(
        &self,
        export: &ExportTransaction,
        _pending: &PendingExport,
    ) -> Result<(), ExportAgentError> {
        if self.take_failure() {
            return Err(ExportAgentError::Transport(anyhow::anyhow!("destination down")));
        }
        self.state.lock().unwrap().delivered.push(export.id);
        Ok(())
    }

    async fn export_batch(
        &self,
        exports: &[ExportTransaction],
        sequence_number: i64,
    ) -> Result<(), ExportAgentError> {
        if self.take_failure() {
            return Err(ExportAgentError::Transport(anyhow::anyhow!("destination down")));
        }
        self.state
            .lock()
            .unwrap()
            .batches
            .push((sequence_number, exports.len()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemStore>,
    pub queue: Arc<MemoryQueue>,
    pub resolver: Arc<StubResolver>,
    pub ctx: PipelineContext,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(configure: impl FnOnce(&mut Settings)) -> Harness {
    let mut settings = Settings::default();
    settings.queues.enqueue_retry.min_delay_ms = 1;
    settings.queues.enqueue_retry.max_delay_ms = 2;
    configure(&mut settings);

    let store = Arc::new(MemStore::new());
    let queue = Arc::new(MemoryQueue::new(settings.queues.redelivery.max_attempts));
    let resolver = Arc::new(StubResolver::default());
    let queues = Queues::new(
        queue.clone(),
        settings.queues.limits.clone(),
        settings.queues.enqueue_retry.clone(),
    );
    let clock_store = store.clone();
    let ctx = PipelineContext::new(Arc::new(settings), store.clone(), queues, resolver.clone())
        .with_clock(Arc::new(move || clock_store.now()));

    Harness {
        store,
        queue,
        resolver,
        ctx,
    }
}

impl Harness {
    pub fn with_field_agent(self, scheme_slug: &str) -> Self {
        let agent = FieldMatchingAgent::new(Duration::hours(24), FieldMatchMode::Loyalty);
        self.with_matching_agent(scheme_slug, Arc::new(agent))
    }

    pub fn with_matching_agent(mut self, slug: &str, agent: Arc<dyn MatchingAgent>) -> Self {
        let mut reg = copy_registry(&self.ctx.matching_agents);
        reg.register(slug, agent).unwrap();
        self.ctx = self.ctx.with_matching_agents(reg);
        self
    }

    pub fn with_export_agent(mut self, slug: &str, agent: RecordingExportAgent) -> Self {
        let mut reg = copy_registry(&self.ctx.export_agents);
        reg.register(slug, Arc::new(agent) as Arc<dyn ExportAgent>)
            .unwrap();
        self.ctx = self.ctx.with_export_agents(reg);
        self
    }

    pub fn import(&self) -> ImportDirector {
        ImportDirector::new(self.ctx.clone())
    }

    pub fn identify(&self) -> IdentifyDirector {
        IdentifyDirector::new(self.ctx.clone())
    }

    pub fn matching(&self) -> MatchingDirector {
        MatchingDirector::new(self.ctx.clone())
    }

    pub fn export(&self) -> ExportDirector {
        ExportDirector::new(self.ctx.clone())
    }

    pub fn sweeper(&self) -> RetrySweeper {
        RetrySweeper::new(self.ctx.clone())
    }
}

fn copy_registry<A: ?Sized>(src: &AgentRegistry<A>) -> AgentRegistry<A> {
    let mut out = AgentRegistry::new();
    for slug in src.slugs() {
        out.register(slug, src.get(slug).unwrap()).unwrap();
    }
    out
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

/// Identified payment leg matched SPOTTED-style against `scheme_slug`.
/// Returns the matched transaction id.
pub async fn seed_matched(h: &Harness, scheme_slug: &str) -> i64 {
    seed_matched_many(h, scheme_slug, 1).await[0]
}

pub async fn seed_matched_many(h: &Harness, scheme_slug: &str, n: usize) -> Vec<i64> {
    let mid = merchant_identifier(h.store.as_ref(), scheme_slug, &format!("MID-{}", Uuid::new_v4()))
        .await
        .unwrap();
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let txid = format!("SEED-{}", Uuid::new_v4());
        let rec = RecordBuilder::new("visa", &txid, FeedType::Settled)
            .merchant_identifiers(&[mid])
            .card("424242", "4242")
            .amount(100 + i as i64)
            .build();
        let p = h
            .store
            .insert_payment_transaction("seed", &rec)
            .await
            .unwrap()
            .unwrap();
        h.store
            .insert_identity(&p.transaction_id, &identity("L-1"))
            .await
            .unwrap();
        let matched = NewMatchedTransaction {
            merchant_identifier_id: mid,
            primary_identifier: p.primary_identifier.clone(),
            loyalty_scheme_slug: scheme_slug.to_string(),
            transaction_id: p.transaction_id.clone(),
            transaction_date: p.transaction_date,
            spend_amount: p.spend_amount,
            spend_multiplier: p.spend_multiplier,
            spend_currency: p.spend_currency.clone(),
            card_token: p.card_token.clone(),
            matching_type: MatchingType::Spotted,
            payment_transaction_id: p.id,
            scheme_transaction_id: None,
            extra_fields: json!({}),
        };
        ids.push(h.store.persist_match(&matched).await.unwrap().unwrap());
    }
    ids
}

/// Pending export written straight to the store (nothing queued).
pub async fn seed_pending_export(h: &Harness, provider_slug: &str) -> PendingExport {
    let matched_id = seed_matched(h, provider_slug).await;
    let m = h
        .store
        .fetch_matched_transaction(matched_id)
        .await
        .unwrap()
        .unwrap()
        .fields;
    let export = NewExportTransaction {
        matched_transaction_id: matched_id,
        transaction_id: m.transaction_id,
        feed_type: FeedType::Settled,
        provider_slug: provider_slug.to_string(),
        primary_identifier: m.primary_identifier,
        transaction_date: m.transaction_date,
        spend_amount: m.spend_amount,
        spend_currency: m.spend_currency,
        loyalty_id: Some("L-1".into()),
        user_id: None,
        scheme_account_id: None,
        payment_card_account_id: None,
        first_six: None,
        last_four: None,
        expiry_month: None,
        expiry_year: None,
        auth_code: String::new(),
        approval_code: String::new(),
        export_uid: Uuid::new_v4(),
        extra_fields: json!({}),
    };
    h.store.create_export(&export).await.unwrap().unwrap()
}
