//! Process wiring: agent registries from settings, worker and scheduler
//! tasks, and the stale-claim recovery loop.
//!
//! Everything is built once at startup from [`Settings`] and torn down by
//! flipping the shared shutdown channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mb_config::{ScheduledJobKey, Settings};
use mb_db::Store;
use mb_pipeline::{
    AgentRegistry, Dispatcher, ExportAgent, FieldMatchingAgent, HttpExportAgent,
    IdentityResolver, MatchingAgent, PipelineContext,
};
use mb_queue::{JobQueue, PgJobQueue, Queues};
use mb_runtime::{CronScheduler, LeaderElection, PipelineTask, Worker};
use mb_schemas::QueueName;

/// Claims older than this are assumed to belong to a dead worker.
pub const STALE_CLAIM_AFTER: Duration = Duration::from_secs(15 * 60);

pub type Task = JoinHandle<Result<()>>;

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

pub fn matching_registry(settings: &Settings) -> Result<AgentRegistry<dyn MatchingAgent>> {
    let mut reg: AgentRegistry<dyn MatchingAgent> = AgentRegistry::new();
    for scheme in &settings.matching.schemes {
        reg.register(
            scheme.slug.clone(),
            Arc::new(FieldMatchingAgent::from_settings(scheme)),
        )
        .with_context(|| format!("matching agent for '{}'", scheme.slug))?;
    }
    Ok(reg)
}

/// A configured destination without its URL is a fatal startup fault.
pub fn export_registry(settings: &Settings) -> Result<AgentRegistry<dyn ExportAgent>> {
    let mut reg: AgentRegistry<dyn ExportAgent> = AgentRegistry::new();
    for dest in &settings.export.destinations {
        let agent = HttpExportAgent::from_settings(dest, settings.export.timeout_ms)
            .with_context(|| format!("export destination '{}'", dest.slug))?;
        reg.register(dest.slug.clone(), Arc::new(agent))
            .with_context(|| format!("export agent for '{}'", dest.slug))?;
    }
    Ok(reg)
}

pub fn build_context(
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    backend: Arc<dyn JobQueue>,
    resolver: Arc<dyn IdentityResolver>,
) -> Result<PipelineContext> {
    let queues = Queues::new(
        backend,
        settings.queues.limits.clone(),
        settings.queues.enqueue_retry.clone(),
    );
    let matching = matching_registry(&settings)?;
    let exports = export_registry(&settings)?;
    info!(
        schemes = ?matching.slugs(),
        destinations = ?exports.slugs(),
        "agent registries built"
    );
    Ok(PipelineContext::new(settings, store, queues, resolver)
        .with_matching_agents(matching)
        .with_export_agents(exports))
}

/// Lock owner for this process: `HOSTNAME` when set, plus a random suffix so
/// two processes on one host never share an identity.
pub fn process_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "mb".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn worker_count(settings: &Settings, queue: QueueName) -> usize {
    let w = &settings.workers;
    match queue {
        QueueName::Import => w.import,
        QueueName::Identify => w.identify,
        QueueName::Matching => w.matching,
        QueueName::Export => w.export,
    }
}

/// Spawn `workers.<queue>` workers per queue.
pub fn spawn_workers(
    ctx: &PipelineContext,
    owner: &str,
    shutdown: &watch::Receiver<bool>,
) -> Vec<Task> {
    let dispatcher = Dispatcher::new(ctx.clone());
    let poll = Duration::from_millis(ctx.settings.workers.poll_interval_ms);
    let mut tasks = Vec::new();
    for queue in QueueName::ALL {
        let n = worker_count(&ctx.settings, queue);
        if n == 0 {
            warn!(queue = %queue, "no workers configured; queue will not drain here");
        }
        for i in 0..n {
            let worker = Worker::new(
                format!("{owner}/{queue}-{i}"),
                queue,
                ctx.queues.backend().clone(),
                dispatcher.clone(),
                ctx.debug(),
            );
            tasks.push(tokio::spawn(worker.run(poll, shutdown.clone())));
        }
    }
    tasks
}

/// One scheduler per scheduled job, all sharing `leader`.
pub fn spawn_schedulers(
    ctx: &PipelineContext,
    leader: Arc<LeaderElection>,
    shutdown: &watch::Receiver<bool>,
) -> Result<Vec<Task>> {
    let interval = Duration::from_secs(ctx.settings.scheduler.poll_interval_secs);
    let prefix = ctx.settings.scheduler.config_key_prefix.clone();
    let mut tasks = Vec::with_capacity(ScheduledJobKey::ALL.len());
    for job in ScheduledJobKey::ALL {
        let scheduler = CronScheduler::new(
            job,
            &prefix,
            ctx.store.clone(),
            leader.clone(),
            Arc::new(PipelineTask::new(job, ctx.clone())),
            ctx.debug(),
        )?;
        tasks.push(tokio::spawn(scheduler.run(interval, shutdown.clone())));
    }
    Ok(tasks)
}

/// Periodically hand claims abandoned by crashed workers back to READY.
pub fn spawn_claim_recovery(
    queue: PgJobQueue,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Task {
    tokio::spawn(async move {
        loop {
            match queue.recover_stale_claims(STALE_CLAIM_AFTER).await {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "stale job claims returned to ready"),
                Err(e) => warn!(error = %e, "stale claim recovery failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    })
}
