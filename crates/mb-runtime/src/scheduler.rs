//! Leader-elected cron scheduler.
//!
//! Every poll re-reads the job's schedule from the config-item store, so an
//! operator can change it at runtime. A changed expression reschedules from
//! the current instant; an unparseable one is logged and the previous
//! schedule stays in force.
//!
//! When a fire time is reached the tick is attempted only after winning the
//! job's leader lock, so across a fleet at most one process runs it. Callback
//! failures are logged and the loop carries on (fail-fast in debug mode).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mb_config::{schedule_key, ScheduledJobKey};
use mb_db::Store;
use mb_pipeline::DebugMode;

use crate::leader::LeaderElection;

/// Body of a scheduled job.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Parse a crontab expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let widened = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&widened).map_err(|e| anyhow!("invalid schedule '{expr}': {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Fire time not reached.
    Idle,
    /// Another process holds the lock for this tick.
    NotLeader,
    Ran,
    /// Callback failed; logged and absorbed.
    Failed,
}

pub struct CronScheduler {
    job: ScheduledJobKey,
    config_key: String,
    store: Arc<dyn Store>,
    leader: Arc<LeaderElection>,
    task: Arc<dyn ScheduledTask>,
    debug: DebugMode,
    expr: String,
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
}

impl CronScheduler {
    pub fn new(
        job: ScheduledJobKey,
        key_prefix: &str,
        store: Arc<dyn Store>,
        leader: Arc<LeaderElection>,
        task: Arc<dyn ScheduledTask>,
        debug: DebugMode,
    ) -> Result<Self> {
        let expr = job.default_schedule().to_string();
        let schedule = parse_schedule(&expr)
            .with_context(|| format!("default schedule for {}", job.name()))?;
        Ok(Self {
            job,
            config_key: schedule_key(key_prefix, job),
            store,
            leader,
            task,
            debug,
            expr,
            schedule,
            next_fire: None,
        })
    }

    pub fn job(&self) -> ScheduledJobKey {
        self.job
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }

    /// One scheduler step at `now`.
    pub async fn poll(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.refresh_schedule(now).await?;

        let Some(due) = self.next_fire else {
            self.next_fire = self.schedule.after(&now).next();
            return Ok(TickOutcome::Idle);
        };
        if now < due {
            return Ok(TickOutcome::Idle);
        }
        self.next_fire = self.schedule.after(&now).next();

        let job = self.job.name();
        if !self.leader.try_lead(job).await? {
            debug!(job, owner = %self.leader.owner(), "tick skipped: not leader");
            return Ok(TickOutcome::NotLeader);
        }

        match self.task.run().await {
            Ok(()) => {
                debug!(job, %due, "scheduled job ran");
                Ok(TickOutcome::Ran)
            }
            Err(e) => {
                error!(job, %due, error = %format!("{e:#}"), "scheduled job failed");
                if self.debug.enabled() {
                    return Err(e.context(format!("scheduled job {job}")));
                }
                Ok(TickOutcome::Failed)
            }
        }
    }

    async fn refresh_schedule(&mut self, now: DateTime<Utc>) -> Result<()> {
        let stored = match self.store.get_config(&self.config_key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %self.config_key, error = %e, "schedule read failed; keeping current");
                return Ok(());
            }
        };
        let expr = stored.unwrap_or_else(|| self.job.default_schedule().to_string());
        if expr == self.expr {
            return Ok(());
        }

        match parse_schedule(&expr) {
            Ok(schedule) => {
                info!(
                    job = self.job.name(),
                    from = %self.expr,
                    to = %expr,
                    "schedule changed; rescheduling"
                );
                self.schedule = schedule;
                self.expr = expr;
                self.next_fire = self.schedule.after(&now).next();
                Ok(())
            }
            Err(e) => {
                warn!(
                    job = self.job.name(),
                    expression = %expr,
                    error = %e,
                    "ignoring invalid schedule"
                );
                if self.debug.enabled() {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Poll every `interval` until `shutdown` flips to `true`, then release
    /// the job's lock.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let job = self.job.name();
        info!(job, expression = %self.expr, owner = %self.leader.owner(), "scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.poll(Utc::now()).await {
                        if self.debug.enabled() {
                            return Err(e);
                        }
                        error!(job, error = %format!("{e:#}"), "scheduler poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.leader.release(job).await?;
        info!(job, "scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_db::ConfigStore;
    use mb_testkit::{ts, MemStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledTask for Counter {
        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("sweep exploded"));
            }
            Ok(())
        }
    }

    fn scheduler(
        store: &Arc<MemStore>,
        owner: &str,
        task: Arc<Counter>,
        debug: bool,
    ) -> CronScheduler {
        let leader = Arc::new(LeaderElection::new(
            store.clone(),
            owner,
            Duration::from_secs(10),
        ));
        CronScheduler::new(
            ScheduledJobKey::ExportRetry,
            "mb:",
            store.clone(),
            leader,
            task,
            DebugMode(debug),
        )
        .unwrap()
    }

    #[test]
    fn five_field_expressions_are_widened() {
        let s = parse_schedule("*/5 * * * *").unwrap();
        let next = s.after(&ts(2024, 3, 1, 12, 1)).next().unwrap();
        assert_eq!(next, ts(2024, 3, 1, 12, 5));
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[tokio::test]
    async fn first_poll_arms_then_fires_on_time() {
        let store = Arc::new(MemStore::new());
        let task = Arc::new(Counter::default());
        let mut s = scheduler(&store, "a", task.clone(), false);

        assert_eq!(s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap(), TickOutcome::Idle);
        assert_eq!(s.next_fire(), Some(ts(2024, 3, 1, 12, 1)));
        assert_eq!(s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap(), TickOutcome::Idle);

        store.set_now(ts(2024, 3, 1, 12, 1));
        assert_eq!(s.poll(ts(2024, 3, 1, 12, 1)).await.unwrap(), TickOutcome::Ran);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert_eq!(s.next_fire(), Some(ts(2024, 3, 1, 12, 2)));
    }

    #[tokio::test]
    async fn only_the_leader_runs_a_tick() {
        let store = Arc::new(MemStore::new());
        let task = Arc::new(Counter::default());
        let mut a = scheduler(&store, "a", task.clone(), false);
        let mut b = scheduler(&store, "b", task.clone(), false);

        let t0 = ts(2024, 3, 1, 12, 0);
        store.set_now(t0);
        a.poll(t0).await.unwrap();
        b.poll(t0).await.unwrap();

        let t1 = ts(2024, 3, 1, 12, 1);
        store.set_now(t1);
        let outcomes = [a.poll(t1).await.unwrap(), b.poll(t1).await.unwrap()];
        assert_eq!(outcomes, [TickOutcome::Ran, TickOutcome::NotLeader]);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stored_schedule_change_reschedules() {
        let store = Arc::new(MemStore::new());
        let task = Arc::new(Counter::default());
        let mut s = scheduler(&store, "a", task, false);

        s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap();
        assert_eq!(s.expression(), "* * * * *");

        store
            .set_config("mb:export-retry.schedule", "0 18 * * *")
            .await
            .unwrap();
        assert_eq!(s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap(), TickOutcome::Idle);
        assert_eq!(s.expression(), "0 18 * * *");
        assert_eq!(s.next_fire(), Some(ts(2024, 3, 1, 18, 0)));
    }

    #[tokio::test]
    async fn invalid_stored_schedule_keeps_the_previous_one() {
        let store = Arc::new(MemStore::new());
        let mut s = scheduler(&store, "a", Arc::new(Counter::default()), false);
        s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap();

        store
            .set_config("mb:export-retry.schedule", "every tuesday")
            .await
            .unwrap();
        s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap();
        assert_eq!(s.expression(), "* * * * *");
        assert_eq!(s.next_fire(), Some(ts(2024, 3, 1, 12, 1)));
    }

    #[tokio::test]
    async fn callback_failure_is_absorbed_unless_debug() {
        let store = Arc::new(MemStore::new());
        store.set_now(ts(2024, 3, 1, 12, 1));
        let task = Arc::new(Counter {
            fail: true,
            ..Counter::default()
        });

        let mut s = scheduler(&store, "a", task.clone(), false);
        s.poll(ts(2024, 3, 1, 12, 0)).await.unwrap();
        assert_eq!(s.poll(ts(2024, 3, 1, 12, 1)).await.unwrap(), TickOutcome::Failed);
        assert_eq!(s.poll(ts(2024, 3, 1, 12, 2)).await.unwrap(), TickOutcome::Failed);

        let mut d = scheduler(&store, "a", task, true);
        d.poll(ts(2024, 3, 1, 12, 2)).await.unwrap();
        let err = d.poll(ts(2024, 3, 1, 12, 3)).await.unwrap_err();
        assert!(format!("{err:#}").contains("sweep exploded"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_releases_the_lock() {
        let store = Arc::new(MemStore::new());
        let s = scheduler(&store, "a", Arc::new(Counter::default()), false);
        let leader = LeaderElection::new(store.clone(), "a", Duration::from_secs(60));
        assert!(leader.try_lead("export-retry").await.unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(Duration::from_millis(5), rx));
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let other = LeaderElection::new(store.clone(), "b", Duration::from_secs(60));
        assert!(other.try_lead("export-retry").await.unwrap());
    }
}
