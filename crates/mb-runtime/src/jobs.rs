//! Bodies of the scheduled jobs, bound to a pipeline context.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use mb_config::ScheduledJobKey;
use mb_pipeline::{ExportDirector, MatchingDirector, PipelineContext, RetrySweeper};

use crate::scheduler::ScheduledTask;

pub struct PipelineTask {
    job: ScheduledJobKey,
    ctx: PipelineContext,
}

impl PipelineTask {
    pub fn new(job: ScheduledJobKey, ctx: PipelineContext) -> Self {
        Self { job, ctx }
    }
}

#[async_trait]
impl ScheduledTask for PipelineTask {
    async fn run(&self) -> Result<()> {
        let sweeper = RetrySweeper::new(self.ctx.clone());
        match self.job {
            ScheduledJobKey::IdentifyRetry => {
                sweeper.sweep_identify().await?;
            }
            ScheduledJobKey::MatchingRetry => {
                sweeper.sweep_matching().await?;
            }
            ScheduledJobKey::ExportRetry => {
                sweeper.sweep_exports().await?;
            }
            ScheduledJobKey::BatchExport => {
                ExportDirector::new(self.ctx.clone())
                    .run_batch_export()
                    .await?;
            }
            ScheduledJobKey::SchemeRescan => {
                let lookback = Duration::seconds(self.ctx.settings.matching.rescan_lookback_secs);
                let from_date = self.ctx.now() - lookback;
                let requeued = MatchingDirector::new(self.ctx.clone())
                    .handle_scheme_transactions(from_date)
                    .await?;
                info!(%from_date, requeued = requeued.len(), "scheme rescan tick");
            }
        }
        Ok(())
    }
}
