//! mb-runtime
//!
//! Long-running loops around the pipeline directors:
//!
//! - [`Worker`]: pulls one queue and dispatches each job
//! - [`CronScheduler`]: fires a scheduled job on its crontab, re-reading the
//!   expression from the config-item store every poll
//! - [`LeaderElection`]: per-job lock so only one process in the fleet runs
//!   a given tick
//! - [`PipelineTask`]: the sweep or batch body behind each scheduled job

mod jobs;
mod leader;
mod scheduler;
mod worker;

pub use jobs::PipelineTask;
pub use leader::LeaderElection;
pub use scheduler::{parse_schedule, CronScheduler, ScheduledTask, TickOutcome};
pub use worker::{WorkOutcome, Worker};
