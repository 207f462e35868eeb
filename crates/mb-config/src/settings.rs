use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_KEY_PREFIX;

/// Upper bound for `retry.max_delay_secs` (30 days).
pub const MAX_RETRY_DELAY_SECS: i64 = 30 * 24 * 60 * 60;

/// Typed process settings. Every section has defaults so a deployment only
/// writes the keys it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Fail-fast mode: transient and configuration faults propagate instead of
    /// being logged and left for retry. Never enable in production.
    pub debug: bool,
    pub database: DatabaseSettings,
    pub queues: QueueSettings,
    pub workers: WorkerSettings,
    pub retry: RetrySettings,
    pub scheduler: SchedulerSettings,
    pub identify: IdentifySettings,
    pub matching: MatchingSettings,
    pub export: ExportSettings,
    pub http: HttpSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.database.url_env.trim().is_empty() {
            bail!("database.url_env must name an environment variable");
        }
        if self.retry.base_delay_secs <= 0 || self.retry.max_delay_secs < self.retry.base_delay_secs
        {
            bail!(
                "retry delays invalid: base={} max={}",
                self.retry.base_delay_secs,
                self.retry.max_delay_secs
            );
        }
        if self.retry.max_delay_secs > MAX_RETRY_DELAY_SECS {
            bail!(
                "retry.max_delay_secs must be <= {MAX_RETRY_DELAY_SECS}, got {}",
                self.retry.max_delay_secs
            );
        }
        if self.scheduler.lock_ttl_secs == 0 {
            bail!("scheduler.lock_ttl_secs must be > 0");
        }
        // A claim must outlive the slowest peer's poll, or a lagging node
        // finds it expired and runs the same tick again.
        if self.scheduler.poll_interval_secs >= self.scheduler.lock_ttl_secs {
            bail!(
                "scheduler.poll_interval_secs ({}) must be below scheduler.lock_ttl_secs ({})",
                self.scheduler.poll_interval_secs,
                self.scheduler.lock_ttl_secs
            );
        }
        if self.export.batch_size == 0 {
            bail!("export.batch_size must be > 0");
        }
        if self.export.default_sequence_start < 1 {
            bail!("export.default_sequence_start must be >= 1");
        }
        for scheme in &self.matching.schemes {
            if scheme.slug.trim().is_empty() {
                bail!("matching.schemes entries need a slug");
            }
            if scheme.date_window_secs < 0 {
                bail!("matching scheme '{}': date_window_secs must be >= 0", scheme.slug);
            }
        }
        for dest in &self.export.destinations {
            if dest.slug.trim().is_empty() || dest.url_env.trim().is_empty() {
                bail!("export.destinations entries need a slug and url_env");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Name of the environment variable holding the connection URL.
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url_env: "MB_DATABASE_URL".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub limits: QueueLimits,
    pub enqueue_retry: BackoffSettings,
    pub redelivery: RedeliverySettings,
}

/// Soft per-queue capacity. Exceeding it is logged, not enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    pub import: u64,
    pub identify: u64,
    pub matching: u64,
    pub export: u64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            import: 10_000,
            identify: 10_000,
            matching: 10_000,
            export: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliverySettings {
    /// Deliveries before a failing job is parked as DEAD.
    pub max_attempts: i32,
    pub base_delay_secs: i64,
}

impl Default for RedeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub poll_interval_ms: u64,
    pub import: usize,
    pub identify: usize,
    pub matching: usize,
    pub export: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            import: 1,
            identify: 2,
            matching: 2,
            export: 1,
        }
    }
}

/// One backoff policy for every retry family:
/// `delay = min(base_delay_secs * 2^retry_count, max_delay_secs)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    /// Matching attempts (no-match or agent fault) before the retry store
    /// stops scheduling; the scheme-side rescan still covers late arrivals.
    pub max_matching_attempts: i32,
    pub max_identify_attempts: i32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 6 * 60 * 60,
            max_matching_attempts: 10,
            max_identify_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub lock_ttl_secs: u64,
    pub poll_interval_secs: u64,
    pub config_key_prefix: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 10,
            poll_interval_secs: 5,
            config_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifySettings {
    /// Environment variable naming the identity service base URL. Unset means
    /// identification cannot run; the daemon refuses to start.
    pub service_url_env: String,
    pub timeout_ms: u64,
}

impl Default for IdentifySettings {
    fn default() -> Self {
        Self {
            service_url_env: "MB_IDENTITY_URL".to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    /// Schemes matched by the field matching agent. Schemes not listed here
    /// have no agent and are skipped.
    pub schemes: Vec<SchemeMatchingSettings>,
    /// How far back the scheduled scheme rescan looks for late arrivals.
    pub rescan_lookback_secs: i64,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            schemes: Vec::new(),
            rescan_lookback_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemeMatchingSettings {
    pub slug: String,
    /// Maximum distance between payment and scheme transaction dates.
    pub date_window_secs: i64,
    /// Spotted schemes send no feed of their own; every identified payment
    /// leg matches on its own.
    pub spotted: bool,
}

impl Default for SchemeMatchingSettings {
    fn default() -> Self {
        Self {
            slug: String::new(),
            date_window_secs: 24 * 60 * 60,
            spotted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Maximum transactions per file for batch-style export agents.
    pub batch_size: usize,
    /// First sequence number handed out for a provider with no row yet.
    pub default_sequence_start: i64,
    pub timeout_ms: u64,
    pub destinations: Vec<DestinationSettings>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            default_sequence_start: 1,
            timeout_ms: 10_000,
            destinations: Vec::new(),
        }
    }
}

/// One export destination, keyed by loyalty-scheme slug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationSettings {
    pub slug: String,
    /// Environment variable naming the destination endpoint.
    pub url_env: String,
    /// Deliver in sequence-numbered files instead of one request per export.
    pub batch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind_addr: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8898".to_string(),
        }
    }
}
