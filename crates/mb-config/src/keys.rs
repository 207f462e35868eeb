//! Keys into the runtime-mutable `config_items` store.

/// Namespace prepended to every config-item key.
pub const DEFAULT_KEY_PREFIX: &str = "mb:";

/// Periodic jobs whose schedule is read from the config-item store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledJobKey {
    IdentifyRetry,
    MatchingRetry,
    ExportRetry,
    BatchExport,
    SchemeRescan,
}

impl ScheduledJobKey {
    pub const ALL: [ScheduledJobKey; 5] = [
        ScheduledJobKey::IdentifyRetry,
        ScheduledJobKey::MatchingRetry,
        ScheduledJobKey::ExportRetry,
        ScheduledJobKey::BatchExport,
        ScheduledJobKey::SchemeRescan,
    ];

    /// Stable name, also used as the leader-lock name.
    pub fn name(&self) -> &'static str {
        match self {
            ScheduledJobKey::IdentifyRetry => "identify-retry",
            ScheduledJobKey::MatchingRetry => "matching-retry",
            ScheduledJobKey::ExportRetry => "export-retry",
            ScheduledJobKey::BatchExport => "batch-export",
            ScheduledJobKey::SchemeRescan => "scheme-rescan",
        }
    }

    /// Crontab expression used when the store holds no value.
    pub fn default_schedule(&self) -> &'static str {
        match self {
            ScheduledJobKey::IdentifyRetry => "*/5 * * * *",
            ScheduledJobKey::MatchingRetry => "*/5 * * * *",
            ScheduledJobKey::ExportRetry => "* * * * *",
            ScheduledJobKey::BatchExport => "0 */1 * * *",
            ScheduledJobKey::SchemeRescan => "30 * * * *",
        }
    }
}

/// `<prefix><job>.schedule`, e.g. `mb:identify-retry.schedule`.
pub fn schedule_key(prefix: &str, job: ScheduledJobKey) -> String {
    format!("{prefix}{}.schedule", job.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_key_is_prefixed() {
        assert_eq!(
            schedule_key(DEFAULT_KEY_PREFIX, ScheduledJobKey::IdentifyRetry),
            "mb:identify-retry.schedule"
        );
    }
}
