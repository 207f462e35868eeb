//! Retry spacing shared by identify, matching and export retries.

use chrono::{DateTime, Duration, Utc};

use mb_config::{RetrySettings, MAX_RETRY_DELAY_SECS};

/// `min(base * 2^retry_count, max)`. Negative counts are treated as zero and
/// the result never exceeds [`MAX_RETRY_DELAY_SECS`], whatever the settings say.
pub fn retry_delay(settings: &RetrySettings, retry_count: i32) -> Duration {
    let exp = retry_count.clamp(0, 30) as u32;
    let secs = settings
        .base_delay_secs
        .saturating_mul(1_i64 << exp)
        .min(settings.max_delay_secs)
        .clamp(0, MAX_RETRY_DELAY_SECS);
    Duration::seconds(secs)
}

pub fn next_retry_at(
    settings: &RetrySettings,
    retry_count: i32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    now.checked_add_signed(retry_delay(settings, retry_count))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
