//! Shared runtime state for mb-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Everything here is a
//! shared handle onto the same store, queues and leader election the workers
//! and schedulers use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mb_db::Store;
use mb_queue::Queues;
use mb_runtime::LeaderElection;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    /// SHA-256 of the canonical merged config.
    pub config_hash: String,
    pub store: Arc<dyn Store>,
    pub queues: Queues,
    pub leader: Arc<LeaderElection>,
}

impl AppState {
    pub fn new(
        config_hash: impl Into<String>,
        store: Arc<dyn Store>,
        queues: Queues,
        leader: Arc<LeaderElection>,
    ) -> Self {
        Self {
            build: BuildInfo {
                service: "mb-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config_hash: config_hash.into(),
            store,
            queues,
            leader,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
