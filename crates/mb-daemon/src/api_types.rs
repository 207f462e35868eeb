//! Response types for the mb-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queue: String,
    /// Ready plus claimed jobs.
    pub depth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub config_hash: String,
    /// Identity this process writes into leader locks.
    pub owner: String,
    /// Scheduled-job locks this process won on its latest tick.
    pub leader_locks: Vec<String>,
    pub queues: Vec<QueueDepth>,
    pub pending_exports: i64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body for 503 responses when a backing store cannot be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableResponse {
    pub error: String,
    /// Which dependency failed: "queue" | "store"
    pub dependency: String,
}
