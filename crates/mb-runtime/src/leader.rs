//! Per-tick leader election over the shared lock store.
//!
//! Each scheduled job has its own lock (named after the job). A process leads
//! a tick only if one atomic check-and-set in the store succeeds: the lock is
//! free, expired, or already ours. Expiry is short, so a crashed leader is
//! superseded within one TTL.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use mb_db::Store;

pub struct LeaderElection {
    store: Arc<dyn Store>,
    owner: String,
    ttl: Duration,
    held: Mutex<BTreeSet<String>>,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn Store>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claim (or extend) `lock` for this process. `false` means another
    /// process holds an unexpired claim.
    pub async fn try_lead(&self, lock: &str) -> Result<bool> {
        let won = self
            .store
            .try_acquire_lock(lock, &self.owner, self.ttl)
            .await?;
        let changed = match self.held.lock() {
            Ok(mut held) if won => held.insert(lock.to_string()),
            Ok(mut held) => held.remove(lock),
            Err(_) => false,
        };
        if changed {
            info!(lock, owner = %self.owner, leader = won, "leadership changed");
        } else {
            debug!(lock, owner = %self.owner, leader = won, "leadership checked");
        }
        Ok(won)
    }

    pub async fn release(&self, lock: &str) -> Result<()> {
        self.store.release_lock(lock, &self.owner).await?;
        if let Ok(mut held) = self.held.lock() {
            held.remove(lock);
        }
        Ok(())
    }

    /// Locks this process won on its most recent attempt.
    pub fn held_locks(&self) -> Vec<String> {
        self.held
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}
