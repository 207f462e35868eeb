//! Per-provider file sequence numbers.
//!
//! Numbers are reserved in ranges: a caller asks for `count` values and gets
//! `[start, start + count)` back from a single atomic advance, so concurrent
//! batches from the same provider never share a number. A batch that fails
//! after reserving leaves a gap; numbers are never handed out twice.

use std::ops::Range;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info};

use mb_db::Store;

#[derive(Clone)]
pub struct Sequencer {
    store: Arc<dyn Store>,
    default_start: i64,
}

impl Sequencer {
    pub fn new(store: Arc<dyn Store>, default_start: i64) -> Self {
        Self {
            store,
            default_start,
        }
    }

    /// Next number that would be handed out. Creates the provider's row on
    /// first use.
    pub async fn next_value(&self, provider_slug: &str) -> Result<i64> {
        self.store.next_value(provider_slug, self.default_start).await
    }

    /// Operator override, e.g. to realign with a destination after manual
    /// intervention.
    pub async fn set_next_value(&self, provider_slug: &str, value: i64) -> Result<()> {
        if value < 1 {
            bail!("sequence value for '{provider_slug}' must be >= 1, got {value}");
        }
        self.store.set_next_value(provider_slug, value).await?;
        info!(provider_slug, next_value = value, "file sequence reset");
        Ok(())
    }

    pub async fn reserve(&self, provider_slug: &str, count: i64) -> Result<Range<i64>> {
        if count < 1 {
            bail!("cannot reserve {count} sequence numbers for '{provider_slug}'");
        }
        let start = self
            .store
            .reserve_sequence(provider_slug, count, self.default_start)
            .await?;
        debug!(provider_slug, start, count, "file sequence reserved");
        Ok(start..start + count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_testkit::MemStore;

    #[tokio::test]
    async fn reservations_advance_by_count() {
        let seq = Sequencer::new(Arc::new(MemStore::new()), 1);

        assert_eq!(seq.next_value("iceland").await.unwrap(), 1);
        assert_eq!(seq.reserve("iceland", 3).await.unwrap(), 1..4);
        assert_eq!(seq.reserve("iceland", 2).await.unwrap(), 4..6);
        assert_eq!(seq.next_value("iceland").await.unwrap(), 6);
        assert_eq!(seq.next_value("wasabi").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected() {
        let seq = Sequencer::new(Arc::new(MemStore::new()), 1);
        assert!(seq.reserve("iceland", 0).await.is_err());
        assert!(seq.set_next_value("iceland", 0).await.is_err());

        seq.set_next_value("iceland", 40).await.unwrap();
        assert_eq!(seq.reserve("iceland", 1).await.unwrap(), 40..41);
    }
}
