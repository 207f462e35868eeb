use async_trait::async_trait;

use mb_db::Store;
use mb_schemas::{MerchantIdentifier, NewMatchedTransaction, PaymentTransaction, UserIdentity};

/// What a matching agent sees for one payment leg.
pub struct MatchContext<'a> {
    pub payment: &'a PaymentTransaction,
    pub identity: &'a UserIdentity,
    /// Resolved identifiers of the leg, all within `scheme_slug`.
    pub merchant_identifiers: &'a [MerchantIdentifier],
    pub scheme_slug: &'a str,
    pub store: &'a dyn Store,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched_transaction: NewMatchedTransaction,
    /// `None` for spotted matches, which have no scheme leg.
    pub scheme_transaction_id: Option<i64>,
}

#[derive(Debug)]
pub enum MatchError {
    /// Nothing to match yet. The leg stays PENDING and is retried.
    NoMatch { reason: String },
    /// Anything else the agent could not handle.
    Fault(anyhow::Error),
}

impl MatchError {
    pub fn no_match(reason: impl Into<String>) -> Self {
        Self::NoMatch {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for MatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMatch { reason } => write!(f, "no match: {reason}"),
            Self::Fault(e) => write!(f, "agent fault: {e:#}"),
        }
    }
}

impl std::error::Error for MatchError {}

impl From<anyhow::Error> for MatchError {
    fn from(e: anyhow::Error) -> Self {
        Self::Fault(e)
    }
}

/// Per-scheme correlation strategy, registered by loyalty-scheme slug.
#[async_trait]
pub trait MatchingAgent: Send + Sync {
    async fn find_match(&self, cx: &MatchContext<'_>) -> Result<MatchResult, MatchError>;
}
