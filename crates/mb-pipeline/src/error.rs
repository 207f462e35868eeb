//! Pipeline error taxonomy.
//!
//! Every error reports an [`ErrorClass`]. Directors use [`DebugMode`] to
//! decide whether a transient or configuration fault is returned to the
//! caller or logged and left for the next retry pass.

use mb_queue::QueueError;
use mb_schemas::FeedType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or contradictory input. Retrying identical input cannot help.
    DataQuality,
    /// Network, agent or database trouble. Safe to retry later.
    Transient,
    /// Missing registry entry or similar; usually a feature not yet enabled.
    Configuration,
    /// The component cannot run at all.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::DataQuality => "data_quality",
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Fatal => "fatal",
        }
    }

    /// Whether a queue redelivery could succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Fail-fast switch. Never enabled in production.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugMode(pub bool);

impl DebugMode {
    pub fn enabled(&self) -> bool {
        self.0
    }

    /// `true` when a fault of `class` must propagate instead of being
    /// absorbed. Data-quality and fatal faults always propagate.
    pub fn propagates(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::DataQuality | ErrorClass::Fatal => true,
            ErrorClass::Transient | ErrorClass::Configuration => self.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateSlug { slug: String },
    EmptySlug,
    NotRegistered { slug: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateSlug { slug } => write!(f, "agent for '{slug}' is already registered"),
            Self::EmptySlug => write!(f, "agent slug must not be empty"),
            Self::NotRegistered { slug } => write!(f, "no agent registered for '{slug}'"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ImportError {
    /// AUTH leg without a settlement key; it could never be reconciled.
    InvalidAuthTransaction { transaction_id: String },
    UnsupportedFeed { feed_type: FeedType },
    Queue(QueueError),
    Store(anyhow::Error),
}

impl ImportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAuthTransaction { .. } | Self::UnsupportedFeed { .. } => {
                ErrorClass::DataQuality
            }
            Self::Queue(_) | Self::Store(_) => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAuthTransaction { transaction_id } => write!(
                f,
                "auth transaction {transaction_id} has no settlement key"
            ),
            Self::UnsupportedFeed { feed_type } => {
                write!(f, "feed {feed_type} is not a payment feed")
            }
            Self::Queue(e) => write!(f, "import enqueue failed: {e}"),
            Self::Store(e) => write!(f, "import store failure: {e:#}"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<anyhow::Error> for ImportError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for ImportError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum IdentifyError {
    TransactionNotFound { id: i64 },
    /// Resolver fault; only returned in debug mode.
    Resolver { id: i64, source: anyhow::Error },
    Queue(QueueError),
    Store(anyhow::Error),
}

impl IdentifyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransactionNotFound { .. } => ErrorClass::DataQuality,
            Self::Resolver { .. } | Self::Queue(_) | Self::Store(_) => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for IdentifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransactionNotFound { id } => write!(f, "payment transaction {id} not found"),
            Self::Resolver { id, source } => {
                write!(f, "identity resolver failed for payment {id}: {source:#}")
            }
            Self::Queue(e) => write!(f, "identify enqueue failed: {e}"),
            Self::Store(e) => write!(f, "identify store failure: {e:#}"),
        }
    }
}

impl std::error::Error for IdentifyError {}

impl From<anyhow::Error> for IdentifyError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for IdentifyError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// A matching-agent fault other than "no match".
#[derive(Debug)]
pub struct AgentError {
    pub scheme_slug: String,
    pub payment_transaction_id: i64,
    pub source: anyhow::Error,
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "matching agent '{}' failed on payment {}: {:#}",
            self.scheme_slug, self.payment_transaction_id, self.source
        )
    }
}

impl std::error::Error for AgentError {}

#[derive(Debug)]
pub enum MatchingError {
    /// Merchant identifiers span more than one loyalty scheme.
    MultipleSchemes {
        payment_transaction_id: i64,
        slugs: Vec<String>,
    },
    TransactionNotFound { id: i64 },
    /// Only returned in debug mode.
    NotRegistered(RegistryError),
    /// Only returned in debug mode.
    Agent(AgentError),
    Queue(QueueError),
    Store(anyhow::Error),
}

impl MatchingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MultipleSchemes { .. } | Self::TransactionNotFound { .. } => {
                ErrorClass::DataQuality
            }
            Self::NotRegistered(_) => ErrorClass::Configuration,
            Self::Agent(_) | Self::Queue(_) | Self::Store(_) => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for MatchingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleSchemes {
                payment_transaction_id,
                slugs,
            } => write!(
                f,
                "payment transaction {payment_transaction_id} spans multiple loyalty schemes: {}",
                slugs.join(", ")
            ),
            Self::TransactionNotFound { id } => write!(f, "payment transaction {id} not found"),
            Self::NotRegistered(e) => write!(f, "{e}"),
            Self::Agent(e) => write!(f, "{e}"),
            Self::Queue(e) => write!(f, "matching enqueue failed: {e}"),
            Self::Store(e) => write!(f, "matching store failure: {e:#}"),
        }
    }
}

impl std::error::Error for MatchingError {}

impl From<anyhow::Error> for MatchingError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for MatchingError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Failure reported by an export agent.
#[derive(Debug)]
pub enum ExportAgentError {
    /// Destination refused the payload.
    Rejected(String),
    /// Destination unreachable or timed out.
    Transport(anyhow::Error),
}

impl std::fmt::Display for ExportAgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Transport(e) => write!(f, "transport: {e:#}"),
        }
    }
}

impl std::error::Error for ExportAgentError {}

#[derive(Debug)]
pub enum ExportError {
    MatchedTransactionNotFound { id: i64 },
    ExportTransactionNotFound { id: i64 },
    /// Only returned in debug mode.
    NotRegistered(RegistryError),
    /// Only returned in debug mode; the failure is recorded for retry first.
    Agent {
        provider_slug: String,
        source: ExportAgentError,
    },
    Queue(QueueError),
    Store(anyhow::Error),
}

impl ExportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MatchedTransactionNotFound { .. } | Self::ExportTransactionNotFound { .. } => {
                ErrorClass::DataQuality
            }
            Self::NotRegistered(_) => ErrorClass::Configuration,
            Self::Agent { .. } | Self::Queue(_) | Self::Store(_) => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MatchedTransactionNotFound { id } => {
                write!(f, "matched transaction {id} not found")
            }
            Self::ExportTransactionNotFound { id } => write!(f, "export transaction {id} not found"),
            Self::NotRegistered(e) => write!(f, "{e}"),
            Self::Agent {
                provider_slug,
                source,
            } => write!(f, "export agent '{provider_slug}' failed: {source}"),
            Self::Queue(e) => write!(f, "export enqueue failed: {e}"),
            Self::Store(e) => write!(f, "export store failure: {e:#}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<anyhow::Error> for ExportError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for ExportError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_mode_only_changes_soft_classes() {
        let prod = DebugMode(false);
        let debug = DebugMode(true);

        assert!(prod.propagates(ErrorClass::DataQuality));
        assert!(prod.propagates(ErrorClass::Fatal));
        assert!(!prod.propagates(ErrorClass::Transient));
        assert!(!prod.propagates(ErrorClass::Configuration));

        assert!(debug.propagates(ErrorClass::Transient));
        assert!(debug.propagates(ErrorClass::Configuration));
    }

    #[test]
    fn auth_without_key_is_data_quality() {
        let e = ImportError::InvalidAuthTransaction {
            transaction_id: "T1".to_string(),
        };
        assert_eq!(e.class(), ErrorClass::DataQuality);
        assert!(!e.class().is_retryable());
        assert_eq!(e.to_string(), "auth transaction T1 has no settlement key");
    }

    #[test]
    fn multiple_schemes_lists_slugs() {
        let e = MatchingError::MultipleSchemes {
            payment_transaction_id: 4,
            slugs: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(e.class(), ErrorClass::DataQuality);
        assert!(e.to_string().ends_with("a, b"));
    }
}
