//! mb-pipeline
//!
//! Directors for the reconciliation pipeline and the pieces they share:
//!
//! - import: ledger dedup and the AUTH/SETTLED settlement override
//! - identify: attach a loyalty identity via the external resolver
//! - matching: pluggable per-scheme agents, reverse matching by scheme group
//! - export: snapshot, singular delivery, scheduled batch delivery
//! - retry: clear-before-enqueue sweeps over pending exports and retry entries
//!
//! Directors never panic on bad input; every failure carries an
//! [`ErrorClass`] and the worker decides ack vs. redelivery from it.

mod backoff;
mod context;
mod dispatch;
mod error;
mod export;
mod http;
mod identify;
mod import;
mod matching;
mod registry;
mod retry;
mod sequencer;

#[cfg(test)]
mod test_support;

pub use backoff::{next_retry_at, retry_delay};
pub use context::{Clock, PipelineContext};
pub use dispatch::{DispatchError, Dispatcher};
pub use error::{
    AgentError, DebugMode, ErrorClass, ExportAgentError, ExportError, IdentifyError, ImportError,
    MatchingError, RegistryError,
};
pub use export::{BatchReport, ExportAgent, ExportDirector, ExportMode, ExportOutcome};
pub use http::{HttpExportAgent, HttpIdentityResolver};
pub use identify::{IdentifyDirector, IdentifyOutcome, IdentityResolver};
pub use import::{ImportDirector, ImportOutcome, SchemeImportSummary};
pub use matching::{
    FieldMatchMode, FieldMatchingAgent, MatchContext, MatchError, MatchOutcome, MatchResult,
    MatchingAgent, MatchingDirector,
};
pub use registry::AgentRegistry;
pub use retry::{RetryScheduled, RetrySweeper, SweepReport};
pub use sequencer::Sequencer;
