//! Job routing: one queued [`Job`] to the director that owns it.

use tracing::debug;

use mb_schemas::Job;

use crate::context::PipelineContext;
use crate::error::{ErrorClass, ExportError, IdentifyError, ImportError, MatchingError};
use crate::export::ExportDirector;
use crate::identify::IdentifyDirector;
use crate::import::ImportDirector;
use crate::matching::MatchingDirector;

#[derive(Debug)]
pub enum DispatchError {
    Import(ImportError),
    Identify(IdentifyError),
    Matching(MatchingError),
    Export(ExportError),
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Import(e) => e.class(),
            Self::Identify(e) => e.class(),
            Self::Matching(e) => e.class(),
            Self::Export(e) => e.class(),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Import(e) => write!(f, "import: {e}"),
            Self::Identify(e) => write!(f, "identify: {e}"),
            Self::Matching(e) => write!(f, "matching: {e}"),
            Self::Export(e) => write!(f, "export: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ImportError> for DispatchError {
    fn from(e: ImportError) -> Self {
        Self::Import(e)
    }
}

impl From<IdentifyError> for DispatchError {
    fn from(e: IdentifyError) -> Self {
        Self::Identify(e)
    }
}

impl From<MatchingError> for DispatchError {
    fn from(e: MatchingError) -> Self {
        Self::Matching(e)
    }
}

impl From<ExportError> for DispatchError {
    fn from(e: ExportError) -> Self {
        Self::Export(e)
    }
}

/// Holds one of each director; cloned into every worker.
#[derive(Clone)]
pub struct Dispatcher {
    import: ImportDirector,
    identify: IdentifyDirector,
    matching: MatchingDirector,
    export: ExportDirector,
}

impl Dispatcher {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            import: ImportDirector::new(ctx.clone()),
            identify: IdentifyDirector::new(ctx.clone()),
            matching: MatchingDirector::new(ctx.clone()),
            export: ExportDirector::new(ctx),
        }
    }

    pub async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        match job {
            Job::ImportSchemeTransactions {
                match_group,
                records,
            } => {
                let summary = self
                    .import
                    .handle_scheme_transactions(records, match_group)
                    .await?;
                debug!(job = job.kind(), inserted = summary.inserted.len(), "job done");
            }
            Job::ImportPaymentTransaction {
                match_group,
                record,
            } => {
                let out = self
                    .import
                    .handle_payment_transaction(record, match_group)
                    .await?;
                debug!(job = job.kind(), outcome = ?out, "job done");
            }
            Job::IdentifyPayment {
                payment_transaction_id,
            } => {
                let out = self
                    .identify
                    .identify_payment_transaction(*payment_transaction_id)
                    .await?;
                debug!(job = job.kind(), outcome = ?out, "job done");
            }
            Job::MatchPayment {
                payment_transaction_id,
            } => {
                let out = self
                    .matching
                    .handle_payment_transaction(*payment_transaction_id)
                    .await?;
                debug!(job = job.kind(), outcome = ?out, "job done");
            }
            Job::MatchSchemeGroup { match_group } => {
                let queued = self
                    .matching
                    .handle_scheme_transactions_in_group(match_group)
                    .await?;
                debug!(job = job.kind(), requeued = queued.len(), "job done");
            }
            Job::ExportMatched {
                matched_transaction_id,
            } => {
                let out = self
                    .export
                    .handle_export_transaction(*matched_transaction_id)
                    .await?;
                debug!(job = job.kind(), outcome = ?out, "job done");
            }
            Job::ExportPending { pending_export_id } => {
                let out = self.export.handle_pending_export(*pending_export_id).await?;
                debug!(job = job.kind(), outcome = ?out, "job done");
            }
        }
        Ok(())
    }

    pub fn matching(&self) -> &MatchingDirector {
        &self.matching
    }

    pub fn export(&self) -> &ExportDirector {
        &self.export
    }
}
