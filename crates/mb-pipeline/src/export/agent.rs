use async_trait::async_trait;

use mb_schemas::{ExportTransaction, PendingExport};

use crate::error::ExportAgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// One request per export, driven by the export queue.
    Singular,
    /// Exports accumulate and are shipped by the scheduled batch run under a
    /// file sequence number.
    Batch,
}

/// Delivery of export snapshots to one destination.
///
/// `Err(Rejected)` and `Err(Transport)` are both retried; the distinction is
/// kept for the failure reason.
#[async_trait]
pub trait ExportAgent: Send + Sync {
    fn mode(&self) -> ExportMode {
        ExportMode::Singular
    }

    async fn export(
        &self,
        export: &ExportTransaction,
        pending: &PendingExport,
    ) -> Result<(), ExportAgentError>;

    async fn export_batch(
        &self,
        exports: &[ExportTransaction],
        sequence_number: i64,
    ) -> Result<(), ExportAgentError> {
        let _ = (exports, sequence_number);
        Err(ExportAgentError::Rejected(
            "agent does not support batch export".to_string(),
        ))
    }
}
