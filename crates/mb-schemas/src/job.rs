use serde::{Deserialize, Serialize};

use crate::TransactionRecord;

/// Named work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Import,
    Identify,
    Matching,
    Export,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Import,
        QueueName::Identify,
        QueueName::Matching,
        QueueName::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Import => "import",
            QueueName::Identify => "identify",
            QueueName::Matching => "matching",
            QueueName::Export => "export",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "import" => Ok(QueueName::Import),
            "identify" => Ok(QueueName::Identify),
            "matching" => Ok(QueueName::Matching),
            "export" => Ok(QueueName::Export),
            other => Err(anyhow::anyhow!("invalid queue name: {}", other)),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work. Serialised as JSON into the queue payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Scheme-feed rows ingested together under one match group.
    ImportSchemeTransactions {
        match_group: String,
        records: Vec<TransactionRecord>,
    },
    /// A single payment-feed leg (AUTH, SETTLED or REFUND).
    ImportPaymentTransaction {
        match_group: String,
        record: TransactionRecord,
    },
    IdentifyPayment { payment_transaction_id: i64 },
    MatchPayment { payment_transaction_id: i64 },
    MatchSchemeGroup { match_group: String },
    ExportMatched { matched_transaction_id: i64 },
    ExportPending { pending_export_id: i64 },
}

impl Job {
    pub fn queue(&self) -> QueueName {
        match self {
            Job::ImportSchemeTransactions { .. } | Job::ImportPaymentTransaction { .. } => {
                QueueName::Import
            }
            Job::IdentifyPayment { .. } => QueueName::Identify,
            Job::MatchPayment { .. } | Job::MatchSchemeGroup { .. } => QueueName::Matching,
            Job::ExportMatched { .. } | Job::ExportPending { .. } => QueueName::Export,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::ImportSchemeTransactions { .. } => "import_scheme_transactions",
            Job::ImportPaymentTransaction { .. } => "import_payment_transaction",
            Job::IdentifyPayment { .. } => "identify_payment",
            Job::MatchPayment { .. } => "match_payment",
            Job::MatchSchemeGroup { .. } => "match_scheme_group",
            Job::ExportMatched { .. } => "export_matched",
            Job::ExportPending { .. } => "export_pending",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_route_to_their_queue() {
        assert_eq!(
            Job::IdentifyPayment { payment_transaction_id: 1 }.queue(),
            QueueName::Identify
        );
        assert_eq!(
            Job::MatchSchemeGroup { match_group: "g".into() }.queue(),
            QueueName::Matching
        );
        assert_eq!(
            Job::ExportPending { pending_export_id: 3 }.queue(),
            QueueName::Export
        );
    }

    #[test]
    fn job_payload_is_tagged() {
        let v = serde_json::to_value(Job::MatchPayment { payment_transaction_id: 7 }).unwrap();
        assert_eq!(v["job"], "match_payment");
        assert_eq!(v["payment_transaction_id"], 7);
        let back: Job = serde_json::from_value(v).unwrap();
        assert_eq!(back, Job::MatchPayment { payment_transaction_id: 7 });
    }

    #[test]
    fn queue_name_parse_matches_as_str() {
        for q in QueueName::ALL {
            assert_eq!(QueueName::parse(q.as_str()).unwrap(), q);
        }
    }
}
