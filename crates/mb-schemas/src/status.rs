//! Status and classification enums.
//!
//! Every enum is stored as an upper-case text column. `as_str` / `parse` are
//! the only conversions; unknown strings are rejected rather than defaulted.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }

            pub fn parse(s: &str) -> Result<Self> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(anyhow!(concat!("invalid ", stringify!($name), ": {}"), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum! {
    /// Which upstream feed produced a transaction leg.
    pub enum FeedType {
        /// Merchant / loyalty-scheme feed.
        Merchant => "MERCHANT",
        /// Card network authorisation.
        Auth => "AUTH",
        /// Card network settlement.
        Settled => "SETTLED",
        Refund => "REFUND",
    }
}

impl FeedType {
    /// Payment-network feeds (everything except the merchant feed).
    pub fn is_payment(&self) -> bool {
        !matches!(self, FeedType::Merchant)
    }
}

text_enum! {
    /// Lifecycle of a row in the feed-agnostic `transactions` ledger.
    pub enum TransactionStatus {
        Pending => "PENDING",
        Imported => "IMPORTED",
        Matched => "MATCHED",
        Exported => "EXPORTED",
        ExportFailed => "EXPORT_FAILED",
    }
}

text_enum! {
    pub enum PaymentTransactionStatus {
        Pending => "PENDING",
        Matched => "MATCHED",
        Exported => "EXPORTED",
    }
}

impl PaymentTransactionStatus {
    /// `true` once the leg has contributed to a match; later deliveries for the
    /// same leg are duplicates.
    pub fn is_settled_into_match(&self) -> bool {
        !matches!(self, PaymentTransactionStatus::Pending)
    }
}

text_enum! {
    pub enum SchemeTransactionStatus {
        Pending => "PENDING",
        Matched => "MATCHED",
        Exported => "EXPORTED",
    }
}

text_enum! {
    pub enum IdentifierType {
        Primary => "PRIMARY",
        Secondary => "SECONDARY",
        Psimi => "PSIMI",
    }
}

text_enum! {
    /// How a matched transaction was produced.
    pub enum MatchingType {
        /// Payment leg alone was sufficient; no scheme leg participates.
        Spotted => "SPOTTED",
        Loyalty => "LOYALTY",
        NonLoyalty => "NON_LOYALTY",
        Mixed => "MIXED",
        Forced => "FORCED",
    }
}

text_enum! {
    pub enum MatchedTransactionStatus {
        Pending => "PENDING",
        Exported => "EXPORTED",
        ExportFailed => "EXPORT_FAILED",
    }
}

text_enum! {
    pub enum ExportTransactionStatus {
        Pending => "PENDING",
        Exported => "EXPORTED",
        ExportFailed => "EXPORT_FAILED",
    }
}

text_enum! {
    /// Entity families tracked in the generic retry store. Exports carry their
    /// own retry bookkeeping on `pending_exports`.
    pub enum RetryKind {
        Identify => "IDENTIFY",
        Matching => "MATCHING",
    }
}
