//! Field-comparison matching agent.
//!
//! Loyalty mode pairs a payment leg with a PENDING scheme leg that shares a
//! merchant identifier, spends the same amount in the same currency, and falls
//! within the date window. Remaining ties are narrowed by card first-six /
//! last-four, then by nearest date, then by lowest id so the choice is stable
//! across retries.
//!
//! Spotted mode is for schemes that send no feed: the identified payment leg
//! is the match.

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;

use mb_config::SchemeMatchingSettings;
use mb_schemas::{MatchingType, NewMatchedTransaction, SchemeTransaction};

use super::agent::{MatchContext, MatchError, MatchResult, MatchingAgent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMatchMode {
    Loyalty,
    Spotted,
}

#[derive(Debug, Clone)]
pub struct FieldMatchingAgent {
    date_window: Duration,
    mode: FieldMatchMode,
}

impl FieldMatchingAgent {
    pub fn new(date_window: Duration, mode: FieldMatchMode) -> Self {
        Self { date_window, mode }
    }

    pub fn from_settings(s: &SchemeMatchingSettings) -> Self {
        let mode = if s.spotted {
            FieldMatchMode::Spotted
        } else {
            FieldMatchMode::Loyalty
        };
        Self::new(Duration::seconds(s.date_window_secs), mode)
    }

    fn spotted(&self, cx: &MatchContext<'_>) -> Result<MatchResult, MatchError> {
        let p = cx.payment;
        let Some(mid) = cx.merchant_identifiers.first() else {
            return Err(MatchError::no_match("no merchant identifier in scheme"));
        };
        Ok(MatchResult {
            matched_transaction: NewMatchedTransaction {
                merchant_identifier_id: mid.id,
                primary_identifier: p.primary_identifier.clone(),
                loyalty_scheme_slug: cx.scheme_slug.to_string(),
                transaction_id: p.transaction_id.clone(),
                transaction_date: p.transaction_date,
                spend_amount: p.spend_amount,
                spend_multiplier: p.spend_multiplier,
                spend_currency: p.spend_currency.clone(),
                card_token: p.card_token.clone(),
                matching_type: MatchingType::Spotted,
                payment_transaction_id: p.id,
                scheme_transaction_id: None,
                extra_fields: p.extra_fields.clone(),
            },
            scheme_transaction_id: None,
        })
    }

    async fn loyalty(&self, cx: &MatchContext<'_>) -> Result<MatchResult, MatchError> {
        let p = cx.payment;
        let scheme_mids: Vec<i64> = cx.merchant_identifiers.iter().map(|m| m.id).collect();
        let candidates = cx
            .store
            .pending_scheme_transactions_for_identifiers(&scheme_mids)
            .await?;

        let in_window: Vec<&SchemeTransaction> = candidates
            .iter()
            .filter(|s| {
                s.spend_amount == p.spend_amount
                    && s.spend_currency == p.spend_currency
                    && (s.transaction_date - p.transaction_date).abs() <= self.date_window
            })
            .collect();
        if in_window.is_empty() {
            return Err(MatchError::no_match(format!(
                "{} pending scheme transactions, none within amount/date window",
                candidates.len()
            )));
        }

        let by_card: Vec<&SchemeTransaction> = in_window
            .iter()
            .copied()
            .filter(|s| card_agrees(&s.first_six, &p.first_six) && card_agrees(&s.last_four, &p.last_four))
            .collect();
        let pool = if by_card.is_empty() { &in_window } else { &by_card };

        let Some(best) = pool
            .iter()
            .min_by_key(|s| ((s.transaction_date - p.transaction_date).abs(), s.id))
        else {
            return Err(MatchError::no_match("no candidate after card narrowing"));
        };
        debug!(
            payment_transaction_id = p.id,
            scheme_transaction_id = best.id,
            candidates = pool.len(),
            "field match selected"
        );

        let merchant_identifier_id = best
            .merchant_identifier_ids
            .iter()
            .copied()
            .find(|id| scheme_mids.contains(id))
            .or_else(|| scheme_mids.first().copied())
            .ok_or_else(|| MatchError::no_match("no merchant identifier in scheme"))?;

        Ok(MatchResult {
            matched_transaction: NewMatchedTransaction {
                merchant_identifier_id,
                primary_identifier: best.primary_identifier.clone(),
                loyalty_scheme_slug: cx.scheme_slug.to_string(),
                transaction_id: best.transaction_id.clone(),
                transaction_date: best.transaction_date,
                spend_amount: p.spend_amount,
                spend_multiplier: p.spend_multiplier,
                spend_currency: p.spend_currency.clone(),
                card_token: p.card_token.clone(),
                matching_type: MatchingType::Loyalty,
                payment_transaction_id: p.id,
                scheme_transaction_id: Some(best.id),
                extra_fields: best.extra_fields.clone(),
            },
            scheme_transaction_id: Some(best.id),
        })
    }
}

/// Unknown on either side is not a disagreement.
fn card_agrees(scheme: &Option<String>, payment: &Option<String>) -> bool {
    match (scheme.as_deref(), payment.as_deref()) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[async_trait]
impl MatchingAgent for FieldMatchingAgent {
    async fn find_match(&self, cx: &MatchContext<'_>) -> Result<MatchResult, MatchError> {
        match self.mode {
            FieldMatchMode::Spotted => self.spotted(cx),
            FieldMatchMode::Loyalty => self.loyalty(cx).await,
        }
    }
}
