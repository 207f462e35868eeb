//! In-memory implementation of every store trait.
//!
//! Semantics follow `PgStore` statement for statement: conditional updates
//! refuse rather than overwrite, multi-row units are applied under one lock,
//! and claims clear `retry_at` in the same step that selects the row.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mb_db::{
    ConfigStore, ExportStore, IdentityStore, LedgerKey, LockStore, MatchingStore,
    NewMerchantIdentifier, ReferenceStore, RetryStore, SequenceStore, SettlementOverride,
    TransactionStore,
};
use mb_schemas::{
    ExportTransaction, ExportTransactionStatus, FeedType, MatchedTransaction,
    MatchedTransactionStatus, MerchantIdentifier, NewExportTransaction, NewMatchedTransaction,
    PaymentTransaction, PaymentTransactionStatus, PendingExport, ResolvedIdentity, RetryEntry,
    RetryKind, SchemeTransaction, SchemeTransactionStatus, Transaction, TransactionRecord,
    TransactionStatus, UserIdentity,
};

#[derive(Default)]
struct State {
    next_id: i64,
    ledger: BTreeMap<i64, Transaction>,
    payments: BTreeMap<i64, PaymentTransaction>,
    schemes: BTreeMap<i64, SchemeTransaction>,
    identities: BTreeMap<i64, UserIdentity>,
    loyalty_schemes: BTreeMap<String, i64>,
    payment_providers: BTreeMap<String, i64>,
    merchant_identifiers: BTreeMap<i64, MerchantIdentifier>,
    matched: BTreeMap<i64, MatchedTransaction>,
    exports: BTreeMap<i64, ExportTransaction>,
    pending_exports: BTreeMap<i64, PendingExport>,
    sequences: BTreeMap<String, i64>,
    config: BTreeMap<String, String>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
    retries: HashMap<(RetryKind, i64), RetryEntry>,
    writes: u64,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn ledger_key_exists(&self, key: &LedgerKey) -> bool {
        self.ledger.values().any(|t| LedgerKey::of(&t.record) == *key)
    }

    fn set_ledger_status(&mut self, id: i64, status: TransactionStatus, now: DateTime<Utc>) {
        if let Some(row) = self.ledger.get_mut(&id) {
            row.status = status;
            row.updated_at = now;
        }
    }
}

/// Shared-nothing store for tests. Wrap in `Arc` and hand out as
/// `Arc<dyn Store>`.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
    clock: Mutex<Option<DateTime<Utc>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("mem store lock poisoned"))
    }

    /// Pin the store's notion of "now" (lock expiry, timestamps).
    pub fn set_now(&self, now: DateTime<Utc>) {
        if let Ok(mut c) = self.clock.lock() {
            *c = Some(now);
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock
            .lock()
            .ok()
            .and_then(|c| *c)
            .unwrap_or_else(Utc::now)
    }

    /// Number of mutating operations that changed state.
    pub fn writes(&self) -> u64 {
        self.lock().map(|s| s.writes).unwrap_or(0)
    }

    pub fn ledger_rows(&self) -> Vec<Transaction> {
        self.lock()
            .map(|s| s.ledger.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn payment_transactions(&self) -> Vec<PaymentTransaction> {
        self.lock()
            .map(|s| s.payments.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn scheme_transactions(&self) -> Vec<SchemeTransaction> {
        self.lock()
            .map(|s| s.schemes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn matched_transactions(&self) -> Vec<MatchedTransaction> {
        self.lock()
            .map(|s| s.matched.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn export_transactions(&self) -> Vec<ExportTransaction> {
        self.lock()
            .map(|s| s.exports.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_exports(&self) -> Vec<PendingExport> {
        self.lock()
            .map(|s| s.pending_exports.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn retry_entries(&self) -> Vec<RetryEntry> {
        let mut out: Vec<RetryEntry> = self
            .lock()
            .map(|s| s.retries.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| (r.kind.as_str(), r.entity_id));
        out
    }
}

fn overlaps(a: &[i64], b: &[i64]) -> bool {
    a.iter().any(|x| b.contains(x))
}

/// `coalesce(nullif(cur, ''), new)`
fn fill_if_absent(cur: &mut Option<String>, new: &Option<String>) {
    if cur.as_deref().map_or(true, str::is_empty) {
        *cur = new.clone();
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

fn insert_ledger(
    st: &mut State,
    match_group: &str,
    record: &TransactionRecord,
    now: DateTime<Utc>,
) -> Option<i64> {
    if st.ledger_key_exists(&LedgerKey::of(record)) {
        return None;
    }
    let id = st.id();
    let mut record = record.clone();
    record.settlement_key = record.settlement_key().map(str::to_string);
    st.ledger.insert(
        id,
        Transaction {
            id,
            record,
            match_group: match_group.to_string(),
            status: TransactionStatus::Imported,
            created_at: now,
            updated_at: now,
        },
    );
    Some(id)
}

#[async_trait]
impl TransactionStore for MemStore {
    async fn existing_ledger_keys(&self, keys: &[LedgerKey]) -> Result<HashSet<LedgerKey>> {
        let st = self.lock()?;
        let wanted: HashSet<&LedgerKey> = keys.iter().collect();
        Ok(st
            .ledger
            .values()
            .map(|t| LedgerKey::of(&t.record))
            .filter(|k| wanted.contains(k))
            .collect())
    }

    async fn fetch_ledger_row(&self, key: &LedgerKey) -> Result<Option<Transaction>> {
        let st = self.lock()?;
        Ok(st
            .ledger
            .values()
            .find(|t| LedgerKey::of(&t.record) == *key)
            .cloned())
    }

    async fn insert_scheme_transactions(
        &self,
        match_group: &str,
        records: &[TransactionRecord],
    ) -> Result<Vec<i64>> {
        let now = self.now();
        let mut st = self.lock()?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let Some(ledger_id) = insert_ledger(&mut st, match_group, record, now) else {
                continue;
            };
            let id = st.id();
            st.schemes.insert(
                id,
                SchemeTransaction {
                    id,
                    ledger_id,
                    provider_slug: record.provider_slug.clone(),
                    merchant_slug: record.merchant_slug.clone(),
                    transaction_id: record.transaction_id.clone(),
                    match_group: match_group.to_string(),
                    merchant_identifier_ids: record.merchant_identifier_ids.clone(),
                    primary_identifier: record.primary_identifier.clone(),
                    transaction_date: record.transaction_date,
                    has_time: record.has_time,
                    spend_amount: record.spend_amount,
                    spend_multiplier: record.spend_multiplier,
                    spend_currency: record.spend_currency.clone(),
                    first_six: record.first_six.clone(),
                    last_four: record.last_four.clone(),
                    auth_code: record.auth_code.clone(),
                    status: SchemeTransactionStatus::Pending,
                    extra_fields: record.extra_fields.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            ids.push(id);
        }
        if !ids.is_empty() {
            st.writes += 1;
        }
        Ok(ids)
    }

    async fn insert_payment_transaction(
        &self,
        match_group: &str,
        record: &TransactionRecord,
    ) -> Result<Option<PaymentTransaction>> {
        let now = self.now();
        let mut st = self.lock()?;
        let Some(ledger_id) = insert_ledger(&mut st, match_group, record, now) else {
            return Ok(None);
        };
        let id = st.id();
        let payment = PaymentTransaction {
            id,
            ledger_id,
            provider_slug: record.provider_slug.clone(),
            merchant_slug: record.merchant_slug.clone(),
            transaction_id: record.transaction_id.clone(),
            feed_type: record.feed_type,
            settlement_key: record.settlement_key().map(str::to_string),
            merchant_identifier_ids: record.merchant_identifier_ids.clone(),
            primary_identifier: record.primary_identifier.clone(),
            transaction_date: record.transaction_date,
            has_time: record.has_time,
            spend_amount: record.spend_amount,
            spend_multiplier: record.spend_multiplier,
            spend_currency: record.spend_currency.clone(),
            card_token: record.card_token.clone(),
            first_six: record.first_six.clone(),
            last_four: record.last_four.clone(),
            auth_code: record.auth_code.clone(),
            approval_code: record.approval_code.clone(),
            status: PaymentTransactionStatus::Pending,
            extra_fields: record.extra_fields.clone(),
            created_at: now,
            updated_at: now,
        };
        st.payments.insert(id, payment.clone());
        st.writes += 1;
        Ok(Some(payment))
    }

    async fn find_payment_by_settlement_key(
        &self,
        settlement_key: &str,
        feed_type: FeedType,
    ) -> Result<Option<PaymentTransaction>> {
        let st = self.lock()?;
        Ok(st
            .payments
            .values()
            .find(|p| p.feed_type == feed_type && p.settlement_key.as_deref() == Some(settlement_key))
            .cloned())
    }

    async fn apply_settlement_override(
        &self,
        auth_id: i64,
        match_group: &str,
        settled: &TransactionRecord,
    ) -> Result<SettlementOverride> {
        let now = self.now();
        let mut st = self.lock()?;

        if st.ledger_key_exists(&LedgerKey::of(settled)) {
            return Ok(SettlementOverride::AlreadyApplied);
        }
        if !st.payments.get(&auth_id).is_some_and(PaymentTransaction::is_pending) {
            return Ok(SettlementOverride::NotPending);
        }
        insert_ledger(&mut st, match_group, settled, now);

        let updated = match st.payments.get_mut(&auth_id) {
            Some(p) if p.is_pending() => {
                let old_transaction_id = p.transaction_id.clone();
                p.spend_amount = settled.spend_amount;
                p.transaction_id = settled.transaction_id.clone();
                fill_if_absent(&mut p.first_six, &settled.first_six);
                fill_if_absent(&mut p.last_four, &settled.last_four);
                if p.auth_code.is_empty() {
                    p.auth_code = settled.auth_code.clone();
                }
                p.updated_at = now;
                (p.clone(), old_transaction_id)
            }
            _ => return Ok(SettlementOverride::NotPending),
        };
        let (payment, old_transaction_id) = updated;

        if let Some(row) = st.ledger.get_mut(&payment.ledger_id) {
            row.record.spend_amount = payment.spend_amount;
            row.record.transaction_id = payment.transaction_id.clone();
            row.record.first_six = payment.first_six.clone();
            row.record.last_four = payment.last_four.clone();
            row.record.auth_code = payment.auth_code.clone();
            row.updated_at = now;
        }

        if old_transaction_id != payment.transaction_id
            && !st
                .identities
                .values()
                .any(|i| i.transaction_id == payment.transaction_id)
        {
            for ident in st.identities.values_mut() {
                if ident.transaction_id == old_transaction_id {
                    ident.transaction_id = payment.transaction_id.clone();
                    ident.updated_at = now;
                }
            }
        }

        st.writes += 1;
        Ok(SettlementOverride::Applied(payment))
    }

    async fn fetch_payment_transaction(&self, id: i64) -> Result<Option<PaymentTransaction>> {
        Ok(self.lock()?.payments.get(&id).cloned())
    }

    async fn fetch_scheme_transaction(&self, id: i64) -> Result<Option<SchemeTransaction>> {
        Ok(self.lock()?.schemes.get(&id).cloned())
    }

    async fn scheme_transactions_since(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Vec<SchemeTransaction>> {
        let st = self.lock()?;
        Ok(st
            .schemes
            .values()
            .filter(|s| s.created_at >= from_date)
            .cloned()
            .collect())
    }

    async fn scheme_transactions_in_group(
        &self,
        match_group: &str,
    ) -> Result<Vec<SchemeTransaction>> {
        let st = self.lock()?;
        Ok(st
            .schemes
            .values()
            .filter(|s| s.match_group == match_group)
            .cloned()
            .collect())
    }

    async fn pending_scheme_transactions_for_identifiers(
        &self,
        merchant_identifier_ids: &[i64],
    ) -> Result<Vec<SchemeTransaction>> {
        let st = self.lock()?;
        let mut out: Vec<SchemeTransaction> = st
            .schemes
            .values()
            .filter(|s| {
                s.status == SchemeTransactionStatus::Pending
                    && overlaps(&s.merchant_identifier_ids, merchant_identifier_ids)
            })
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.transaction_date, s.id));
        Ok(out)
    }

    async fn pending_identified_payment_ids(
        &self,
        merchant_identifier_ids: &[i64],
    ) -> Result<Vec<i64>> {
        let st = self.lock()?;
        Ok(st
            .payments
            .values()
            .filter(|p| {
                p.is_pending()
                    && overlaps(&p.merchant_identifier_ids, merchant_identifier_ids)
                    && st
                        .identities
                        .values()
                        .any(|i| i.transaction_id == p.transaction_id)
            })
            .map(|p| p.id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[async_trait]
impl IdentityStore for MemStore {
    async fn fetch_identity(&self, transaction_id: &str) -> Result<Option<UserIdentity>> {
        let st = self.lock()?;
        Ok(st
            .identities
            .values()
            .find(|i| i.transaction_id == transaction_id)
            .cloned())
    }

    async fn insert_identity(
        &self,
        transaction_id: &str,
        identity: &ResolvedIdentity,
    ) -> Result<UserIdentity> {
        let now = self.now();
        let mut st = self.lock()?;
        if let Some(existing) = st
            .identities
            .values()
            .find(|i| i.transaction_id == transaction_id)
        {
            return Ok(existing.clone());
        }
        let id = st.id();
        let row = UserIdentity {
            id,
            transaction_id: transaction_id.to_string(),
            identity: identity.clone(),
            created_at: now,
            updated_at: now,
        };
        st.identities.insert(id, row.clone());
        st.writes += 1;
        Ok(row)
    }

    async fn attach_card_metadata(
        &self,
        transaction_id: &str,
        identity: &ResolvedIdentity,
    ) -> Result<()> {
        let now = self.now();
        let mut st = self.lock()?;
        let mut touched = false;
        for row in st.identities.values_mut() {
            if row.transaction_id != transaction_id {
                continue;
            }
            let cur = &mut row.identity;
            cur.payment_card_account_id = cur.payment_card_account_id.or(identity.payment_card_account_id);
            if cur.first_six.is_none() {
                cur.first_six = identity.first_six.clone();
            }
            if cur.last_four.is_none() {
                cur.last_four = identity.last_four.clone();
            }
            cur.expiry_month = cur.expiry_month.or(identity.expiry_month);
            cur.expiry_year = cur.expiry_year.or(identity.expiry_year);
            row.updated_at = now;
            touched = true;
        }
        if touched {
            st.writes += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[async_trait]
impl MatchingStore for MemStore {
    async fn merchant_identifiers(&self, ids: &[i64]) -> Result<Vec<MerchantIdentifier>> {
        let st = self.lock()?;
        Ok(st
            .merchant_identifiers
            .values()
            .filter(|m| ids.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn persist_match(&self, matched: &NewMatchedTransaction) -> Result<Option<i64>> {
        let now = self.now();
        let mut st = self.lock()?;

        let payment_ok = st
            .payments
            .get(&matched.payment_transaction_id)
            .is_some_and(PaymentTransaction::is_pending);
        let scheme_ok = match matched.scheme_transaction_id {
            Some(sid) => st
                .schemes
                .get(&sid)
                .is_some_and(|s| s.status == SchemeTransactionStatus::Pending),
            None => true,
        };
        if !payment_ok || !scheme_ok {
            return Ok(None);
        }

        let mut ledger_ids = Vec::with_capacity(2);
        if let Some(p) = st.payments.get_mut(&matched.payment_transaction_id) {
            p.status = PaymentTransactionStatus::Matched;
            p.updated_at = now;
            ledger_ids.push(p.ledger_id);
        }
        if let Some(sid) = matched.scheme_transaction_id {
            if let Some(s) = st.schemes.get_mut(&sid) {
                s.status = SchemeTransactionStatus::Matched;
                s.updated_at = now;
                ledger_ids.push(s.ledger_id);
            }
        }
        for lid in ledger_ids {
            st.set_ledger_status(lid, TransactionStatus::Matched, now);
        }

        let id = st.id();
        st.matched.insert(
            id,
            MatchedTransaction {
                id,
                fields: matched.clone(),
                status: MatchedTransactionStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        st.writes += 1;
        Ok(Some(id))
    }

    async fn fetch_matched_transaction(&self, id: i64) -> Result<Option<MatchedTransaction>> {
        Ok(self.lock()?.matched.get(&id).cloned())
    }

    async fn fetch_match_for_payment(
        &self,
        payment_transaction_id: i64,
    ) -> Result<Option<MatchedTransaction>> {
        let st = self.lock()?;
        Ok(st
            .matched
            .values()
            .find(|m| m.fields.payment_transaction_id == payment_transaction_id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

fn transition_export_chain(
    st: &mut State,
    export_id: i64,
    status: TransactionStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let (export_status, matched_status) = match status {
        TransactionStatus::Exported => (
            ExportTransactionStatus::Exported,
            MatchedTransactionStatus::Exported,
        ),
        TransactionStatus::ExportFailed => (
            ExportTransactionStatus::ExportFailed,
            MatchedTransactionStatus::ExportFailed,
        ),
        other => bail!("not an export status: {other}"),
    };

    let matched_id = {
        let export = st
            .exports
            .get_mut(&export_id)
            .ok_or_else(|| anyhow!("export transaction {export_id} missing"))?;
        export.status = export_status;
        export.updated_at = now;
        export.fields.matched_transaction_id
    };
    let (payment_id, scheme_id) = {
        let matched = st
            .matched
            .get_mut(&matched_id)
            .ok_or_else(|| anyhow!("matched transaction {matched_id} missing"))?;
        matched.status = matched_status;
        matched.updated_at = now;
        (
            matched.fields.payment_transaction_id,
            matched.fields.scheme_transaction_id,
        )
    };

    let mut ledger_ids = Vec::with_capacity(2);
    if let Some(p) = st.payments.get_mut(&payment_id) {
        if status == TransactionStatus::Exported {
            p.status = PaymentTransactionStatus::Exported;
            p.updated_at = now;
        }
        ledger_ids.push(p.ledger_id);
    }
    if let Some(s) = scheme_id.and_then(|sid| st.schemes.get_mut(&sid)) {
        if status == TransactionStatus::Exported {
            s.status = SchemeTransactionStatus::Exported;
            s.updated_at = now;
        }
        ledger_ids.push(s.ledger_id);
    }
    for lid in ledger_ids {
        st.set_ledger_status(lid, status, now);
    }
    Ok(())
}

#[async_trait]
impl ExportStore for MemStore {
    async fn create_export(
        &self,
        export: &NewExportTransaction,
    ) -> Result<Option<PendingExport>> {
        let now = self.now();
        let mut st = self.lock()?;
        if st
            .exports
            .values()
            .any(|e| e.fields.matched_transaction_id == export.matched_transaction_id)
        {
            return Ok(None);
        }
        if st
            .exports
            .values()
            .any(|e| e.fields.export_uid == export.export_uid)
        {
            bail!("duplicate export_uid {}", export.export_uid);
        }
        let export_id = st.id();
        st.exports.insert(
            export_id,
            ExportTransaction {
                id: export_id,
                fields: export.clone(),
                status: ExportTransactionStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        let id = st.id();
        let pending = PendingExport {
            id,
            export_transaction_id: export_id,
            provider_slug: export.provider_slug.clone(),
            retry_count: 0,
            retry_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        st.pending_exports.insert(id, pending.clone());
        st.writes += 1;
        Ok(Some(pending))
    }

    async fn fetch_export_transaction(&self, id: i64) -> Result<Option<ExportTransaction>> {
        Ok(self.lock()?.exports.get(&id).cloned())
    }

    async fn fetch_pending_export(&self, id: i64) -> Result<Option<PendingExport>> {
        Ok(self.lock()?.pending_exports.get(&id).cloned())
    }

    async fn complete_export(&self, pending_export_id: i64) -> Result<bool> {
        let now = self.now();
        let mut st = self.lock()?;
        let Some(pending) = st.pending_exports.get(&pending_export_id).cloned() else {
            return Ok(false);
        };
        transition_export_chain(
            &mut st,
            pending.export_transaction_id,
            TransactionStatus::Exported,
            now,
        )?;
        st.pending_exports.remove(&pending_export_id);
        st.writes += 1;
        Ok(true)
    }

    async fn fail_export(
        &self,
        pending_export_id: i64,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let now = self.now();
        let mut st = self.lock()?;
        let export_id = match st.pending_exports.get_mut(&pending_export_id) {
            Some(p) => {
                p.failure_reason = Some(reason.to_string());
                p.retry_at = Some(retry_at);
                p.updated_at = now;
                p.export_transaction_id
            }
            None => return Ok(false),
        };
        transition_export_chain(&mut st, export_id, TransactionStatus::ExportFailed, now)?;
        st.writes += 1;
        Ok(true)
    }

    async fn claim_due_exports(&self, now: DateTime<Utc>) -> Result<Vec<PendingExport>> {
        let stamp = self.now();
        let mut st = self.lock()?;
        let mut claimed = Vec::new();
        for p in st.pending_exports.values_mut() {
            if p.is_due(now) {
                p.retry_count += 1;
                p.retry_at = None;
                p.updated_at = stamp;
                claimed.push(p.clone());
            }
        }
        if !claimed.is_empty() {
            st.writes += 1;
        }
        Ok(claimed)
    }

    async fn ready_exports_for_provider(
        &self,
        provider_slug: &str,
        limit: i64,
    ) -> Result<Vec<PendingExport>> {
        let st = self.lock()?;
        Ok(st
            .pending_exports
            .values()
            .filter(|p| p.provider_slug == provider_slug && p.retry_at.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_pending_exports(&self) -> Result<i64> {
        Ok(self.lock()?.pending_exports.len() as i64)
    }
}

// ---------------------------------------------------------------------------
// Infrastructure
// ---------------------------------------------------------------------------

#[async_trait]
impl SequenceStore for MemStore {
    async fn next_value(&self, provider_slug: &str, default: i64) -> Result<i64> {
        let mut st = self.lock()?;
        if !st.sequences.contains_key(provider_slug) {
            st.sequences.insert(provider_slug.to_string(), default);
            st.writes += 1;
        }
        Ok(st.sequences.get(provider_slug).copied().unwrap_or(default))
    }

    async fn set_next_value(&self, provider_slug: &str, value: i64) -> Result<()> {
        let mut st = self.lock()?;
        st.sequences.insert(provider_slug.to_string(), value);
        st.writes += 1;
        Ok(())
    }

    async fn reserve_sequence(
        &self,
        provider_slug: &str,
        count: i64,
        default: i64,
    ) -> Result<i64> {
        let mut st = self.lock()?;
        let slot = st
            .sequences
            .entry(provider_slug.to_string())
            .or_insert(default);
        let start = *slot;
        *slot += count;
        st.writes += 1;
        Ok(start)
    }
}

#[async_trait]
impl ConfigStore for MemStore {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let mut st = self.lock()?;
        st.config.insert(key.to_string(), value.to_string());
        st.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl RetryStore for MemStore {
    async fn fetch_retry(&self, kind: RetryKind, entity_id: i64) -> Result<Option<RetryEntry>> {
        Ok(self.lock()?.retries.get(&(kind, entity_id)).cloned())
    }

    async fn schedule_retry(
        &self,
        kind: RetryKind,
        entity_id: i64,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.lock()?;
        let entry = st
            .retries
            .entry((kind, entity_id))
            .or_insert_with(|| RetryEntry {
                kind,
                entity_id,
                retry_count: 0,
                retry_at: None,
                failure_reason: None,
            });
        entry.retry_at = Some(retry_at);
        entry.failure_reason = Some(reason.to_string());
        st.writes += 1;
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        kind: RetryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetryEntry>> {
        let mut st = self.lock()?;
        let mut claimed = Vec::new();
        for entry in st.retries.values_mut() {
            if entry.kind == kind && matches!(entry.retry_at, Some(at) if at <= now) {
                entry.retry_count += 1;
                entry.retry_at = None;
                claimed.push(entry.clone());
            }
        }
        if !claimed.is_empty() {
            st.writes += 1;
        }
        claimed.sort_by_key(|r| r.entity_id);
        Ok(claimed)
    }

    async fn clear_retry(&self, kind: RetryKind, entity_id: i64) -> Result<()> {
        let mut st = self.lock()?;
        if st.retries.remove(&(kind, entity_id)).is_some() {
            st.writes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemStore {
    async fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        let mut st = self.lock()?;
        let free = match st.locks.get(name) {
            None => true,
            Some((holder, exp)) => holder == owner || *exp <= now,
        };
        if free {
            st.locks
                .insert(name.to_string(), (owner.to_string(), expires_at));
            st.writes += 1;
        }
        Ok(free)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        let mut st = self.lock()?;
        if st.locks.get(name).is_some_and(|(holder, _)| holder == owner) {
            st.locks.remove(name);
            st.writes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for MemStore {
    async fn insert_merchant_identifier(&self, mid: &NewMerchantIdentifier) -> Result<i64> {
        let mut st = self.lock()?;

        let scheme_id = match st.loyalty_schemes.get(&mid.loyalty_scheme_slug) {
            Some(id) => *id,
            None => {
                let id = st.id();
                st.loyalty_schemes.insert(mid.loyalty_scheme_slug.clone(), id);
                id
            }
        };
        let provider_id = match &mid.payment_provider_slug {
            Some(slug) => Some(match st.payment_providers.get(slug) {
                Some(id) => *id,
                None => {
                    let id = st.id();
                    st.payment_providers.insert(slug.clone(), id);
                    id
                }
            }),
            None => None,
        };

        if st.merchant_identifiers.values().any(|m| {
            m.identifier == mid.identifier
                && m.identifier_type == mid.identifier_type
                && m.payment_provider_id == provider_id
                && m.loyalty_scheme_id == scheme_id
        }) {
            bail!(
                "merchant identifier already exists: {} {} scheme={}",
                mid.identifier,
                mid.identifier_type,
                mid.loyalty_scheme_slug
            );
        }

        let id = st.id();
        st.merchant_identifiers.insert(
            id,
            MerchantIdentifier {
                id,
                identifier: mid.identifier.clone(),
                identifier_type: mid.identifier_type,
                location_id: mid.location_id.clone(),
                merchant_internal_id: mid.merchant_internal_id.clone(),
                loyalty_scheme_id: scheme_id,
                loyalty_scheme_slug: mid.loyalty_scheme_slug.clone(),
                payment_provider_id: provider_id,
                payment_provider_slug: mid.payment_provider_slug.clone(),
            },
        );
        st.writes += 1;
        Ok(id)
    }
}
