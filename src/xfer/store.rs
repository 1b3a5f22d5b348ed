//! Ledger Store Contracts
//!
//! One [`LedgerTx`] spans one pipeline run. Every balance and counter
//! mutation is a guarded relative update: it either applies entirely or
//! reports `false` and leaves the row untouched, so callers can retry or
//! reject without holding in-process locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use super::error::XferError;
use super::outbox::{NewOutboxEntry, OutboxEntry};
use super::state::XferStatus;
use super::types::{XferId, XferRecord};
use crate::account::{Account, AccountId, HolderId};
use crate::amount::StatsMap;
use crate::limits::{LimitDomain, LimitStats};

/// Relative change of one account
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub account: AccountId,
    pub balance: Decimal,
    pub reserved: Decimal,
    /// Refuse the update if `available` would become negative
    pub check_funds: bool,
}

impl BalanceUpdate {
    pub fn debit(account: &AccountId, amount: Decimal, check_funds: bool) -> Self {
        Self {
            account: account.clone(),
            balance: -amount,
            reserved: Decimal::ZERO,
            check_funds,
        }
    }

    pub fn credit(account: &AccountId, amount: Decimal) -> Self {
        Self {
            account: account.clone(),
            balance: amount,
            reserved: Decimal::ZERO,
            check_funds: false,
        }
    }

    pub fn reserve(account: &AccountId, amount: Decimal, check_funds: bool) -> Self {
        Self {
            account: account.clone(),
            balance: Decimal::ZERO,
            reserved: amount,
            check_funds,
        }
    }

    pub fn release(account: &AccountId, amount: Decimal) -> Self {
        Self {
            account: account.clone(),
            balance: Decimal::ZERO,
            reserved: -amount,
            check_funds: false,
        }
    }

    /// Turn a reservation into a real debit
    pub fn settle(account: &AccountId, amount: Decimal) -> Self {
        Self {
            account: account.clone(),
            balance: -amount,
            reserved: -amount,
            check_funds: false,
        }
    }

    /// Whether the row satisfies the guard after the update
    pub fn guard_holds(&self, balance: Decimal, reserved: Decimal, overdraft: Decimal) -> bool {
        let (Some(balance), Some(reserved)) = (
            balance.checked_add(self.balance),
            reserved.checked_add(self.reserved),
        ) else {
            return false;
        };
        reserved >= Decimal::ZERO
            && (!self.check_funds
                || balance.saturating_add(overdraft).saturating_sub(reserved) >= Decimal::ZERO)
    }
}

/// Transactional ledger storage
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, XferError>;

    async fn get_xfer(&self, id: XferId) -> Result<Option<XferRecord>, XferError>;

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, XferError>;

    /// Pending outbox entries, oldest first
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, XferError>;

    async fn complete_outbox(&self, id: i64) -> Result<(), XferError>;

    async fn fail_outbox(&self, id: i64, error: &str) -> Result<(), XferError>;

    /// Count one more failed delivery attempt
    async fn retry_outbox(&self, id: i64) -> Result<(), XferError>;
}

/// Operations inside one store transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait LedgerTx: Send {
    /// Record `id` in the append-only uniqueness ledger. `false` if it was
    /// ever used before.
    async fn register_xfer_id(&mut self, id: XferId) -> Result<bool, XferError>;

    async fn find_xfer_by_ext_id(&mut self, ext_id: &str) -> Result<Option<XferRecord>, XferError>;

    /// Read a ledger row, locking it for the rest of the transaction
    async fn lock_xfer(&mut self, id: XferId) -> Result<Option<XferRecord>, XferError>;

    /// Read all accounts in one query; unknown ids are absent from the result
    async fn fetch_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, XferError>;

    /// `false` if the id or external id is already taken
    async fn insert_xfer(&mut self, record: &XferRecord) -> Result<bool, XferError>;

    /// Compare-and-set status transition; `misc` replaces the row's misc data
    /// when given. `false` if the row is not in `from`.
    async fn update_xfer_status(
        &mut self,
        id: XferId,
        from: XferStatus,
        to: XferStatus,
        misc: Option<&Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError>;

    /// Guarded relative update; `false` if the account is missing or the
    /// guard fails
    async fn apply_balance(&mut self, update: &BalanceUpdate) -> Result<bool, XferError>;

    async fn limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
    ) -> Result<Option<LimitStats>, XferError>;

    /// `false` if a concurrent transaction created the row first
    async fn insert_limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
        stats: &LimitStats,
    ) -> Result<bool, XferError>;

    /// Add `deltas` after resetting windows that rolled over by `now`.
    /// `false` if the row is missing or any counter would exceed its `hard`
    /// ceiling.
    async fn update_limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
        deltas: &StatsMap,
        hard: &StatsMap,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError>;

    async fn refunded_total(&mut self, purchase: XferId) -> Result<Decimal, XferError>;

    /// Add `amount` to the refund total of `purchase` unless it would exceed
    /// `ceiling`
    async fn add_refund(
        &mut self,
        purchase: XferId,
        amount: Decimal,
        ceiling: Decimal,
    ) -> Result<bool, XferError>;

    async fn enqueue_outbox(&mut self, entry: &NewOutboxEntry) -> Result<(), XferError>;

    async fn commit(self: Box<Self>) -> Result<(), XferError>;

    async fn rollback(self: Box<Self>) -> Result<(), XferError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_guard_funds() {
        let acct = AccountId::generate();
        let debit = BalanceUpdate::debit(&acct, d("5"), true);
        assert!(debit.guard_holds(d("5"), d("0"), d("0")));
        assert!(!debit.guard_holds(d("5"), d("1"), d("0")));
        assert!(debit.guard_holds(d("4"), d("0"), d("1")));

        let forced = BalanceUpdate::debit(&acct, d("5"), false);
        assert!(forced.guard_holds(d("0"), d("0"), d("0")));
    }

    #[test]
    fn test_guard_reserved_never_negative() {
        let acct = AccountId::generate();
        assert!(!BalanceUpdate::release(&acct, d("2")).guard_holds(d("10"), d("1"), d("0")));
        assert!(BalanceUpdate::settle(&acct, d("1")).guard_holds(d("10"), d("1"), d("0")));
    }
}
