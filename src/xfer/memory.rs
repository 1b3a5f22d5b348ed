//! In-memory ledger store (dev/test)
//!
//! A transaction holds the single state lock for its whole lifetime and
//! restores a snapshot unless committed, which gives the same
//! all-or-nothing behavior as a database transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::error::XferError;
use super::outbox::{NewOutboxEntry, OutboxEntry, OutboxStatus};
use super::state::XferStatus;
use super::store::{BalanceUpdate, LedgerStore, LedgerTx};
use super::types::{XferId, XferRecord};
use crate::account::{Account, AccountId, HolderId};
use crate::amount::{AmountError, StatsMap};
use crate::limits::{LimitDomain, LimitStats};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: FxHashMap<AccountId, Account>,
    xfers: FxHashMap<XferId, XferRecord>,
    ext_ids: FxHashMap<String, XferId>,
    uuid_history: FxHashSet<XferId>,
    stats: FxHashMap<(HolderId, LimitDomain), LimitStats>,
    refunds: FxHashMap<XferId, Decimal>,
    outbox: BTreeMap<i64, OutboxEntry>,
    next_outbox_id: i64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, account: Account) -> AccountId {
        let id = account.id.clone();
        self.state.lock().await.accounts.insert(id.clone(), account);
        id
    }

    pub async fn account(&self, id: &AccountId) -> Option<Account> {
        self.state.lock().await.accounts.get(id).cloned()
    }

    pub async fn set_account_enabled(&self, id: &AccountId, enabled: bool) {
        if let Some(acct) = self.state.lock().await.accounts.get_mut(id) {
            acct.enabled = enabled;
        }
    }

    pub async fn stats(&self, holder: &HolderId, domain: LimitDomain) -> Option<LimitStats> {
        self.state
            .lock()
            .await
            .stats
            .get(&(holder.clone(), domain))
            .cloned()
    }

    /// Move a stats row's last write into the past
    pub async fn backdate_stats(&self, holder: &HolderId, domain: LimitDomain, date: DateTime<Utc>) {
        if let Some(row) = self.state.lock().await.stats.get_mut(&(holder.clone(), domain)) {
            row.stats_date = date;
        }
    }

    /// Move a ledger row and the limit applications it carries into the past
    pub async fn backdate_xfer(&self, id: XferId, date: DateTime<Utc>) {
        if let Some(rec) = self.state.lock().await.xfers.get_mut(&id) {
            rec.created = date;
            rec.orig_ts = date;
            for applied in &mut rec.limits {
                applied.date = date;
            }
        }
    }

    pub async fn outbox(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.outbox.values().cloned().collect()
    }

    pub async fn xfer_count(&self) -> usize {
        self.state.lock().await.xfers.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, XferError> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn get_xfer(&self, id: XferId) -> Result<Option<XferRecord>, XferError> {
        Ok(self.state.lock().await.xfers.get(&id).cloned())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, XferError> {
        Ok(self.account(id).await)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, XferError> {
        Ok(self
            .state
            .lock()
            .await
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn complete_outbox(&self, id: i64) -> Result<(), XferError> {
        self.set_outbox(id, OutboxStatus::Done, None).await;
        Ok(())
    }

    async fn fail_outbox(&self, id: i64, error: &str) -> Result<(), XferError> {
        self.set_outbox(id, OutboxStatus::Failed, Some(error)).await;
        Ok(())
    }

    async fn retry_outbox(&self, id: i64) -> Result<(), XferError> {
        if let Some(entry) = self.state.lock().await.outbox.get_mut(&id) {
            entry.retry_count += 1;
            entry.updated = Utc::now();
        }
        Ok(())
    }
}

impl MemoryStore {
    async fn set_outbox(&self, id: i64, status: OutboxStatus, error: Option<&str>) {
        if let Some(entry) = self.state.lock().await.outbox.get_mut(&id) {
            entry.status = status;
            entry.error = error.map(str::to_string);
            entry.updated = Utc::now();
        }
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    /// State at `begin`; restored on drop unless committed
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn register_xfer_id(&mut self, id: XferId) -> Result<bool, XferError> {
        Ok(self.guard.uuid_history.insert(id))
    }

    async fn find_xfer_by_ext_id(&mut self, ext_id: &str) -> Result<Option<XferRecord>, XferError> {
        let state = &*self.guard;
        Ok(state
            .ext_ids
            .get(ext_id)
            .and_then(|id| state.xfers.get(id))
            .cloned())
    }

    async fn lock_xfer(&mut self, id: XferId) -> Result<Option<XferRecord>, XferError> {
        Ok(self.guard.xfers.get(&id).cloned())
    }

    async fn fetch_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, XferError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.guard.accounts.get(id).cloned())
            .collect())
    }

    async fn insert_xfer(&mut self, record: &XferRecord) -> Result<bool, XferError> {
        let state = &mut *self.guard;
        if state.xfers.contains_key(&record.id) {
            return Ok(false);
        }
        if let Some(ext_id) = &record.ext_id {
            if state.ext_ids.contains_key(ext_id) {
                return Ok(false);
            }
            state.ext_ids.insert(ext_id.clone(), record.id);
        }
        state.xfers.insert(record.id, record.clone());
        Ok(true)
    }

    async fn update_xfer_status(
        &mut self,
        id: XferId,
        from: XferStatus,
        to: XferStatus,
        misc: Option<&Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError> {
        match self.guard.xfers.get_mut(&id) {
            Some(rec) if rec.status == from => {
                rec.status = to;
                if let Some(misc) = misc {
                    rec.misc_data = misc.clone();
                }
                rec.updated = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_balance(&mut self, update: &BalanceUpdate) -> Result<bool, XferError> {
        let Some(acct) = self.guard.accounts.get_mut(&update.account) else {
            return Ok(false);
        };
        if !update.guard_holds(acct.balance, acct.reserved, acct.overdraft) {
            return Ok(false);
        }
        let (Some(balance), Some(reserved)) = (
            acct.balance.checked_add(update.balance),
            acct.reserved.checked_add(update.reserved),
        ) else {
            return Err(AmountError::Overflow.into());
        };
        acct.balance = balance;
        acct.reserved = reserved;
        Ok(true)
    }

    async fn limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
    ) -> Result<Option<LimitStats>, XferError> {
        Ok(self.guard.stats.get(&(holder.clone(), domain)).cloned())
    }

    async fn insert_limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
        stats: &LimitStats,
    ) -> Result<bool, XferError> {
        let key = (holder.clone(), domain);
        if self.guard.stats.contains_key(&key) {
            return Ok(false);
        }
        self.guard.stats.insert(key, stats.clone());
        Ok(true)
    }

    async fn update_limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
        deltas: &StatsMap,
        hard: &StatsMap,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError> {
        Ok(match self.guard.stats.get_mut(&(holder.clone(), domain)) {
            Some(row) => row.try_apply(deltas, hard, now),
            None => false,
        })
    }

    async fn refunded_total(&mut self, purchase: XferId) -> Result<Decimal, XferError> {
        Ok(self
            .guard
            .refunds
            .get(&purchase)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn add_refund(
        &mut self,
        purchase: XferId,
        amount: Decimal,
        ceiling: Decimal,
    ) -> Result<bool, XferError> {
        let total = self.guard.refunds.entry(purchase).or_insert(Decimal::ZERO);
        match total.checked_add(amount) {
            Some(next) if next <= ceiling => *total = next,
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn enqueue_outbox(&mut self, entry: &NewOutboxEntry) -> Result<(), XferError> {
        let state = &mut *self.guard;
        state.next_outbox_id += 1;
        let id = state.next_outbox_id;
        let now = Utc::now();

        state.outbox.insert(
            id,
            OutboxEntry {
                id,
                xfer_id: entry.xfer_id,
                domain: entry.domain,
                direction: entry.direction,
                op: entry.op,
                rel_account: entry.rel_account.clone(),
                payload: entry.payload.clone(),
                status: OutboxStatus::Pending,
                retry_count: 0,
                error: None,
                created: now,
                updated: now,
            },
        );
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), XferError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), XferError> {
        drop(self);
        Ok(())
    }
}
