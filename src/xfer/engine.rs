//! Transfer Engine
//!
//! Drives one transfer through the pipeline inside a single store
//! transaction:
//!
//! ```text
//! validate ─▶ dedup ext_id ─▶ age barrier ─▶ fetch accounts ─▶ convert
//!    ─▶ db_prepare ─▶ funds ─▶ limits ─▶ db_step ─▶ ledger row + balances
//!    ─▶ outbox ─▶ commit
//! ```
//!
//! Any error rolls the transaction back; nothing is half-written.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use super::error::XferError;
use super::outbox::{Direction, NewOutboxEntry, PeerOp};
use super::state::XferStatus;
use super::store::{BalanceUpdate, LedgerStore, LedgerTx};
use super::types::{CancelRequest, XferId, XferRecord, XferRef, XferRequest};
use crate::account::{Account, AccountId, Registry, conversion_rate};
use crate::amount::{buy_rate, check_xfer_amount, conv_amount, parse_amount, sell_rate};
use crate::config::EngineConfig;
use crate::domain::{Domain, XferContext};
use crate::limits::{LimitSpec, LimitsEngine};

/// Attempts of a transfer whose external id was taken by a concurrent
/// request; the second attempt resolves as a replay.
const EXT_ID_ATTEMPTS: usize = 2;

/// How far ahead of the local clock a caller's `orig_ts` may run
const MAX_CLOCK_SKEW_SECS: i64 = 300;

pub struct XferEngine {
    store: Arc<dyn LedgerStore>,
    registry: Arc<dyn Registry>,
    limits: LimitsEngine,
    config: EngineConfig,
}

/// Request fields validated before the transaction opens
struct Plan {
    amount: Decimal,
    orig_ts: DateTime<Utc>,
    status: XferStatus,
    fee_amount: Option<Decimal>,
}

/// One ledger row to post
struct Draft<'a> {
    id: XferId,
    domain: Domain,
    xfer_type: &'a str,
    src: &'a AccountId,
    dst: &'a AccountId,
    currency: &'a str,
    amount: Decimal,
    ext_id: Option<&'a str>,
    orig_ts: DateTime<Utc>,
    src_limit: Option<&'a LimitSpec>,
    dst_limit: Option<&'a LimitSpec>,
    force: bool,
    status: XferStatus,
    misc: Map<String, Value>,
    fee_xfer: Option<XferId>,
}

impl XferEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        registry: Arc<dyn Registry>,
        config: EngineConfig,
    ) -> Self {
        let limits = LimitsEngine::new(registry.clone(), config.limit_retries);
        Self {
            store,
            registry,
            limits,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    // ========================================================================
    // Public Operations
    // ========================================================================

    /// Alias of [`process_xfer`](Self::process_xfer)
    pub async fn start_xfer(&self, req: &XferRequest) -> Result<XferRecord, XferError> {
        self.process_xfer(req).await
    }

    /// Run the full pipeline. Replays of a known external id return the
    /// original row without side effects.
    pub async fn process_xfer(&self, req: &XferRequest) -> Result<XferRecord, XferError> {
        let now = Utc::now();
        let plan = self.plan(req, now).await?;

        for attempt in 0..EXT_ID_ATTEMPTS {
            let mut tx = self.store.begin().await?;
            match self.xfer_in_tx(tx.as_mut(), req, &plan, now).await {
                Ok(Some(id)) => {
                    tx.commit().await?;
                    return self.get_xfer(id).await;
                }
                Ok(None) => {
                    tx.rollback().await?;
                    warn!(
                        ext_id = ?req.ext_id,
                        attempt,
                        "External id taken concurrently, retrying as replay"
                    );
                }
                Err(e) => {
                    abort(tx, &e).await;
                    return Err(e);
                }
            }
        }

        Err(XferError::InternalError(
            "external id conflict did not resolve".into(),
        ))
    }

    /// Move reserved funds for real: `Pending`/`WaitUser` → `Done`
    pub async fn confirm_xfer(&self, target: &XferRef) -> Result<XferRecord, XferError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        match self.confirm_in_tx(tx.as_mut(), target, now).await {
            Ok(id) => {
                tx.commit().await?;
                self.get_xfer(id).await
            }
            Err(e) => {
                abort(tx, &e).await;
                Err(e)
            }
        }
    }

    /// Release a reservation: `Pending`/`WaitUser` → `Canceled`
    pub async fn process_cancel(&self, req: &CancelRequest) -> Result<XferRecord, XferError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        match self.cancel_in_tx(tx.as_mut(), req, now).await {
            Ok(id) => {
                tx.commit().await?;
                self.get_xfer(id).await
            }
            Err(e) => {
                abort(tx, &e).await;
                Err(e)
            }
        }
    }

    pub async fn get_xfer(&self, id: XferId) -> Result<XferRecord, XferError> {
        self.store
            .get_xfer(id)
            .await?
            .ok_or_else(|| XferError::UnknownXferID(id.to_string()))
    }

    // ========================================================================
    // Validation
    // ========================================================================

    async fn plan(&self, req: &XferRequest, now: DateTime<Utc>) -> Result<Plan, XferError> {
        req.check_shape()?;

        let amount = self.parse_in(&req.currency, &req.amount).await?;
        let fee_amount = match &req.fee {
            Some(fee) => Some(self.parse_in(&fee.currency, &fee.amount).await?),
            None => None,
        };

        let orig_ts = req.orig_ts.unwrap_or(now);
        if orig_ts > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(XferError::InternalError(format!(
                "orig_ts {orig_ts} is in the future"
            )));
        }

        let status = if req.hold {
            XferStatus::Pending
        } else if req.user_confirm && self.config.user_confirm_required {
            XferStatus::WaitUser
        } else {
            XferStatus::Done
        };

        Ok(Plan {
            amount,
            orig_ts,
            status,
            fee_amount,
        })
    }

    async fn parse_in(&self, code: &str, amount: &str) -> Result<Decimal, XferError> {
        let currency = self.registry.get_currency(code).await?;
        if !currency.enabled {
            return Err(XferError::UnknownCurrency(format!("{code} (disabled)")));
        }
        Ok(parse_amount(amount, currency.dec_places)?)
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    /// `Ok(None)` when the external id was taken after the dedup lookup
    async fn xfer_in_tx(
        &self,
        tx: &mut dyn LedgerTx,
        req: &XferRequest,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Option<XferId>, XferError> {
        if let Some(ext_id) = &req.ext_id
            && let Some(existing) = tx.find_xfer_by_ext_id(ext_id).await?
        {
            existing.check_replay(req, plan.amount)?;
            info!(xfer_id = %existing.id, ext_id = %ext_id, status = %existing.status, "Transfer replayed");
            return Ok(Some(existing.id));
        }

        // replays are answered whatever their age; only new rows are barred
        if plan.orig_ts < now - Duration::days(self.config.history_barrier_days) {
            return Err(XferError::OriginalTooOld);
        }

        let id = new_xfer_id(tx).await?;
        let fee_xfer = match req.fee {
            Some(_) => Some(new_xfer_id(tx).await?),
            None => None,
        };

        let draft = Draft {
            id,
            domain: req.domain,
            xfer_type: &req.xfer_type,
            src: &req.src_account,
            dst: &req.dst_account,
            currency: &req.currency,
            amount: plan.amount,
            ext_id: req.ext_id.as_deref(),
            orig_ts: plan.orig_ts,
            src_limit: req.src_limit.as_ref(),
            dst_limit: req.dst_limit.as_ref(),
            force: req.force,
            status: plan.status,
            misc: req.misc.clone(),
            fee_xfer,
        };
        if !self.post(tx, draft, now).await? {
            return Ok(None);
        }

        if let (Some(fee), Some(fee_id), Some(fee_amount)) = (&req.fee, fee_xfer, plan.fee_amount) {
            let mut misc = Map::new();
            misc.insert("fee_for".into(), Value::String(id.to_string()));

            let fee_draft = Draft {
                id: fee_id,
                domain: Domain::Generic,
                xfer_type: &fee.xfer_type,
                src: &req.src_account,
                dst: &fee.dst_account,
                currency: &fee.currency,
                amount: fee_amount,
                ext_id: None,
                orig_ts: plan.orig_ts,
                src_limit: None,
                dst_limit: None,
                force: req.force,
                status: plan.status,
                misc,
                fee_xfer: None,
            };
            if !self.post(tx, fee_draft, now).await? {
                return Err(XferError::InternalError(format!("fee row {fee_id} collided")));
            }
        }

        Ok(Some(id))
    }

    /// Write one ledger row with its balance, limit and outbox effects.
    /// `Ok(false)` when the row's id or external id is already taken.
    async fn post(
        &self,
        tx: &mut dyn LedgerTx,
        draft: Draft<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError> {
        let accounts = tx
            .fetch_accounts(&[draft.src.clone(), draft.dst.clone()])
            .await?;
        let src = find_account(&accounts, draft.src)?;
        let dst = find_account(&accounts, draft.dst)?;

        if !draft.force {
            self.check_enabled(src).await?;
            self.check_enabled(dst).await?;
        }

        let src_amount = self.convert(draft.amount, draft.currency, src, true).await?;
        let dst_amount = self.convert(draft.amount, draft.currency, dst, false).await?;

        let ctx = XferContext {
            id: draft.id,
            xfer_type: draft.xfer_type,
            src,
            dst,
            currency: draft.currency,
            amount: draft.amount,
            src_amount,
            dst_amount,
            status: draft.status,
            misc: &draft.misc,
            now,
            config: &self.config,
        };

        let prepared = draft.domain.db_prepare(tx, &ctx).await?;

        let check_funds = !draft.force && !src.is_transit();
        if check_funds && !check_xfer_amount(src_amount - prepared.released, src) {
            debug!(account = %src.id, amount = %src_amount, "Not enough funds");
            return Err(XferError::NotEnoughFunds);
        }

        let mut misc = draft.misc.clone();
        let mut applied = Vec::new();
        let (mut do_check, mut do_risk) = (false, false);
        for (account, spec) in [(src, draft.src_limit), (dst, draft.dst_limit)] {
            let Some(spec) = spec else { continue };
            let outcome = self
                .limits
                .add_xfer(tx, account, spec, draft.currency, draft.amount, now)
                .await?;
            do_check |= outcome.do_check;
            do_risk |= outcome.do_risk;
            applied.extend(outcome.applied);
        }
        if do_check {
            misc.insert("do_check".into(), Value::Bool(true));
        }
        if do_risk {
            misc.insert("do_risk".into(), Value::Bool(true));
        }

        draft.domain.db_step(tx, &ctx, &mut misc).await?;

        let record = XferRecord {
            id: draft.id,
            domain: draft.domain,
            xfer_type: draft.xfer_type.to_string(),
            src_account: src.id.clone(),
            src_amount,
            dst_account: dst.id.clone(),
            dst_amount,
            currency: draft.currency.to_string(),
            amount: draft.amount,
            ext_id: draft.ext_id.map(str::to_string),
            orig_ts: draft.orig_ts,
            status: draft.status,
            misc_data: misc,
            limits: applied,
            fee_xfer: draft.fee_xfer,
            created: now,
            updated: now,
        };
        if !tx.insert_xfer(&record).await? {
            return Ok(false);
        }

        let debit = if record.status == XferStatus::Done {
            BalanceUpdate::debit(&src.id, src_amount, check_funds)
        } else {
            BalanceUpdate::reserve(&src.id, src_amount, check_funds)
        };
        if !tx.apply_balance(&debit).await? {
            return Err(XferError::NotEnoughFunds);
        }
        if record.status == XferStatus::Done
            && !tx.apply_balance(&BalanceUpdate::credit(&dst.id, dst_amount)).await?
        {
            return Err(XferError::UnknownAccountID(dst.id.to_string()));
        }

        enqueue_peers(tx, &record, src, dst, PeerOp::Start, record.status).await?;

        info!(
            xfer_id = %record.id,
            domain = %record.domain,
            xfer_type = %record.xfer_type,
            src = %record.src_account,
            dst = %record.dst_account,
            amount = %record.amount,
            currency = %record.currency,
            status = %record.status,
            do_check,
            do_risk,
            "Transfer posted"
        );
        Ok(true)
    }

    async fn check_enabled(&self, account: &Account) -> Result<(), XferError> {
        if !account.enabled {
            return Err(XferError::DisabledAccount(account.id.to_string()));
        }
        let holder = self.registry.get_account_holder(&account.holder).await?;
        if !holder.enabled {
            return Err(XferError::DisabledAccount(format!(
                "{} (holder {})",
                account.id, holder.id
            )));
        }
        Ok(())
    }

    /// Nominal amount in the account's currency. Debits round up at the
    /// sell rate, credits round down at the buy rate.
    async fn convert(
        &self,
        amount: Decimal,
        currency: &str,
        account: &Account,
        debit: bool,
    ) -> Result<Decimal, XferError> {
        if account.currency == currency {
            return Ok(amount);
        }

        let rate = conversion_rate(self.registry.as_ref(), currency, &account.currency).await?;
        let converted = if debit {
            conv_amount(amount, sell_rate(rate.rate, rate.margin), account.dec_places, true)?
        } else {
            conv_amount(amount, buy_rate(rate.rate, rate.margin), account.dec_places, false)?
        };
        Ok(converted)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    async fn confirm_in_tx(
        &self,
        tx: &mut dyn LedgerTx,
        target: &XferRef,
        now: DateTime<Utc>,
    ) -> Result<XferId, XferError> {
        let record = locate(tx, target).await?;
        self.settle(tx, &record, now).await?;

        if let Some(fee_id) = record.fee_xfer
            && let Some(fee) = tx.lock_xfer(fee_id).await?
            && fee.status.is_reserved()
        {
            self.settle(tx, &fee, now).await?;
        }
        Ok(record.id)
    }

    async fn settle(
        &self,
        tx: &mut dyn LedgerTx,
        record: &XferRecord,
        now: DateTime<Utc>,
    ) -> Result<(), XferError> {
        if let Some(err) = record.status.terminal_error() {
            return Err(err);
        }
        if !tx
            .update_xfer_status(record.id, record.status, XferStatus::Done, None, now)
            .await?
        {
            return Err(status_conflict(tx, record.id).await);
        }

        if !tx
            .apply_balance(&BalanceUpdate::settle(&record.src_account, record.src_amount))
            .await?
        {
            return Err(XferError::InternalError(format!(
                "reservation of {} is missing",
                record.id
            )));
        }
        if !tx
            .apply_balance(&BalanceUpdate::credit(&record.dst_account, record.dst_amount))
            .await?
        {
            return Err(XferError::UnknownAccountID(record.dst_account.to_string()));
        }

        peer_followup(tx, record, PeerOp::Confirm, XferStatus::Done).await?;

        info!(xfer_id = %record.id, old_status = %record.status, "Transfer confirmed");
        Ok(())
    }

    async fn cancel_in_tx(
        &self,
        tx: &mut dyn LedgerTx,
        req: &CancelRequest,
        now: DateTime<Utc>,
    ) -> Result<XferId, XferError> {
        let record = locate(tx, &req.target).await?;
        if let Some(err) = record.status.terminal_error() {
            return Err(err);
        }
        if req.reject_mode && record.status != XferStatus::WaitUser {
            return Err(XferError::InternalError(format!(
                "{} is not awaiting the holder",
                record.id
            )));
        }

        self.release(tx, &record, req.reason.as_deref(), now).await?;

        if let Some(fee_id) = record.fee_xfer
            && let Some(fee) = tx.lock_xfer(fee_id).await?
            && fee.status.is_reserved()
        {
            self.release(tx, &fee, req.reason.as_deref(), now).await?;
        }
        Ok(record.id)
    }

    async fn release(
        &self,
        tx: &mut dyn LedgerTx,
        record: &XferRecord,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), XferError> {
        let mut misc = record.misc_data.clone();
        if let Some(reason) = reason {
            misc.insert("cancel_reason".into(), Value::String(reason.to_string()));
        }

        if !tx
            .update_xfer_status(record.id, record.status, XferStatus::Canceled, Some(&misc), now)
            .await?
        {
            return Err(status_conflict(tx, record.id).await);
        }
        if !tx
            .apply_balance(&BalanceUpdate::release(&record.src_account, record.src_amount))
            .await?
        {
            return Err(XferError::InternalError(format!(
                "reservation of {} is missing",
                record.id
            )));
        }

        for applied in &record.limits {
            self.limits.cancel_xfer(tx, applied, now).await?;
        }

        record.domain.db_cancel_step(tx, record, now).await?;

        peer_followup(tx, record, PeerOp::Cancel, XferStatus::Canceled).await?;

        info!(xfer_id = %record.id, old_status = %record.status, reason = ?reason, "Transfer canceled");
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn new_xfer_id(tx: &mut dyn LedgerTx) -> Result<XferId, XferError> {
    let id = XferId::new();
    if !tx.register_xfer_id(id).await? {
        error!(xfer_id = %id, "CRITICAL: generated transfer id was used before");
        return Err(XferError::InternalError(format!("transfer id {id} reused")));
    }
    Ok(id)
}

fn find_account<'a>(accounts: &'a [Account], id: &AccountId) -> Result<&'a Account, XferError> {
    accounts
        .iter()
        .find(|a| &a.id == id)
        .ok_or_else(|| XferError::UnknownAccountID(id.to_string()))
}

async fn locate(tx: &mut dyn LedgerTx, target: &XferRef) -> Result<XferRecord, XferError> {
    let id = match target {
        XferRef::Id(id) => Some(*id),
        XferRef::ExtId(ext_id) => tx.find_xfer_by_ext_id(ext_id).await?.map(|r| r.id),
    };
    let record = match id {
        Some(id) => tx.lock_xfer(id).await?,
        None => None,
    };
    record.ok_or_else(|| XferError::UnknownXferID(target.to_string()))
}

/// Error for a lost compare-and-set on a ledger row
async fn status_conflict(tx: &mut dyn LedgerTx, id: XferId) -> XferError {
    match tx.lock_xfer(id).await {
        Ok(Some(current)) => current.status.terminal_error().unwrap_or_else(|| {
            XferError::InternalError(format!("{id} changed status concurrently"))
        }),
        Ok(None) => XferError::UnknownXferID(id.to_string()),
        Err(e) => e,
    }
}

/// Peer calls for a transition of an already posted transfer
async fn peer_followup(
    tx: &mut dyn LedgerTx,
    record: &XferRecord,
    op: PeerOp,
    status: XferStatus,
) -> Result<(), XferError> {
    let accounts = tx
        .fetch_accounts(&[record.src_account.clone(), record.dst_account.clone()])
        .await?;
    let src = find_account(&accounts, &record.src_account)?;
    let dst = find_account(&accounts, &record.dst_account)?;
    enqueue_peers(tx, record, src, dst, op, status).await
}

/// Queue peer calls for the transit sides of a transfer
async fn enqueue_peers(
    tx: &mut dyn LedgerTx,
    record: &XferRecord,
    src: &Account,
    dst: &Account,
    op: PeerOp,
    status: XferStatus,
) -> Result<(), XferError> {
    for (account, direction, amount) in [
        (src, Direction::In, record.src_amount),
        (dst, Direction::Out, record.dst_amount),
    ] {
        if !account.is_transit() {
            continue;
        }

        let entry = NewOutboxEntry {
            xfer_id: record.id,
            domain: record.domain,
            direction,
            op,
            rel_account: account.id.clone(),
            payload: json!({
                "xfer_type": record.xfer_type,
                "currency": account.currency,
                "amount": amount.to_string(),
                "ext_acct_id": account.ext_acct_id,
                "status": status.as_str(),
            }),
        };
        tx.enqueue_outbox(&entry).await?;
        debug!(xfer_id = %record.id, %direction, ?op, "Peer call queued");
    }
    Ok(())
}

async fn abort(tx: Box<dyn LedgerTx>, cause: &XferError) {
    debug!(error = %cause, code = cause.code(), "Rolling back transfer");
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}
