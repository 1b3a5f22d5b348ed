//! Retail: pre-authorizations, purchases and refunds
//!
//! A `PreAuth` holds funds on the buyer's account. A `Purchase` may consume
//! it through `misc.use_preauth`; the hold is released and the preauth row
//! canceled in the purchase transaction. A `Refund` names its purchase through
//! `misc.purchase_id`; the running refund total never exceeds the purchase.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{Domain, Prepared, XferContext, misc_xfer_id};
use crate::account::AccountId;
use crate::limits::LimitDomain;
use crate::xfer::{
    BalanceUpdate, CancelRequest, LedgerTx, XferEngine, XferError, XferId, XferRecord, XferRef,
    XferRequest, XferStatus, make_ext_id,
};

pub const PREAUTH: &str = "PreAuth";
pub const PURCHASE: &str = "Purchase";
pub const REFUND: &str = "Refund";

const USE_PREAUTH: &str = "use_preauth";
const PURCHASE_ID: &str = "purchase_id";

// ============================================================================
// Hooks
// ============================================================================

pub(super) async fn db_prepare(
    tx: &mut dyn LedgerTx,
    ctx: &XferContext<'_>,
) -> Result<Prepared, XferError> {
    match ctx.xfer_type {
        PURCHASE => match misc_xfer_id(ctx.misc, USE_PREAUTH) {
            Some(preauth_id) => {
                let preauth = usable_preauth(tx, ctx, preauth_id).await?;
                Ok(Prepared {
                    released: preauth.src_amount,
                })
            }
            None if ctx.misc.contains_key(USE_PREAUTH) => Err(XferError::UnavailablePreAuth),
            None => Ok(Prepared::default()),
        },
        REFUND => {
            check_refund(tx, ctx).await?;
            Ok(Prepared::default())
        }
        _ => Ok(Prepared::default()),
    }
}

pub(super) async fn db_step(
    tx: &mut dyn LedgerTx,
    ctx: &XferContext<'_>,
    misc: &mut Map<String, Value>,
) -> Result<(), XferError> {
    match ctx.xfer_type {
        PURCHASE => {
            let Some(preauth_id) = misc_xfer_id(ctx.misc, USE_PREAUTH) else {
                return Ok(());
            };
            let preauth = usable_preauth(tx, ctx, preauth_id).await?;

            let mut preauth_misc = preauth.misc_data.clone();
            preauth_misc.insert("used_by".into(), Value::String(ctx.id.to_string()));
            if !tx
                .update_xfer_status(
                    preauth.id,
                    XferStatus::Pending,
                    XferStatus::Canceled,
                    Some(&preauth_misc),
                    ctx.now,
                )
                .await?
            {
                return Err(XferError::UnavailablePreAuth);
            }
            if !tx
                .apply_balance(&BalanceUpdate::release(&preauth.src_account, preauth.src_amount))
                .await?
            {
                return Err(XferError::InternalError(format!(
                    "reservation of {} is missing",
                    preauth.id
                )));
            }

            misc.insert("preauth_amount".into(), Value::String(preauth.amount.to_string()));
            info!(preauth = %preauth.id, purchase = %ctx.id, "Pre-authorization consumed");
            Ok(())
        }
        REFUND => {
            let purchase = refund_target(ctx)?;
            let record = load_purchase(tx, purchase).await?;
            if !tx.add_refund(purchase, ctx.amount, record.amount).await? {
                return Err(XferError::AmountTooLarge);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub(super) async fn db_cancel_step(
    tx: &mut dyn LedgerTx,
    record: &XferRecord,
    _now: DateTime<Utc>,
) -> Result<(), XferError> {
    if record.xfer_type != REFUND {
        return Ok(());
    }
    let Some(purchase) = misc_xfer_id(&record.misc_data, PURCHASE_ID) else {
        return Ok(());
    };
    let ceiling = load_purchase(tx, purchase).await?.amount;
    tx.add_refund(purchase, -record.amount, ceiling).await?;
    debug!(refund = %record.id, purchase = %purchase, "Refund total reverted");
    Ok(())
}

// ============================================================================
// Checks
// ============================================================================

async fn usable_preauth(
    tx: &mut dyn LedgerTx,
    ctx: &XferContext<'_>,
    preauth_id: XferId,
) -> Result<XferRecord, XferError> {
    let preauth = tx
        .lock_xfer(preauth_id)
        .await?
        .ok_or(XferError::UnavailablePreAuth)?;

    let usable = preauth.domain == Domain::Retail
        && preauth.xfer_type == PREAUTH
        && preauth.status == XferStatus::Pending
        && preauth.src_account == ctx.src.id
        && preauth.currency == ctx.currency
        && ctx.amount >= preauth.amount;

    if usable {
        Ok(preauth)
    } else {
        Err(XferError::UnavailablePreAuth)
    }
}

fn refund_target(ctx: &XferContext<'_>) -> Result<XferId, XferError> {
    misc_xfer_id(ctx.misc, PURCHASE_ID).ok_or(XferError::PurchaseNotFound)
}

async fn load_purchase(tx: &mut dyn LedgerTx, id: XferId) -> Result<XferRecord, XferError> {
    match tx.lock_xfer(id).await? {
        Some(rec) if rec.domain == Domain::Retail && rec.xfer_type == PURCHASE => Ok(rec),
        _ => Err(XferError::PurchaseNotFound),
    }
}

async fn check_refund(tx: &mut dyn LedgerTx, ctx: &XferContext<'_>) -> Result<(), XferError> {
    let purchase_id = refund_target(ctx)?;
    let purchase = load_purchase(tx, purchase_id).await?;

    if purchase.currency != ctx.currency {
        return Err(XferError::InternalError(format!(
            "refund currency {} differs from purchase currency {}",
            ctx.currency, purchase.currency
        )));
    }

    let refunded = tx.refunded_total(purchase_id).await?;
    if purchase.status == XferStatus::Canceled || refunded >= purchase.amount {
        return Err(XferError::AlreadyRefunded);
    }
    if purchase.created < ctx.now - Duration::days(ctx.config.refund_window_days) {
        return Err(XferError::OriginalTooOld);
    }
    if refunded + ctx.amount > purchase.amount {
        return Err(XferError::AmountTooLarge);
    }
    Ok(())
}

// ============================================================================
// Service
// ============================================================================

/// Request builders for the retail flows
pub struct RetailService {
    engine: Arc<XferEngine>,
}

impl RetailService {
    pub fn new(engine: Arc<XferEngine>) -> Self {
        Self { engine }
    }

    /// Hold `amount` on the buyer's account until purchase or cancel
    pub async fn preauth(
        &self,
        buyer: &AccountId,
        merchant: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
    ) -> Result<XferRecord, XferError> {
        let mut req = XferRequest::new(
            Domain::Retail,
            PREAUTH,
            buyer.clone(),
            merchant.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(buyer, ext_id))
        .with_src_limit(LimitDomain::Retail, "preauth");
        req.hold = true;

        self.engine.process_xfer(&req).await
    }

    pub async fn purchase(
        &self,
        buyer: &AccountId,
        merchant: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
        preauth: Option<XferId>,
    ) -> Result<XferRecord, XferError> {
        let mut req = XferRequest::new(
            Domain::Retail,
            PURCHASE,
            buyer.clone(),
            merchant.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(buyer, ext_id))
        .with_src_limit(LimitDomain::Retail, "retail");
        if let Some(preauth) = preauth {
            req = req.with_misc(USE_PREAUTH, preauth.to_string());
        }

        self.engine.process_xfer(&req).await
    }

    /// Return part or all of a purchase to the buyer
    pub async fn refund(
        &self,
        purchase: &XferRecord,
        amount: &str,
        ext_id: &str,
    ) -> Result<XferRecord, XferError> {
        let req = XferRequest::new(
            Domain::Retail,
            REFUND,
            purchase.dst_account.clone(),
            purchase.src_account.clone(),
            purchase.currency.clone(),
            amount,
        )
        .with_ext_id(make_ext_id(&purchase.src_account, ext_id))
        .with_misc(PURCHASE_ID, purchase.id.to_string());

        self.engine.process_xfer(&req).await
    }

    pub async fn release_preauth(&self, preauth: XferId) -> Result<XferRecord, XferError> {
        self.engine
            .process_cancel(&CancelRequest::cancel(XferRef::Id(preauth)))
            .await
    }
}
