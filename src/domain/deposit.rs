//! Deposits and withdrawals between a holder and a system account
//!
//! Deposits complete at once. Withdrawals hold the funds until the payout is
//! confirmed or rejected by the operator.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::Domain;
use crate::account::AccountId;
use crate::limits::LimitDomain;
use crate::xfer::{
    CancelRequest, XferEngine, XferError, XferId, XferRecord, XferRef, XferRequest, make_ext_id,
};

pub const DEPOSIT: &str = "Deposit";
pub const WITHDRAWAL: &str = "Withdrawal";

pub struct DepositService {
    engine: Arc<XferEngine>,
}

impl DepositService {
    pub fn new(engine: Arc<XferEngine>) -> Self {
        Self { engine }
    }

    /// Credit `user` from `system`. Idempotent on `(ext_id, user)`.
    pub async fn on_deposit(
        &self,
        user: &AccountId,
        system: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
        orig_ts: Option<DateTime<Utc>>,
    ) -> Result<XferRecord, XferError> {
        let mut req = XferRequest::new(
            Domain::Deposit,
            DEPOSIT,
            system.clone(),
            user.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(user, ext_id))
        .with_dst_limit(LimitDomain::Deposits, "deposit");
        req.orig_ts = orig_ts;

        self.engine.process_xfer(&req).await
    }

    /// Hold `amount` on `user` for a payout through `system`
    pub async fn on_withdraw(
        &self,
        user: &AccountId,
        system: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
        orig_ts: Option<DateTime<Utc>>,
    ) -> Result<XferRecord, XferError> {
        let mut req = XferRequest::new(
            Domain::Deposit,
            WITHDRAWAL,
            user.clone(),
            system.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(user, ext_id))
        .with_src_limit(LimitDomain::Deposits, "withdrawal");
        req.orig_ts = orig_ts;
        req.hold = true;

        self.engine.process_xfer(&req).await
    }

    pub async fn confirm_withdraw(&self, id: XferId) -> Result<XferRecord, XferError> {
        self.engine.confirm_xfer(&XferRef::Id(id)).await
    }

    pub async fn reject_withdraw(&self, id: XferId, reason: &str) -> Result<XferRecord, XferError> {
        self.engine
            .process_cancel(&CancelRequest::cancel(id).with_reason(reason))
            .await
    }
}
