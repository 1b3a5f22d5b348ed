//! Payments between holders, and messages carrying value
//!
//! Outbound payments ask the paying holder to confirm when the engine is
//! configured for it; the holder may also reject.

use std::sync::Arc;

use super::Domain;
use crate::account::AccountId;
use crate::limits::LimitDomain;
use crate::xfer::{
    CancelRequest, XferEngine, XferError, XferId, XferRecord, XferRef, XferRequest, make_ext_id,
};

pub const OUTBOUND: &str = "Outbound";
pub const INBOUND: &str = "Inbound";
pub const MESSAGE: &str = "Message";

pub struct PaymentService {
    engine: Arc<XferEngine>,
}

impl PaymentService {
    pub fn new(engine: Arc<XferEngine>) -> Self {
        Self { engine }
    }

    pub async fn outbound(
        &self,
        payer: &AccountId,
        payee: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
    ) -> Result<XferRecord, XferError> {
        let mut req = XferRequest::new(
            Domain::Payment,
            OUTBOUND,
            payer.clone(),
            payee.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(payer, ext_id))
        .with_src_limit(LimitDomain::Payments, "outbound");
        req.user_confirm = true;

        self.engine.process_xfer(&req).await
    }

    pub async fn inbound(
        &self,
        payer: &AccountId,
        payee: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
    ) -> Result<XferRecord, XferError> {
        let req = XferRequest::new(
            Domain::Payment,
            INBOUND,
            payer.clone(),
            payee.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(payee, ext_id))
        .with_dst_limit(LimitDomain::Payments, "inbound");

        self.engine.process_xfer(&req).await
    }

    /// Paid message: a small transfer counted against the `message` limits
    pub async fn message(
        &self,
        sender: &AccountId,
        recipient: &AccountId,
        currency: &str,
        amount: &str,
        ext_id: &str,
    ) -> Result<XferRecord, XferError> {
        let req = XferRequest::new(
            Domain::Message,
            MESSAGE,
            sender.clone(),
            recipient.clone(),
            currency,
            amount,
        )
        .with_ext_id(make_ext_id(sender, ext_id))
        .with_src_limit(LimitDomain::Misc, "message");

        self.engine.process_xfer(&req).await
    }

    pub async fn user_confirm(&self, id: XferId) -> Result<XferRecord, XferError> {
        self.engine.confirm_xfer(&XferRef::Id(id)).await
    }

    pub async fn user_reject(&self, id: XferId) -> Result<XferRecord, XferError> {
        self.engine.process_cancel(&CancelRequest::reject(id)).await
    }
}
