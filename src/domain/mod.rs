//! Domain Extensions
//!
//! Every transfer belongs to one [`Domain`]. The domain adds steps to the
//! pipeline at fixed points:
//!
//! | Hook             | Runs                       |
//! |------------------|----------------------------|
//! | `db_prepare`     | before the funds check     |
//! | `db_step`        | before the ledger row write|
//! | `db_cancel_step` | during cancellation        |
//! | `ext_*`          | after commit, from outbox  |
//!
//! The set of domains is closed; dispatch is a `match`.

pub mod deposit;
pub mod gaming;
pub mod payment;
pub mod retail;

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::account::Account;
use crate::config::EngineConfig;
use crate::xfer::{
    Direction, LedgerTx, OpResult, OutboxEntry, PeerGateway, PeerOp, PeerRequest, XferError,
    XferId, XferRecord, XferStatus,
};

pub use deposit::DepositService;
pub use gaming::GamingService;
pub use payment::PaymentService;
pub use retail::RetailService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Generic,
    Deposit,
    Payment,
    Retail,
    Gaming,
    Message,
}

/// Transfer as seen by the in-transaction hooks
#[derive(Debug)]
pub struct XferContext<'a> {
    pub id: XferId,
    pub xfer_type: &'a str,
    pub src: &'a Account,
    pub dst: &'a Account,
    pub currency: &'a str,
    pub amount: Decimal,
    pub src_amount: Decimal,
    pub dst_amount: Decimal,
    pub status: XferStatus,
    pub misc: &'a Map<String, Value>,
    pub now: DateTime<Utc>,
    pub config: &'a EngineConfig,
}

/// What `db_prepare` found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    /// Source funds that `db_step` will release before the debit
    pub released: Decimal,
}

impl Domain {
    pub const ALL: [Domain; 6] = [
        Domain::Generic,
        Domain::Deposit,
        Domain::Payment,
        Domain::Retail,
        Domain::Gaming,
        Domain::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Generic => "Generic",
            Domain::Deposit => "Deposit",
            Domain::Payment => "Payment",
            Domain::Retail => "Retail",
            Domain::Gaming => "Gaming",
            Domain::Message => "Message",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    // === In-transaction hooks ===

    pub async fn db_prepare(
        &self,
        tx: &mut dyn LedgerTx,
        ctx: &XferContext<'_>,
    ) -> Result<Prepared, XferError> {
        match self {
            Domain::Retail => retail::db_prepare(tx, ctx).await,
            _ => Ok(Prepared::default()),
        }
    }

    /// May add fields to the ledger row's misc data
    pub async fn db_step(
        &self,
        tx: &mut dyn LedgerTx,
        ctx: &XferContext<'_>,
        misc: &mut Map<String, Value>,
    ) -> Result<(), XferError> {
        match self {
            Domain::Retail => retail::db_step(tx, ctx, misc).await,
            Domain::Gaming => gaming::db_step(tx, ctx, misc).await,
            _ => Ok(()),
        }
    }

    pub async fn db_cancel_step(
        &self,
        tx: &mut dyn LedgerTx,
        record: &XferRecord,
        now: DateTime<Utc>,
    ) -> Result<(), XferError> {
        match self {
            Domain::Retail => retail::db_cancel_step(tx, record, now).await,
            _ => Ok(()),
        }
    }

    // === Peer federation hooks ===

    /// Route an outbox entry to the matching `ext_*` hook
    pub async fn dispatch_ext(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        match (entry.direction, entry.op) {
            (Direction::In, PeerOp::Start) => self.ext_in(gateway, entry).await,
            (Direction::Out, PeerOp::Start) => self.ext_out(gateway, entry).await,
            (Direction::In, PeerOp::Confirm) => self.confirm_ext_in(gateway, entry).await,
            (Direction::Out, PeerOp::Confirm) => self.confirm_ext_out(gateway, entry).await,
            (Direction::In, PeerOp::Cancel) => self.cancel_ext_in(gateway, entry).await,
            (Direction::Out, PeerOp::Cancel) => self.cancel_ext_out(gateway, entry).await,
        }
    }

    pub async fn ext_in(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        gateway.pull(&self.peer_request(entry)).await
    }

    pub async fn ext_out(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        gateway.push(&self.peer_request(entry)).await
    }

    pub async fn confirm_ext_in(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        gateway.confirm_pull(&self.peer_request(entry)).await
    }

    pub async fn confirm_ext_out(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        gateway.confirm_push(&self.peer_request(entry)).await
    }

    pub async fn cancel_ext_in(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        gateway.cancel_pull(&self.peer_request(entry)).await
    }

    pub async fn cancel_ext_out(&self, gateway: &dyn PeerGateway, entry: &OutboxEntry) -> OpResult {
        gateway.cancel_push(&self.peer_request(entry)).await
    }

    fn peer_request(&self, entry: &OutboxEntry) -> PeerRequest {
        PeerRequest {
            ext_id: entry.xfer_id.to_string(),
            domain: self.as_str(),
            rel_account: entry.rel_account.clone(),
            payload: entry.payload.clone(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read a ledger id out of a misc field
pub(crate) fn misc_xfer_id(misc: &Map<String, Value>, key: &str) -> Option<XferId> {
    misc.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}
