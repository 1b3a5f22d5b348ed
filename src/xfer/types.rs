//! Transfer Core Types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use super::error::XferError;
use super::state::XferStatus;
use crate::account::AccountId;
use crate::domain::Domain;
use crate::limits::{AppliedLimit, LimitDomain, LimitSpec};

/// Ledger entry id (UUID v4), unique across the whole ledger history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XferId(uuid::Uuid);

impl XferId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn inner(&self) -> uuid::Uuid {
        self.0
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for XferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for XferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for XferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

// ============================================================================
// External Ids
// ============================================================================

/// Scope a counterparty's idempotency key to one of the transfer accounts.
pub fn make_ext_id(account: &AccountId, raw: &str) -> String {
    format!("{raw}:{account}")
}

/// External ids must be scoped to the source or destination account.
pub fn ext_id_matches(ext_id: &str, src: &AccountId, dst: &AccountId) -> bool {
    [src, dst].into_iter().any(|acct| {
        ext_id == acct.as_str()
            || ext_id
                .strip_suffix(acct.as_str())
                .is_some_and(|head| head.ends_with(':'))
    })
}

// ============================================================================
// Requests
// ============================================================================

/// Fee charged to the source account alongside the main transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct FeeRequest {
    #[validate(length(min = 1, max = 32))]
    pub xfer_type: String,
    pub dst_account: AccountId,
    #[validate(length(min = 1, max = 16))]
    pub currency: String,
    #[validate(length(min = 1, max = 64))]
    pub amount: String,
}

/// Input of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct XferRequest {
    pub domain: Domain,
    #[validate(length(min = 1, max = 32))]
    pub xfer_type: String,
    pub src_account: AccountId,
    pub dst_account: AccountId,
    #[validate(length(min = 1, max = 16))]
    pub currency: String,
    #[validate(length(min = 1, max = 64))]
    pub amount: String,
    /// Idempotency key scoped to one of the accounts
    #[validate(length(min = 1, max = 128))]
    pub ext_id: Option<String>,
    pub orig_ts: Option<DateTime<Utc>>,
    pub src_limit: Option<LimitSpec>,
    pub dst_limit: Option<LimitSpec>,
    pub fee: Option<FeeRequest>,
    /// Skip enabled and funds checks
    pub force: bool,
    /// Reserve and wait for the holder to confirm
    pub user_confirm: bool,
    /// Reserve and wait for the caller to confirm
    pub hold: bool,
    pub misc: Map<String, Value>,
}

impl XferRequest {
    pub fn new(
        domain: Domain,
        xfer_type: impl Into<String>,
        src_account: AccountId,
        dst_account: AccountId,
        currency: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            xfer_type: xfer_type.into(),
            src_account,
            dst_account,
            currency: currency.into(),
            amount: amount.into(),
            ext_id: None,
            orig_ts: None,
            src_limit: None,
            dst_limit: None,
            fee: None,
            force: false,
            user_confirm: false,
            hold: false,
            misc: Map::new(),
        }
    }

    pub fn with_ext_id(mut self, ext_id: impl Into<String>) -> Self {
        self.ext_id = Some(ext_id.into());
        self
    }

    pub fn with_orig_ts(mut self, orig_ts: DateTime<Utc>) -> Self {
        self.orig_ts = Some(orig_ts);
        self
    }

    pub fn with_src_limit(mut self, domain: LimitDomain, prefix: &str) -> Self {
        self.src_limit = Some(LimitSpec::new(domain, prefix));
        self
    }

    pub fn with_dst_limit(mut self, domain: LimitDomain, prefix: &str) -> Self {
        self.dst_limit = Some(LimitSpec::new(domain, prefix));
        self
    }

    pub fn with_fee(mut self, fee: FeeRequest) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn with_misc(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.misc.insert(key.to_string(), value.into());
        self
    }

    /// Full shape validation: field lengths, account ids and limit prefixes
    pub fn check_shape(&self) -> Result<(), XferError> {
        self.validate()?;

        for acct in [&self.src_account, &self.dst_account] {
            if !acct.is_valid() {
                return Err(XferError::InternalError(format!("invalid account id: {acct}")));
            }
        }
        if self.src_account == self.dst_account {
            return Err(XferError::InternalError(
                "source and destination are the same".into(),
            ));
        }
        if self.user_confirm && self.hold {
            return Err(XferError::InternalError(
                "user_confirm and hold are exclusive".into(),
            ));
        }

        for spec in [&self.src_limit, &self.dst_limit].into_iter().flatten() {
            spec.validate()?;
        }

        if let Some(fee) = &self.fee {
            fee.validate()?;
            if !fee.dst_account.is_valid() || fee.dst_account == self.src_account {
                return Err(XferError::InternalError("invalid fee account".into()));
            }
        }

        if let Some(ext_id) = &self.ext_id
            && !ext_id_matches(ext_id, &self.src_account, &self.dst_account)
        {
            return Err(XferError::InternalError(format!(
                "external id {ext_id} is not scoped to a transfer account"
            )));
        }

        Ok(())
    }

    /// Whether the source funds should be held rather than moved
    pub fn reserves(&self) -> bool {
        self.user_confirm || self.hold
    }
}

/// Lookup key of an existing ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferRef {
    Id(XferId),
    ExtId(String),
}

impl fmt::Display for XferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferRef::Id(id) => write!(f, "{id}"),
            XferRef::ExtId(ext_id) => write!(f, "ext:{ext_id}"),
        }
    }
}

impl From<XferId> for XferRef {
    fn from(id: XferId) -> Self {
        XferRef::Id(id)
    }
}

/// Cancellation of a reserved ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub target: XferRef,
    /// The holder rejects the transfer; only `WaitUser` entries qualify
    pub reject_mode: bool,
    pub reason: Option<String>,
}

impl CancelRequest {
    pub fn cancel(target: impl Into<XferRef>) -> Self {
        Self {
            target: target.into(),
            reject_mode: false,
            reason: None,
        }
    }

    pub fn reject(target: impl Into<XferRef>) -> Self {
        Self {
            target: target.into(),
            reject_mode: true,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ============================================================================
// Ledger Entries
// ============================================================================

/// Persisted ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XferRecord {
    pub id: XferId,
    pub domain: Domain,
    pub xfer_type: String,
    pub src_account: AccountId,
    /// In source account currency
    pub src_amount: Decimal,
    pub dst_account: AccountId,
    /// In destination account currency
    pub dst_amount: Decimal,
    pub currency: String,
    /// Nominal amount in `currency`
    pub amount: Decimal,
    pub ext_id: Option<String>,
    pub orig_ts: DateTime<Utc>,
    pub status: XferStatus,
    pub misc_data: Map<String, Value>,
    pub limits: Vec<AppliedLimit>,
    pub fee_xfer: Option<XferId>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl XferRecord {
    /// A replayed request must carry the same core fields as the original.
    pub fn check_replay(&self, req: &XferRequest, amount: Decimal) -> Result<(), XferError> {
        let mismatch = if self.xfer_type != req.xfer_type {
            Some("type")
        } else if self.src_account != req.src_account {
            Some("source account")
        } else if self.dst_account != req.dst_account {
            Some("destination account")
        } else if self.currency != req.currency {
            Some("currency")
        } else if self.amount != amount {
            Some("amount")
        } else {
            None
        };

        match mismatch {
            Some(field) => Err(XferError::OriginalMismatch(field.to_string())),
            None => Ok(()),
        }
    }

    pub fn misc_str(&self, key: &str) -> Option<&str> {
        self.misc_data.get(key).and_then(Value::as_str)
    }
}
