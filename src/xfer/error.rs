//! Transfer Error Types
//!
//! Every failure the engine can surface. Any error returned from inside a
//! transfer aborts the enclosing store transaction.

use thiserror::Error;

use crate::amount::AmountError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XferError {
    // === Unknown Entities ===
    #[error("Unknown account: {0}")]
    UnknownAccountID(String),

    #[error("Unknown account holder: {0}")]
    UnknownAccountHolder(String),

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Unknown limit group: {0}")]
    UnknownGroup(String),

    #[error("Unknown exchange pair: {0}")]
    UnknownPair(String),

    #[error("Limits not set for {0}")]
    LimitsNotSet(String),

    #[error("Unknown transfer: {0}")]
    UnknownXferID(String),

    // === Account / Funds ===
    #[error("Account or holder is disabled: {0}")]
    DisabledAccount(String),

    #[error("Not enough funds")]
    NotEnoughFunds,

    #[error("Hard limit would be exceeded")]
    LimitReject,

    // === Idempotency / Lifecycle ===
    #[error("Original transfer mismatch: {0}")]
    OriginalMismatch(String),

    #[error("Original transaction is too old")]
    OriginalTooOld,

    #[error("Transfer already completed")]
    AlreadyCompleted,

    #[error("Transfer already canceled")]
    AlreadyCanceled,

    // === Retail ===
    #[error("Pre-authorization is not available")]
    UnavailablePreAuth,

    #[error("Amount is too large")]
    AmountTooLarge,

    #[error("Purchase is already refunded")]
    AlreadyRefunded,

    #[error("Purchase not found")]
    PurchaseNotFound,

    // === System ===
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl XferError {
    /// Error code for the service boundary
    pub fn code(&self) -> &'static str {
        match self {
            XferError::UnknownAccountID(_) => "UnknownAccountID",
            XferError::UnknownAccountHolder(_) => "UnknownAccountHolder",
            XferError::UnknownCurrency(_) => "UnknownCurrency",
            XferError::UnknownGroup(_) => "UnknownGroup",
            XferError::UnknownPair(_) => "UnknownPair",
            XferError::LimitsNotSet(_) => "LimitsNotSet",
            XferError::UnknownXferID(_) => "UnknownXferID",
            XferError::DisabledAccount(_) => "DisabledAccount",
            XferError::NotEnoughFunds => "NotEnoughFunds",
            XferError::LimitReject => "LimitReject",
            XferError::OriginalMismatch(_) => "OriginalMismatch",
            XferError::OriginalTooOld => "OriginalTooOld",
            XferError::AlreadyCompleted => "AlreadyCompleted",
            XferError::AlreadyCanceled => "AlreadyCanceled",
            XferError::UnavailablePreAuth => "UnavailablePreAuth",
            XferError::AmountTooLarge => "AmountTooLarge",
            XferError::AlreadyRefunded => "AlreadyRefunded",
            XferError::PurchaseNotFound => "PurchaseNotFound",
            XferError::InternalError(_) | XferError::Database(_) => "InternalError",
        }
    }

    /// Whether the caller may resubmit the same request unchanged later.
    ///
    /// Only storage failures qualify; everything else is a business outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, XferError::Database(_))
    }
}

impl From<sqlx::Error> for XferError {
    fn from(e: sqlx::Error) -> Self {
        XferError::Database(e.to_string())
    }
}

impl From<AmountError> for XferError {
    fn from(e: AmountError) -> Self {
        XferError::InternalError(e.to_string())
    }
}

impl From<validator::ValidationErrors> for XferError {
    fn from(e: validator::ValidationErrors) -> Self {
        XferError::InternalError(format!("malformed request: {e}"))
    }
}

impl From<serde_json::Error> for XferError {
    fn from(e: serde_json::Error) -> Self {
        XferError::InternalError(e.to_string())
    }
}
