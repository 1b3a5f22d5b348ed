//! Data models for accounts and the registries the engine reads from

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::StatsMap;

/// Length of account and holder ids (URL-safe base64 of 16 bytes)
pub const ID_LEN: usize = 22;

fn generate_id() -> String {
    URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes())
}

fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque 22-character account id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(generate_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        is_valid_id(&self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque 22-character account holder id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(generate_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Account
// ============================================================================

/// Account kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum AccountKind {
    Regular = 1,
    System = 2,
    /// Counterpart of money entering or leaving the platform
    External = 3,
    /// Local proxy of a federated peer's account; no local economic meaning
    Transit = 4,
    Bonus = 5,
}

impl AccountKind {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountKind::Regular),
            2 => Some(AccountKind::System),
            3 => Some(AccountKind::External),
            4 => Some(AccountKind::Transit),
            5 => Some(AccountKind::Bonus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Regular => "Regular",
            AccountKind::System => "System",
            AccountKind::External => "External",
            AccountKind::Transit => "Transit",
            AccountKind::Bonus => "Bonus",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account snapshot as read inside a transfer transaction.
///
/// Amounts are in account currency display units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub holder: HolderId,
    pub currency: String,
    pub dec_places: u32,
    pub balance: Decimal,
    pub reserved: Decimal,
    pub overdraft: Decimal,
    pub enabled: bool,
    pub kind: AccountKind,
    pub ext_acct_id: Option<String>,
    pub rel_id: Option<AccountId>,
}

impl Account {
    pub fn new(
        holder: HolderId,
        currency: impl Into<String>,
        dec_places: u32,
        kind: AccountKind,
    ) -> Self {
        Self {
            id: AccountId::generate(),
            holder,
            currency: currency.into(),
            dec_places,
            balance: Decimal::ZERO,
            reserved: Decimal::ZERO,
            overdraft: Decimal::ZERO,
            enabled: true,
            kind,
            ext_acct_id: None,
            rel_id: None,
        }
    }

    /// `balance + overdraft − reserved`, saturating at the decimal bounds
    pub fn available(&self) -> Decimal {
        self.balance
            .saturating_add(self.overdraft)
            .saturating_sub(self.reserved)
    }

    pub fn is_transit(&self) -> bool {
        self.kind == AccountKind::Transit
    }
}

// ============================================================================
// Registry Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountHolder {
    pub id: HolderId,
    pub ext_id: String,
    pub group: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub dec_places: u32,
    pub enabled: bool,
}

/// `1 base = rate quote`, with a spread of `margin` either way
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExRate {
    pub rate: Decimal,
    pub margin: Decimal,
}

/// Limit thresholds of one group in one domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub currency: String,
    #[serde(default)]
    pub hard: StatsMap,
    #[serde(default)]
    pub check: StatsMap,
    #[serde(default)]
    pub risk: StatsMap,
}
