//! Decimal Amount Module
//!
//! Fixed-point conversion and arithmetic for ledger amounts. Every amount that
//! touches an account balance, a ledger row or a limit counter goes through
//! this module.
//!
//! ## Representations
//! - **Display**: decimal string in currency units (`"1.23"` EUR)
//! - **Storage**: integer string of `value × 10^places` (`"123"`)
//! - **Working**: [`rust_decimal::Decimal`]
//!
//! ## Rounding rules
//! 1. Storage conversion always truncates toward zero, so a stored integer
//!    never exceeds the true value.
//! 2. Currency conversion rounds up when the result will be debited and down
//!    when it will be credited. Never "nearest".
//! 3. Request input is never truncated silently: excess precision is an error.
//!
//! ## Usage
//! ```rust
//! use xfer_engine::amount::{from_storage, to_storage};
//!
//! assert_eq!(to_storage("1.239", 2).unwrap(), "123");
//! assert_eq!(from_storage("123", 2).unwrap(), "1.23");
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::prelude::*;
use thiserror::Error;

use crate::account::Account;

/// Highest scale `rust_decimal` can represent.
pub const MAX_PLACES: u32 = 28;

/// Integer digits accepted in a request amount. Keeps balances and limit
/// counters far below `Decimal::MAX` after any number of additions.
pub const MAX_WHOLE_DIGITS: usize = 18;

/// Flat limit-statistics map: `{prefix}_{window}_{amt|cnt}` → value.
///
/// `_cnt` entries are integral; everything ending in `_amt` is an amount.
pub type StatsMap = BTreeMap<String, Decimal>;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    NotPositive,

    #[error("Decimal places {0} out of range")]
    PlacesOutOfRange(u32),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Amount too large, would overflow")]
    Overflow,
}

fn check_places(places: u32) -> Result<(), AmountError> {
    if places > MAX_PLACES {
        return Err(AmountError::PlacesOutOfRange(places));
    }
    Ok(())
}

fn decimal(value: &str) -> Result<Decimal, AmountError> {
    Decimal::from_str(value.trim()).map_err(|_| AmountError::InvalidFormat(value.to_string()))
}

// ============================================================================
// Parse: Request → Working
// ============================================================================

/// Parse a client-supplied amount string.
///
/// Accepts plain positive decimals only (`"0.60"`, `"100"`). Signs, exponents,
/// `".5"` / `"5."` and more fractional digits than `places` are rejected.
pub fn parse_amount(amount_str: &str, places: u32) -> Result<Decimal, AmountError> {
    check_places(places)?;

    let s = amount_str.trim();
    if s.is_empty() {
        return Err(AmountError::InvalidFormat("empty string".into()));
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(AmountError::NotPositive);
    }

    let (whole, frac) = match s.split_once('.') {
        None => (s, ""),
        Some((w, f)) => {
            if w.is_empty() || f.is_empty() {
                return Err(AmountError::InvalidFormat(s.to_string()));
            }
            (w, f)
        }
    };

    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if !all_digits(whole) || !all_digits(frac) {
        return Err(AmountError::InvalidFormat(s.to_string()));
    }

    if whole.trim_start_matches('0').len() > MAX_WHOLE_DIGITS {
        return Err(AmountError::Overflow);
    }

    if frac.len() > places as usize {
        return Err(AmountError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: places,
        });
    }

    let value = Decimal::from_str(s).map_err(|_| AmountError::Overflow)?;
    if value.is_zero() {
        return Err(AmountError::NotPositive);
    }

    Ok(value)
}

// ============================================================================
// Storage ↔ Display
// ============================================================================

/// Convert a stored integer string into its display form.
///
/// Any fractional garbage in the integer string is truncated toward zero
/// before scaling.
pub fn from_storage(int_str: &str, places: u32) -> Result<String, AmountError> {
    check_places(places)?;

    let mut whole = decimal(int_str)?.trunc();
    whole.rescale(0);

    Ok(Decimal::from_i128_with_scale(whole.mantissa(), places).to_string())
}

/// Convert a display amount into its stored integer form, truncating toward
/// zero at `places` digits.
pub fn to_storage(dec_str: &str, places: u32) -> Result<String, AmountError> {
    Ok(storage_units(decimal(dec_str)?, places)?.to_string())
}

/// Working decimal → stored integer units.
pub fn storage_units(value: Decimal, places: u32) -> Result<i128, AmountError> {
    check_places(places)?;

    let mut truncated = value.round_dp_with_strategy(places, RoundingStrategy::ToZero);
    truncated.rescale(places);
    if truncated.scale() != places {
        return Err(AmountError::Overflow);
    }

    Ok(truncated.mantissa())
}

/// Stored integer units → working decimal.
pub fn from_storage_units(units: i128, places: u32) -> Result<Decimal, AmountError> {
    check_places(places)?;
    Decimal::try_from_i128_with_scale(units, places).map_err(|_| AmountError::Overflow)
}

// ============================================================================
// Currency Conversion
// ============================================================================

/// `amount × rate`, rounded to `places` digits up (away from zero) or down
/// (toward zero).
pub fn conv_amount(
    amount: Decimal,
    rate: Decimal,
    places: u32,
    round_up: bool,
) -> Result<Decimal, AmountError> {
    check_places(places)?;

    let strategy = if round_up {
        RoundingStrategy::AwayFromZero
    } else {
        RoundingStrategy::ToZero
    };

    let mut converted = amount
        .checked_mul(rate)
        .ok_or(AmountError::Overflow)?
        .round_dp_with_strategy(places, strategy);
    converted.rescale(places);

    Ok(converted)
}

pub fn buy_rate(rate: Decimal, margin: Decimal) -> Decimal {
    rate - margin
}

pub fn sell_rate(rate: Decimal, margin: Decimal) -> Decimal {
    rate + margin
}

pub fn back_rate(rate: Decimal) -> Result<Decimal, AmountError> {
    Decimal::ONE
        .checked_div(rate)
        .ok_or(AmountError::DivisionByZero)
}

/// First-order error propagation of a margin through `1/rate`.
pub fn back_margin(margin: Decimal, rate: Decimal) -> Result<Decimal, AmountError> {
    let rate_sq = rate.checked_mul(rate).ok_or(AmountError::Overflow)?;
    margin
        .checked_div(rate_sq)
        .ok_or(AmountError::DivisionByZero)
}

/// Apply [`conv_amount`] to every `*_amt` key; other keys pass through.
pub fn conv_all_amounts(
    map: &StatsMap,
    rate: Decimal,
    places: u32,
    round_up: bool,
) -> Result<StatsMap, AmountError> {
    map.iter()
        .map(|(key, value)| {
            let value = if key.ends_with("_amt") {
                conv_amount(*value, rate, places, round_up)?
            } else {
                *value
            };
            Ok((key.clone(), value))
        })
        .collect()
}

// ============================================================================
// Limit Statistics
// ============================================================================

/// Project `deltas` onto `stats`.
///
/// Keys already present in `stats` get `stats + delta`; counters with no
/// prior value are bootstrapped with the raw delta. Keys not in `deltas`
/// are not part of the result.
pub fn prep_new_stats(stats: &StatsMap, deltas: &StatsMap) -> Result<StatsMap, AmountError> {
    deltas
        .iter()
        .map(|(key, delta)| {
            let value = match stats.get(key) {
                Some(current) if key.ends_with("_amt") => current.checked_add(*delta),
                Some(current) => current.trunc().checked_add(delta.trunc()),
                None => Some(*delta),
            };
            Ok((key.clone(), value.ok_or(AmountError::Overflow)?))
        })
        .collect()
}

/// `true` when no limit in `limits` is violated by `stats`.
///
/// `*_min_amt` entries are floors; every other entry is a ceiling. Keys
/// missing on either side are not checked.
pub fn check_stats_limit(stats: &StatsMap, limits: &StatsMap) -> bool {
    stats.iter().all(|(key, value)| match limits.get(key) {
        Some(limit) if key.ends_with("_min_amt") => value >= limit,
        Some(limit) => value <= limit,
        None => true,
    })
}

/// `amount ≤ balance + overdraft − reserved`
pub fn check_xfer_amount(amount: Decimal, account: &Account) -> bool {
    amount <= account.available()
}

// ============================================================================
// Proportional Distribution
// ============================================================================

/// Split `total` across `shares` proportionally to their weights.
///
/// Each part is rounded down to `places`; the rounding loss goes to the
/// heaviest share (first key on ties) so the parts sum to `total` exactly.
pub fn distribute_win(
    shares: &BTreeMap<String, Decimal>,
    total: Decimal,
    places: u32,
) -> Result<BTreeMap<String, Decimal>, AmountError> {
    check_places(places)?;

    if shares.len() == 1 {
        return Ok(shares.keys().map(|k| (k.clone(), total)).collect());
    }

    let weight_sum: Decimal = shares.values().sum();
    if weight_sum.is_zero() {
        return Err(AmountError::DivisionByZero);
    }

    let mut parts = BTreeMap::new();
    let mut distributed = Decimal::ZERO;
    let mut heaviest: Option<(&String, Decimal)> = None;

    for (key, weight) in shares {
        let part = total
            .checked_mul(*weight)
            .ok_or(AmountError::Overflow)?
            .checked_div(weight_sum)
            .ok_or(AmountError::DivisionByZero)?
            .round_dp_with_strategy(places, RoundingStrategy::ToZero);

        distributed += part;
        parts.insert(key.clone(), part);

        if heaviest.is_none_or(|(_, w)| *weight > w) {
            heaviest = Some((key, *weight));
        }
    }

    if let Some((key, _)) = heaviest {
        let remainder = total - distributed;
        if let Some(part) = parts.get_mut(key) {
            *part += remainder;
        }
    }

    Ok(parts)
}

// ============================================================================
// Unit Tests
// ============================================================================
