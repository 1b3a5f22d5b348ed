//! Limit domains, rolling windows and statistics rows

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::HolderId;
use crate::amount::StatsMap;
use crate::xfer::XferError;

// ============================================================================
// Domains
// ============================================================================

/// Category of rolling counters. Each domain has its own stats table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LimitDomain {
    Payments,
    Retail,
    Gaming,
    Deposits,
    Misc,
    Personnel,
}

impl LimitDomain {
    pub const ALL: [LimitDomain; 6] = [
        LimitDomain::Payments,
        LimitDomain::Retail,
        LimitDomain::Gaming,
        LimitDomain::Deposits,
        LimitDomain::Misc,
        LimitDomain::Personnel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDomain::Payments => "Payments",
            LimitDomain::Retail => "Retail",
            LimitDomain::Gaming => "Gaming",
            LimitDomain::Deposits => "Deposits",
            LimitDomain::Misc => "Misc",
            LimitDomain::Personnel => "Personnel",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    /// Counter prefixes tracked in this domain
    pub fn prefixes(&self) -> &'static [&'static str] {
        match self {
            LimitDomain::Payments => &["outbound", "inbound"],
            LimitDomain::Retail => &["retail", "preauth"],
            LimitDomain::Gaming => &["bet", "win"],
            LimitDomain::Deposits => &["deposit", "withdrawal"],
            LimitDomain::Misc => &["message"],
            LimitDomain::Personnel => &["personnel"],
        }
    }

    pub fn stats_table(&self) -> &'static str {
        match self {
            LimitDomain::Payments => "limit_payments_stats",
            LimitDomain::Retail => "limit_retail_stats",
            LimitDomain::Gaming => "limit_gaming_stats",
            LimitDomain::Deposits => "limit_deposits_stats",
            LimitDomain::Misc => "limit_misc_stats",
            LimitDomain::Personnel => "limit_personnel_stats",
        }
    }

    /// Every persisted counter column of this domain
    pub fn counter_keys(&self) -> Vec<String> {
        self.prefixes()
            .iter()
            .flat_map(|p| {
                Window::ALL.into_iter().flat_map(move |w| {
                    [
                        format!("{p}_{}_amt", w.as_str()),
                        format!("{p}_{}_cnt", w.as_str()),
                    ]
                })
            })
            .collect()
    }
}

impl fmt::Display for LimitDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Windows
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Daily,
    Weekly,
    Monthly,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Daily, Window::Weekly, Window::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Daily => "daily",
            Window::Weekly => "weekly",
            Window::Monthly => "monthly",
        }
    }

    /// PostgreSQL `date_trunc` field
    pub fn trunc_field(&self) -> &'static str {
        match self {
            Window::Daily => "day",
            Window::Weekly => "week",
            Window::Monthly => "month",
        }
    }

    /// Window of a `{prefix}_{window}_{amt|cnt}` key
    pub fn of_key(key: &str) -> Option<Window> {
        Window::ALL
            .into_iter()
            .find(|w| key.contains(&format!("_{}_", w.as_str())))
    }

    /// Whether `then` falls in the same window as `now`
    pub fn covers(&self, then: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Window::Daily => then.date_naive() == now.date_naive(),
            Window::Weekly => then.iso_week() == now.iso_week(),
            Window::Monthly => then.year() == now.year() && then.month() == now.month(),
        }
    }
}

// ============================================================================
// Stats Rows
// ============================================================================

/// One persisted statistics row per (holder, domain)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitStats {
    pub currency: String,
    /// Time of the last write; decides which windows are still live
    pub stats_date: DateTime<Utc>,
    pub stats: StatsMap,
}

impl LimitStats {
    /// Counters as of `now`: windows that rolled over since the last write
    /// read as zero.
    pub fn current(&self, now: DateTime<Utc>) -> StatsMap {
        self.stats
            .iter()
            .map(|(key, value)| {
                let live = Window::of_key(key).is_none_or(|w| w.covers(self.stats_date, now));
                (key.clone(), if live { *value } else { Decimal::ZERO })
            })
            .collect()
    }

    /// Apply `deltas` unless a resulting counter would exceed its `hard`
    /// ceiling. Rolled windows are reset first. Returns `false` and leaves the
    /// row untouched when a guard fails.
    pub fn try_apply(&mut self, deltas: &StatsMap, hard: &StatsMap, now: DateTime<Utc>) -> bool {
        let mut next = self.current(now);

        for (key, delta) in deltas {
            let value = next.entry(key.clone()).or_insert(Decimal::ZERO);
            let Some(sum) = value.checked_add(*delta) else {
                return false;
            };
            *value = sum;

            if let Some(limit) = hard.get(key)
                && !key.ends_with("_min_amt")
                && *value > *limit
            {
                return false;
            }
        }

        self.stats = next;
        self.stats_date = now;
        true
    }
}

// ============================================================================
// Transfer-side Specs
// ============================================================================

/// Which counters a transfer side feeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub domain: LimitDomain,
    pub prefix: String,
}

impl LimitSpec {
    pub fn new(domain: LimitDomain, prefix: impl Into<String>) -> Self {
        Self {
            domain,
            prefix: prefix.into(),
        }
    }

    pub fn validate(&self) -> Result<(), XferError> {
        if self.domain.prefixes().contains(&self.prefix.as_str()) {
            Ok(())
        } else {
            Err(XferError::InternalError(format!(
                "unknown limit prefix {} in {}",
                self.prefix, self.domain
            )))
        }
    }

    /// Deltas of one transaction of `amount`, including the per-transaction
    /// `{prefix}_min_amt` floor check
    pub fn deltas(&self, amount: Decimal) -> StatsMap {
        let p = &self.prefix;
        let mut deltas = StatsMap::new();
        deltas.insert(format!("{p}_min_amt"), amount);
        for w in Window::ALL {
            deltas.insert(format!("{p}_{}_amt", w.as_str()), amount);
            deltas.insert(format!("{p}_{}_cnt", w.as_str()), Decimal::ONE);
        }
        deltas
    }

    /// Reversal deltas for windows that still cover `date`
    pub fn cancel_deltas(&self, amount: Decimal, date: DateTime<Utc>, now: DateTime<Utc>) -> StatsMap {
        let p = &self.prefix;
        let mut deltas = StatsMap::new();
        for w in Window::ALL.into_iter().filter(|w| w.covers(date, now)) {
            deltas.insert(format!("{p}_{}_amt", w.as_str()), -amount);
            deltas.insert(format!("{p}_{}_cnt", w.as_str()), -Decimal::ONE);
        }
        deltas
    }
}

/// Counters a committed transfer fed, kept on the ledger row so that a later
/// cancellation reverses exactly what was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedLimit {
    pub holder: HolderId,
    pub spec: LimitSpec,
    /// Stats currency at the time of application
    pub currency: String,
    /// Amount added, in `currency`
    pub amount: Decimal,
    pub date: DateTime<Utc>,
}

/// Strip per-transaction keys; only rolling counters are persisted.
pub fn persisted_only(map: &StatsMap) -> StatsMap {
    map.iter()
        .filter(|(k, _)| !k.ends_with("_min_amt"))
        .map(|(k, v)| (k.clone(), *v))
        .collect()
}
