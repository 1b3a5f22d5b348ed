//! Limits Statistics Engine
//!
//! Applies one transfer side to the holder's rolling counters inside the
//! ledger transaction. The write is a guarded relative update; a lost race
//! re-reads the row and retries a bounded number of times before rejecting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::types::{AppliedLimit, LimitSpec, LimitStats, persisted_only};
use crate::account::{Account, LimitsConfig, Registry, conversion_rate};
use crate::amount::{StatsMap, back_rate, check_stats_limit, conv_all_amounts, prep_new_stats};
use crate::xfer::{LedgerTx, XferError};

/// Flags raised by soft thresholds; never fatal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitOutcome {
    pub do_check: bool,
    pub do_risk: bool,
    pub applied: Option<AppliedLimit>,
}

pub struct LimitsEngine {
    registry: Arc<dyn Registry>,
    /// Extra attempts after a lost guarded update
    retries: u32,
}

impl LimitsEngine {
    pub fn new(registry: Arc<dyn Registry>, retries: u32) -> Self {
        Self { registry, retries }
    }

    /// Count `amount` (in `xfer_currency`) against `account`'s holder.
    pub async fn add_xfer(
        &self,
        tx: &mut dyn LedgerTx,
        account: &Account,
        spec: &LimitSpec,
        xfer_currency: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LimitOutcome, XferError> {
        spec.validate()?;
        let holder = self.registry.get_account_holder(&account.holder).await?;
        let limits = self.registry.get_limits(&holder.group, spec.domain).await?;

        let mut row = tx.limit_stats(&holder.id, spec.domain).await?;
        let stats_currency = row
            .as_ref()
            .map_or_else(|| limits.currency.clone(), |r| r.currency.clone());

        let deltas = self
            .to_stats_currency(&spec.deltas(amount), xfer_currency, &stats_currency)
            .await?;
        let limits = self.limits_in(&limits, &stats_currency).await?;
        let hard = persisted_only(&limits.hard);
        let persisted_deltas = persisted_only(&deltas);

        for attempt in 0..=self.retries {
            let current = row
                .as_ref()
                .map(|r| r.current(now))
                .unwrap_or_default();
            let new_stats = prep_new_stats(&current, &deltas)?;

            if !check_stats_limit(&new_stats, &limits.hard) {
                debug!(
                    holder = %holder.id,
                    domain = %spec.domain,
                    prefix = %spec.prefix,
                    "Hard limit rejects transfer"
                );
                return Err(XferError::LimitReject);
            }

            let written = match &row {
                None => {
                    let fresh = LimitStats {
                        currency: stats_currency.clone(),
                        stats_date: now,
                        stats: persisted_only(&new_stats),
                    };
                    tx.insert_limit_stats(&holder.id, spec.domain, &fresh).await?
                }
                Some(_) => {
                    tx.update_limit_stats(&holder.id, spec.domain, &persisted_deltas, &hard, now)
                        .await?
                }
            };

            if written {
                let stats_amount = deltas
                    .get(&format!("{}_daily_amt", spec.prefix))
                    .copied()
                    .unwrap_or(amount);

                return Ok(LimitOutcome {
                    do_check: !check_stats_limit(&new_stats, &limits.check),
                    do_risk: !check_stats_limit(&new_stats, &limits.risk),
                    applied: Some(AppliedLimit {
                        holder: holder.id.clone(),
                        spec: spec.clone(),
                        currency: stats_currency,
                        amount: stats_amount,
                        date: now,
                    }),
                });
            }

            warn!(
                holder = %holder.id,
                domain = %spec.domain,
                attempt,
                "Limit stats update lost a race, re-reading"
            );
            row = tx.limit_stats(&holder.id, spec.domain).await?;
        }

        Err(XferError::LimitReject)
    }

    /// Reverse a previous [`add_xfer`](Self::add_xfer) for windows that still
    /// cover its date. No ceilings apply.
    pub async fn cancel_xfer(
        &self,
        tx: &mut dyn LedgerTx,
        applied: &AppliedLimit,
        now: DateTime<Utc>,
    ) -> Result<(), XferError> {
        let deltas = applied.spec.cancel_deltas(applied.amount, applied.date, now);
        if deltas.is_empty() {
            return Ok(());
        }

        let updated = tx
            .update_limit_stats(
                &applied.holder,
                applied.spec.domain,
                &deltas,
                &StatsMap::new(),
                now,
            )
            .await?;
        if !updated {
            warn!(
                holder = %applied.holder,
                domain = %applied.spec.domain,
                "No stats row to reverse"
            );
        }
        Ok(())
    }

    /// Deltas arrive in transfer currency; counters are kept in the stats
    /// currency. Amounts round up so counters never under-count.
    async fn to_stats_currency(
        &self,
        deltas: &StatsMap,
        xfer_currency: &str,
        stats_currency: &str,
    ) -> Result<StatsMap, XferError> {
        if xfer_currency == stats_currency {
            return Ok(deltas.clone());
        }
        let places = self.registry.get_currency(stats_currency).await?.dec_places;
        let rate = conversion_rate(self.registry.as_ref(), stats_currency, xfer_currency).await?;
        Ok(conv_all_amounts(deltas, back_rate(rate.rate)?, places, true)?)
    }

    /// Thresholds converted into the stats currency, rounded down.
    async fn limits_in(
        &self,
        limits: &LimitsConfig,
        stats_currency: &str,
    ) -> Result<LimitsConfig, XferError> {
        if limits.currency == stats_currency {
            return Ok(limits.clone());
        }
        let places = self.registry.get_currency(stats_currency).await?.dec_places;
        let rate = conversion_rate(self.registry.as_ref(), stats_currency, &limits.currency).await?;
        let inverse = back_rate(rate.rate)?;

        Ok(LimitsConfig {
            currency: stats_currency.to_string(),
            hard: conv_all_amounts(&limits.hard, inverse, places, false)?,
            check: conv_all_amounts(&limits.check, inverse, places, false)?,
            risk: conv_all_amounts(&limits.risk, inverse, places, false)?,
        })
    }
}
