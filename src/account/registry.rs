//! Read-only registries the engine consumes: holders, limit groups,
//! currencies and exchange rates.
//!
//! Their CRUD lives elsewhere; only the query contracts are defined here.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use super::models::{AccountHolder, Currency, ExRate, HolderId, LimitsConfig};
use crate::amount::{StatsMap, back_margin, back_rate};
use crate::limits::LimitDomain;
use crate::xfer::XferError;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Fails `UnknownAccountHolder`
    async fn get_account_holder(&self, id: &HolderId) -> Result<AccountHolder, XferError>;

    /// Fails `UnknownGroup` when the group has no limits in any domain,
    /// `LimitsNotSet` when only this domain is missing
    async fn get_limits(&self, group: &str, domain: LimitDomain)
    -> Result<LimitsConfig, XferError>;

    /// Fails `UnknownCurrency`
    async fn get_currency(&self, code: &str) -> Result<Currency, XferError>;

    /// `1 base = rate quote`. Fails `UnknownPair`
    async fn get_ex_rate(&self, base: &str, quote: &str) -> Result<ExRate, XferError>;
}

/// Rate for converting `from` into `to`.
///
/// Uses the `(from, to)` pair when registered, else inverts `(to, from)`.
pub async fn conversion_rate(
    registry: &dyn Registry,
    from: &str,
    to: &str,
) -> Result<ExRate, XferError> {
    match registry.get_ex_rate(from, to).await {
        Ok(rate) => Ok(rate),
        Err(XferError::UnknownPair(_)) => {
            let inverse = registry.get_ex_rate(to, from).await?;
            Ok(ExRate {
                rate: back_rate(inverse.rate)?,
                margin: back_margin(inverse.margin, inverse.rate)?,
            })
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Registry backed by the platform's PostgreSQL tables
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Registry for PgRegistry {
    async fn get_account_holder(&self, id: &HolderId) -> Result<AccountHolder, XferError> {
        let row = sqlx::query(
            r#"SELECT uuidb64, ext_id, group_name, enabled
               FROM account_holders WHERE uuidb64 = $1"#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| XferError::UnknownAccountHolder(id.to_string()))?;

        Ok(AccountHolder {
            id: HolderId::new(row.get::<String, _>("uuidb64")),
            ext_id: row.get("ext_id"),
            group: row.get("group_name"),
            enabled: row.get("enabled"),
        })
    }

    async fn get_limits(
        &self,
        group: &str,
        domain: LimitDomain,
    ) -> Result<LimitsConfig, XferError> {
        let row = sqlx::query(
            r#"SELECT currency, hard, check_lim, risk
               FROM limits WHERE group_name = $1 AND domain = $2"#,
        )
        .bind(group)
        .bind(domain.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            let known: bool =
                sqlx::query_scalar(r#"SELECT EXISTS(SELECT 1 FROM limits WHERE group_name = $1)"#)
                    .bind(group)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if known {
                XferError::LimitsNotSet(format!("{group}/{domain}"))
            } else {
                XferError::UnknownGroup(group.to_string())
            });
        };

        Ok(LimitsConfig {
            currency: row.get("currency"),
            hard: row.get::<Json<StatsMap>, _>("hard").0,
            check: row.get::<Json<StatsMap>, _>("check_lim").0,
            risk: row.get::<Json<StatsMap>, _>("risk").0,
        })
    }

    async fn get_currency(&self, code: &str) -> Result<Currency, XferError> {
        let row = sqlx::query(r#"SELECT code, dec_places, enabled FROM currencies WHERE code = $1"#)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| XferError::UnknownCurrency(code.to_string()))?;

        Ok(Currency {
            code: row.get("code"),
            dec_places: row.get::<i16, _>("dec_places") as u32,
            enabled: row.get("enabled"),
        })
    }

    async fn get_ex_rate(&self, base: &str, quote: &str) -> Result<ExRate, XferError> {
        let row = sqlx::query(r#"SELECT rate, margin FROM exrates WHERE base = $1 AND quote = $2"#)
            .bind(base)
            .bind(quote)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| XferError::UnknownPair(format!("{base}/{quote}")))?;

        Ok(ExRate {
            rate: row.get::<Decimal, _>("rate"),
            margin: row.get::<Decimal, _>("margin"),
        })
    }
}

// ============================================================================
// In-memory (dev/test)
// ============================================================================

#[cfg(feature = "mock-api")]
pub use memory::MemoryRegistry;

#[cfg(feature = "mock-api")]
mod memory {
    use std::collections::HashMap;
    use std::sync::RwLock;

    use super::*;

    #[derive(Default)]
    struct Tables {
        holders: HashMap<HolderId, AccountHolder>,
        limits: HashMap<(String, LimitDomain), LimitsConfig>,
        currencies: HashMap<String, Currency>,
        rates: HashMap<(String, String), ExRate>,
    }

    /// Registry held in process memory
    #[derive(Default)]
    pub struct MemoryRegistry {
        tables: RwLock<Tables>,
    }

    impl MemoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_currency(&self, code: &str, dec_places: u32) {
            let currency = Currency {
                code: code.to_string(),
                dec_places,
                enabled: true,
            };
            self.write().currencies.insert(code.to_string(), currency);
        }

        pub fn add_holder(&self, group: &str) -> HolderId {
            let id = HolderId::generate();
            let holder = AccountHolder {
                id: id.clone(),
                ext_id: id.to_string(),
                group: group.to_string(),
                enabled: true,
            };
            self.write().holders.insert(id.clone(), holder);
            id
        }

        pub fn set_holder_enabled(&self, id: &HolderId, enabled: bool) {
            if let Some(holder) = self.write().holders.get_mut(id) {
                holder.enabled = enabled;
            }
        }

        pub fn set_limits(&self, group: &str, domain: LimitDomain, limits: LimitsConfig) {
            self.write()
                .limits
                .insert((group.to_string(), domain), limits);
        }

        pub fn set_ex_rate(&self, base: &str, quote: &str, rate: Decimal, margin: Decimal) {
            self.write().rates.insert(
                (base.to_string(), quote.to_string()),
                ExRate { rate, margin },
            );
        }

        fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
            self.tables.read().unwrap_or_else(|e| e.into_inner())
        }

        fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
            self.tables.write().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl Registry for MemoryRegistry {
        async fn get_account_holder(&self, id: &HolderId) -> Result<AccountHolder, XferError> {
            self.read()
                .holders
                .get(id)
                .cloned()
                .ok_or_else(|| XferError::UnknownAccountHolder(id.to_string()))
        }

        async fn get_limits(
            &self,
            group: &str,
            domain: LimitDomain,
        ) -> Result<LimitsConfig, XferError> {
            let tables = self.read();
            if let Some(limits) = tables.limits.get(&(group.to_string(), domain)) {
                return Ok(limits.clone());
            }
            if tables.limits.keys().any(|(g, _)| g == group) {
                Err(XferError::LimitsNotSet(format!("{group}/{domain}")))
            } else {
                Err(XferError::UnknownGroup(group.to_string()))
            }
        }

        async fn get_currency(&self, code: &str) -> Result<Currency, XferError> {
            self.read()
                .currencies
                .get(code)
                .cloned()
                .ok_or_else(|| XferError::UnknownCurrency(code.to_string()))
        }

        async fn get_ex_rate(&self, base: &str, quote: &str) -> Result<ExRate, XferError> {
            self.read()
                .rates
                .get(&(base.to_string(), quote.to_string()))
                .copied()
                .ok_or_else(|| XferError::UnknownPair(format!("{base}/{quote}")))
        }
    }

}
