//! PostgreSQL Ledger Store
//!
//! Balances live in integer storage units and are converted at this
//! boundary. Status changes are compare-and-set; balance, counter and refund
//! updates carry their guard in the `WHERE` clause and report success through
//! `rows_affected`.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::error::XferError;
use super::outbox::{Direction, NewOutboxEntry, OutboxEntry, OutboxStatus, PeerOp};
use super::state::XferStatus;
use super::store::{BalanceUpdate, LedgerStore, LedgerTx};
use super::types::{XferId, XferRecord};
use crate::account::{Account, AccountId, AccountKind, HolderId};
use crate::amount::{StatsMap, from_storage, to_storage};
use crate::domain::Domain;
use crate::limits::{AppliedLimit, LimitDomain, LimitStats};

const XFER_COLUMNS: &str = r#"id, domain, xfer_type, src_account, src_amount, dst_account,
    dst_amount, currency, amount, ext_id, orig_ts, status, misc_data, limits_applied,
    fee_xfer, created, updated"#;

const ACCOUNT_COLUMNS: &str = r#"uuidb64, holder, currency, dec_places,
    balance::text AS balance, reserved::text AS reserved, overdraft::text AS overdraft,
    enabled, kind, ext_acct_id, rel_id"#;

const OUTBOX_COLUMNS: &str = r#"id, xfer_id, domain, direction, op, rel_account, payload,
    status, retry_count, error, created, updated"#;

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, XferError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx {
            tx,
            places: HashMap::new(),
        }))
    }

    async fn get_xfer(&self, id: XferId) -> Result<Option<XferRecord>, XferError> {
        let row = sqlx::query(&format!("SELECT {XFER_COLUMNS} FROM xfers WHERE id = $1"))
            .bind(id.inner())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_xfer).transpose()
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, XferError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE uuidb64 = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, XferError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM xfer_outbox WHERE status = $1 ORDER BY id LIMIT $2"
        ))
        .bind(OutboxStatus::Pending.id())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_outbox).collect()
    }

    async fn complete_outbox(&self, id: i64) -> Result<(), XferError> {
        sqlx::query(r#"UPDATE xfer_outbox SET status = $1, updated = NOW() WHERE id = $2"#)
            .bind(OutboxStatus::Done.id())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_outbox(&self, id: i64, error: &str) -> Result<(), XferError> {
        sqlx::query(
            r#"UPDATE xfer_outbox SET status = $1, error = $2, updated = NOW() WHERE id = $3"#,
        )
        .bind(OutboxStatus::Failed.id())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_outbox(&self, id: i64) -> Result<(), XferError> {
        sqlx::query(
            r#"UPDATE xfer_outbox SET retry_count = retry_count + 1, updated = NOW() WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    /// Decimal places of accounts read in this transaction
    places: HashMap<AccountId, u32>,
}

impl PgLedgerTx {
    async fn account_places(&mut self, id: &AccountId) -> Result<Option<u32>, XferError> {
        if let Some(places) = self.places.get(id) {
            return Ok(Some(*places));
        }

        let places = sqlx::query_scalar::<_, i16>("SELECT dec_places FROM accounts WHERE uuidb64 = $1")
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(|p| p as u32);

        if let Some(p) = places {
            self.places.insert(id.clone(), p);
        }
        Ok(places)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn register_xfer_id(&mut self, id: XferId) -> Result<bool, XferError> {
        let result = sqlx::query(
            r#"INSERT INTO xfer_uuid_history (id) VALUES ($1) ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(id.inner())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_xfer_by_ext_id(&mut self, ext_id: &str) -> Result<Option<XferRecord>, XferError> {
        let row = sqlx::query(&format!("SELECT {XFER_COLUMNS} FROM xfers WHERE ext_id = $1"))
            .bind(ext_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(row_to_xfer).transpose()
    }

    async fn lock_xfer(&mut self, id: XferId) -> Result<Option<XferRecord>, XferError> {
        let row = sqlx::query(&format!(
            "SELECT {XFER_COLUMNS} FROM xfers WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.inner())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_xfer).transpose()
    }

    async fn fetch_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, XferError> {
        let keys: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE uuidb64 = ANY($1)"
        ))
        .bind(keys)
        .fetch_all(&mut *self.tx)
        .await?;

        let accounts = rows
            .iter()
            .map(row_to_account)
            .collect::<Result<Vec<_>, _>>()?;
        for acct in &accounts {
            self.places.insert(acct.id.clone(), acct.dec_places);
        }
        Ok(accounts)
    }

    async fn insert_xfer(&mut self, record: &XferRecord) -> Result<bool, XferError> {
        let result = sqlx::query(
            r#"
            INSERT INTO xfers
                (id, domain, xfer_type, src_account, src_amount, dst_account, dst_amount,
                 currency, amount, ext_id, orig_ts, status, misc_data, limits_applied,
                 fee_xfer, created, updated)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.id.inner())
        .bind(record.domain.as_str())
        .bind(&record.xfer_type)
        .bind(record.src_account.as_str())
        .bind(record.src_amount)
        .bind(record.dst_account.as_str())
        .bind(record.dst_amount)
        .bind(&record.currency)
        .bind(record.amount)
        .bind(&record.ext_id)
        .bind(record.orig_ts)
        .bind(record.status.id())
        .bind(Json(&record.misc_data))
        .bind(Json(&record.limits))
        .bind(record.fee_xfer.map(|id| id.inner()))
        .bind(record.created)
        .bind(record.updated)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_xfer_status(
        &mut self,
        id: XferId,
        from: XferStatus,
        to: XferStatus,
        misc: Option<&Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError> {
        let result = sqlx::query(
            r#"
            UPDATE xfers
            SET status = $1, misc_data = COALESCE($2, misc_data), updated = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(to.id())
        .bind(misc.map(Json))
        .bind(now)
        .bind(id.inner())
        .bind(from.id())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn apply_balance(&mut self, update: &BalanceUpdate) -> Result<bool, XferError> {
        let Some(places) = self.account_places(&update.account).await? else {
            return Ok(false);
        };
        let balance = to_storage(&update.balance.to_string(), places)?;
        let reserved = to_storage(&update.reserved.to_string(), places)?;

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $2::numeric, reserved = reserved + $3::numeric
            WHERE uuidb64 = $1
              AND reserved + $3::numeric >= 0
              AND (NOT $4 OR balance + $2::numeric + overdraft - reserved - $3::numeric >= 0)
            "#,
        )
        .bind(update.account.as_str())
        .bind(balance)
        .bind(reserved)
        .bind(update.check_funds)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
    ) -> Result<Option<LimitStats>, XferError> {
        let keys = domain.counter_keys();
        let sql = format!(
            "SELECT currency, stats_date, {} FROM {} WHERE holder = $1",
            keys.join(", "),
            domain.stats_table()
        );
        let Some(row) = sqlx::query(&sql)
            .bind(holder.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
        else {
            return Ok(None);
        };

        let mut stats = StatsMap::new();
        for key in keys {
            let value: Decimal = row.try_get(key.as_str())?;
            stats.insert(key, value);
        }

        Ok(Some(LimitStats {
            currency: row.try_get("currency")?,
            stats_date: row.try_get("stats_date")?,
            stats,
        }))
    }

    async fn insert_limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
        stats: &LimitStats,
    ) -> Result<bool, XferError> {
        check_columns(domain, stats.stats.keys())?;

        let columns: Vec<&str> = stats.stats.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (0..columns.len()).map(|i| format!("${}", i + 4)).collect();
        let (extra_cols, extra_vals) = if columns.is_empty() {
            (String::new(), String::new())
        } else {
            (
                format!(", {}", columns.join(", ")),
                format!(", {}", placeholders.join(", ")),
            )
        };
        let sql = format!(
            "INSERT INTO {} (holder, currency, stats_date{extra_cols}) VALUES ($1, $2, $3{extra_vals}) \
             ON CONFLICT (holder) DO NOTHING",
            domain.stats_table()
        );

        let mut query = sqlx::query(&sql)
            .bind(holder.as_str())
            .bind(&stats.currency)
            .bind(stats.stats_date);
        for value in stats.stats.values() {
            query = query.bind(*value);
        }
        let result = query.execute(&mut *self.tx).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_limit_stats(
        &mut self,
        holder: &HolderId,
        domain: LimitDomain,
        deltas: &StatsMap,
        hard: &StatsMap,
        now: DateTime<Utc>,
    ) -> Result<bool, XferError> {
        check_columns(domain, deltas.keys())?;

        let (sql, binds) = stats_update_sql(domain, deltas, hard);
        let mut query = sqlx::query(&sql).bind(holder.as_str()).bind(now);
        for value in binds {
            query = query.bind(value);
        }
        let result = query.execute(&mut *self.tx).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn refunded_total(&mut self, purchase: XferId) -> Result<Decimal, XferError> {
        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT total FROM xfer_refund_totals WHERE purchase_id = $1",
        )
        .bind(purchase.inner())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(total.unwrap_or(Decimal::ZERO))
    }

    async fn add_refund(
        &mut self,
        purchase: XferId,
        amount: Decimal,
        ceiling: Decimal,
    ) -> Result<bool, XferError> {
        sqlx::query(
            r#"INSERT INTO xfer_refund_totals (purchase_id, total) VALUES ($1, 0)
               ON CONFLICT (purchase_id) DO NOTHING"#,
        )
        .bind(purchase.inner())
        .execute(&mut *self.tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE xfer_refund_totals SET total = total + $2
            WHERE purchase_id = $1 AND total + $2 <= $3
            "#,
        )
        .bind(purchase.inner())
        .bind(amount)
        .bind(ceiling)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_outbox(&mut self, entry: &NewOutboxEntry) -> Result<(), XferError> {
        sqlx::query(
            r#"
            INSERT INTO xfer_outbox (xfer_id, domain, direction, op, rel_account, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.xfer_id.inner())
        .bind(entry.domain.as_str())
        .bind(entry.direction.id())
        .bind(entry.op.id())
        .bind(entry.rel_account.as_str())
        .bind(Json(&entry.payload))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), XferError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), XferError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Stats SQL
// ============================================================================

/// Column names are interpolated into SQL; only the domain's own counters
/// are allowed.
fn check_columns<'a>(
    domain: LimitDomain,
    keys: impl IntoIterator<Item = &'a String>,
) -> Result<(), XferError> {
    let known = domain.counter_keys();
    for key in keys {
        if !known.contains(key) {
            return Err(XferError::InternalError(format!(
                "unknown {domain} counter: {key}"
            )));
        }
    }
    Ok(())
}

/// Build the guarded relative update of a stats row.
///
/// Every counter is reset to zero when its window no longer covers `now`
/// (bound as `$2`), then deltas are added. Each hard ceiling on an updated
/// counter becomes a `WHERE` guard. Returns the SQL and the values to bind
/// after `$1` (holder) and `$2` (now).
fn stats_update_sql(domain: LimitDomain, deltas: &StatsMap, hard: &StatsMap) -> (String, Vec<Decimal>) {
    let live = |column: &str| {
        let field = crate::limits::Window::of_key(column)
            .map(|w| w.trunc_field())
            .unwrap_or("day");
        format!(
            "(CASE WHEN date_trunc('{field}', stats_date AT TIME ZONE 'UTC') \
             = date_trunc('{field}', $2 AT TIME ZONE 'UTC') THEN {column} ELSE 0 END)"
        )
    };

    let mut binds = Vec::new();
    let mut sets = Vec::new();
    let mut guards = Vec::new();

    for column in domain.counter_keys() {
        match deltas.get(&column) {
            Some(delta) => {
                binds.push(*delta);
                let delta_pos = binds.len() + 2;
                sets.push(format!("{column} = {} + ${delta_pos}", live(&column)));

                if let Some(limit) = hard.get(&column) {
                    binds.push(*limit);
                    let limit_pos = binds.len() + 2;
                    guards.push(format!("{} + ${delta_pos} <= ${limit_pos}", live(&column)));
                }
            }
            None => sets.push(format!("{column} = {}", live(&column))),
        }
    }
    sets.push("stats_date = $2".to_string());

    let mut sql = format!(
        "UPDATE {} SET {} WHERE holder = $1",
        domain.stats_table(),
        sets.join(", ")
    );
    for guard in guards {
        sql.push_str(" AND ");
        sql.push_str(&guard);
    }

    (sql, binds)
}

// ============================================================================
// Row Mapping
// ============================================================================

fn row_to_xfer(row: &PgRow) -> Result<XferRecord, XferError> {
    let domain_name: String = row.try_get("domain")?;
    let domain = Domain::from_name(&domain_name)
        .ok_or_else(|| XferError::InternalError(format!("unknown domain {domain_name}")))?;
    let status_id: i16 = row.try_get("status")?;
    let status = XferStatus::from_id(status_id)
        .ok_or_else(|| XferError::InternalError(format!("invalid status {status_id}")))?;

    Ok(XferRecord {
        id: XferId::from_uuid(row.try_get("id")?),
        domain,
        xfer_type: row.try_get("xfer_type")?,
        src_account: AccountId::new(row.try_get::<String, _>("src_account")?),
        src_amount: row.try_get("src_amount")?,
        dst_account: AccountId::new(row.try_get::<String, _>("dst_account")?),
        dst_amount: row.try_get("dst_amount")?,
        currency: row.try_get("currency")?,
        amount: row.try_get("amount")?,
        ext_id: row.try_get("ext_id")?,
        orig_ts: row.try_get("orig_ts")?,
        status,
        misc_data: row.try_get::<Json<Map<String, Value>>, _>("misc_data")?.0,
        limits: row.try_get::<Json<Vec<AppliedLimit>>, _>("limits_applied")?.0,
        fee_xfer: row
            .try_get::<Option<uuid::Uuid>, _>("fee_xfer")?
            .map(XferId::from_uuid),
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
    })
}

fn units(row: &PgRow, column: &str, places: u32) -> Result<Decimal, XferError> {
    let text: String = row.try_get(column)?;
    let display = from_storage(&text, places)?;
    Decimal::from_str(&display).map_err(|e| XferError::InternalError(e.to_string()))
}

fn row_to_account(row: &PgRow) -> Result<Account, XferError> {
    let places = row.try_get::<i16, _>("dec_places")? as u32;
    let kind_id: i16 = row.try_get("kind")?;

    Ok(Account {
        id: AccountId::new(row.try_get::<String, _>("uuidb64")?),
        holder: HolderId::new(row.try_get::<String, _>("holder")?),
        currency: row.try_get("currency")?,
        dec_places: places,
        balance: units(row, "balance", places)?,
        reserved: units(row, "reserved", places)?,
        overdraft: units(row, "overdraft", places)?,
        enabled: row.try_get("enabled")?,
        kind: AccountKind::from_id(kind_id)
            .ok_or_else(|| XferError::InternalError(format!("invalid account kind {kind_id}")))?,
        ext_acct_id: row.try_get("ext_acct_id")?,
        rel_id: row
            .try_get::<Option<String>, _>("rel_id")?
            .map(AccountId::new),
    })
}

fn row_to_outbox(row: &PgRow) -> Result<OutboxEntry, XferError> {
    let domain_name: String = row.try_get("domain")?;
    let direction_id: i16 = row.try_get("direction")?;
    let op_id: i16 = row.try_get("op")?;
    let status_id: i16 = row.try_get("status")?;

    Ok(OutboxEntry {
        id: row.try_get("id")?,
        xfer_id: XferId::from_uuid(row.try_get("xfer_id")?),
        domain: Domain::from_name(&domain_name)
            .ok_or_else(|| XferError::InternalError(format!("unknown domain {domain_name}")))?,
        direction: Direction::from_id(direction_id)
            .ok_or_else(|| XferError::InternalError(format!("invalid direction {direction_id}")))?,
        op: PeerOp::from_id(op_id)
            .ok_or_else(|| XferError::InternalError(format!("invalid peer op {op_id}")))?,
        rel_account: AccountId::new(row.try_get::<String, _>("rel_account")?),
        payload: row.try_get::<Json<Value>, _>("payload")?.0,
        status: OutboxStatus::from_id(status_id)
            .ok_or_else(|| XferError::InternalError(format!("invalid outbox status {status_id}")))?,
        retry_count: row.try_get("retry_count")?,
        error: row.try_get("error")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
    })
}
