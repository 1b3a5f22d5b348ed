//! PostgreSQL schema for the ledger and the registries it reads

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::limits::LimitDomain;

/// Balances are integer storage units (`value × 10^dec_places`)
pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    uuidb64      CHAR(22) PRIMARY KEY,
    holder       CHAR(22) NOT NULL,
    currency     VARCHAR(16) NOT NULL,
    dec_places   SMALLINT NOT NULL,
    balance      NUMERIC(40, 0) NOT NULL DEFAULT 0,
    reserved     NUMERIC(40, 0) NOT NULL DEFAULT 0,
    overdraft    NUMERIC(40, 0) NOT NULL DEFAULT 0,
    enabled      BOOLEAN NOT NULL DEFAULT TRUE,
    kind         SMALLINT NOT NULL DEFAULT 1,
    ext_acct_id  VARCHAR(128),
    rel_id       CHAR(22)
)
"#;

pub const CREATE_XFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS xfers (
    id              UUID PRIMARY KEY,
    domain          VARCHAR(16) NOT NULL,
    xfer_type       VARCHAR(32) NOT NULL,
    src_account     CHAR(22) NOT NULL,
    src_amount      NUMERIC NOT NULL,
    dst_account     CHAR(22) NOT NULL,
    dst_amount      NUMERIC NOT NULL,
    currency        VARCHAR(16) NOT NULL,
    amount          NUMERIC NOT NULL,
    ext_id          VARCHAR(128) UNIQUE,
    orig_ts         TIMESTAMPTZ NOT NULL,
    status          SMALLINT NOT NULL,
    misc_data       JSONB NOT NULL DEFAULT '{}',
    limits_applied  JSONB NOT NULL DEFAULT '[]',
    fee_xfer        UUID,
    created         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated         TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_XFERS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_xfers_src ON xfers(src_account, created);
CREATE INDEX IF NOT EXISTS idx_xfers_dst ON xfers(dst_account, created)
"#;

pub const CREATE_UUID_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS xfer_uuid_history (
    id UUID PRIMARY KEY
)
"#;

pub const CREATE_REFUND_TOTALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS xfer_refund_totals (
    purchase_id  UUID PRIMARY KEY,
    total        NUMERIC NOT NULL DEFAULT 0
)
"#;

pub const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS xfer_outbox (
    id           BIGSERIAL PRIMARY KEY,
    xfer_id      UUID NOT NULL,
    domain       VARCHAR(16) NOT NULL,
    direction    SMALLINT NOT NULL,
    op           SMALLINT NOT NULL DEFAULT 0,
    rel_account  CHAR(22) NOT NULL,
    payload      JSONB NOT NULL DEFAULT '{}',
    status       SMALLINT NOT NULL DEFAULT 0,
    retry_count  INT NOT NULL DEFAULT 0,
    error        TEXT,
    created      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_xfer_outbox_pending ON xfer_outbox(id) WHERE status = 0
"#;

pub const CREATE_REGISTRY_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS account_holders (
    uuidb64     CHAR(22) PRIMARY KEY,
    ext_id      VARCHAR(128) NOT NULL,
    group_name  VARCHAR(64) NOT NULL,
    enabled     BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS currencies (
    code        VARCHAR(16) PRIMARY KEY,
    dec_places  SMALLINT NOT NULL,
    enabled     BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS exrates (
    base    VARCHAR(16) NOT NULL,
    quote   VARCHAR(16) NOT NULL,
    rate    NUMERIC NOT NULL,
    margin  NUMERIC NOT NULL DEFAULT 0,
    PRIMARY KEY (base, quote)
);
CREATE TABLE IF NOT EXISTS limits (
    group_name  VARCHAR(64) NOT NULL,
    domain      VARCHAR(16) NOT NULL,
    currency    VARCHAR(16) NOT NULL,
    hard        JSONB NOT NULL DEFAULT '{}',
    check_lim   JSONB NOT NULL DEFAULT '{}',
    risk        JSONB NOT NULL DEFAULT '{}',
    PRIMARY KEY (group_name, domain)
)
"#;

/// One row per holder; one `{prefix}_{window}_{amt|cnt}` column per counter
pub fn stats_table_ddl(domain: LimitDomain) -> String {
    let columns: String = domain
        .counter_keys()
        .iter()
        .map(|key| format!(",\n    {key} NUMERIC NOT NULL DEFAULT 0"))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    holder CHAR(22) PRIMARY KEY,\n    currency VARCHAR(16) NOT NULL,\n    stats_date TIMESTAMPTZ NOT NULL{columns}\n)",
        domain.stats_table()
    )
}

/// Create every table the engine touches
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing ledger schema...");

    for (name, ddl) in [
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("xfers", CREATE_XFERS_TABLE),
        ("xfers indexes", CREATE_XFERS_INDEXES),
        ("xfer_uuid_history", CREATE_UUID_HISTORY_TABLE),
        ("xfer_refund_totals", CREATE_REFUND_TOTALS_TABLE),
        ("xfer_outbox", CREATE_OUTBOX_TABLE),
        ("registries", CREATE_REGISTRY_TABLES),
    ] {
        sqlx::raw_sql(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {name}"))?;
    }

    for domain in LimitDomain::ALL {
        sqlx::raw_sql(&stats_table_ddl(domain))
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {}", domain.stats_table()))?;
    }

    tracing::info!("Ledger schema initialized successfully");
    Ok(())
}
