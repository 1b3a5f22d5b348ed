//! xfer_engine - ledger service
//!
//! Prepares the ledger schema and runs the outbox worker that mirrors
//! transit-account transfers to peer ledgers.
//!
//! ```text
//! xfer_engine [--env dev]
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};

use xfer_engine::config::AppConfig;
use xfer_engine::db::Database;
use xfer_engine::logging::init_logging;
use xfer_engine::xfer::schema::init_schema;
use xfer_engine::xfer::{LoggingGateway, OutboxConfig, OutboxWorker, PgLedgerStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&app_config);

    tracing::info!(
        env = %env,
        build_rev = env!("BUILD_REV"),
        "Starting xfer_engine"
    );

    let url = app_config
        .postgres_url
        .as_deref()
        .context("postgres_url is not configured")?;
    let db = Database::connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await.context("PostgreSQL health check failed")?;
    init_schema(db.pool()).await?;

    if !app_config.outbox.enabled {
        tracing::info!("Outbox worker disabled, exiting");
        return Ok(());
    }

    let store = Arc::new(PgLedgerStore::new(db.pool().clone()));
    let worker = OutboxWorker::new(
        store,
        Arc::new(LoggingGateway),
        OutboxConfig::from(&app_config.outbox),
    );
    worker.run().await
}
