use anyhow::{Context, Result};
use fincred::cli;
use fincred::config::AuthConfig;
use fincred::store::postgres::PostgresStore;
use fincred::store::{RevocationLedger, TokenStore};
use fincred::sweeper::CleanupSweeper;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = cli::start()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.dsn)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(PostgresStore::new(pool));

    let config = AuthConfig::new()
        .with_sweep_interval(settings.sweep_interval)
        .with_sweep_batch_size(settings.sweep_batch_size)
        .with_ledger_retention(settings.ledger_retention);

    let sweeper = CleanupSweeper::new(
        Arc::clone(&store) as Arc<dyn TokenStore>,
        Arc::clone(&store) as Arc<dyn RevocationLedger>,
        config,
    );
    let handle = sweeper.spawn();
    info!("cleanup sweeper running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    handle.shutdown().await;
    store.close().await;

    Ok(())
}
