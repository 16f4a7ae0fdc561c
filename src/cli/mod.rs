//! Command-line entry for the cleanup daemon.

pub mod commands;
pub mod telemetry;

use anyhow::{Context, Result};
use time::Duration;

/// Map verbosity count to tracing level
const fn get_verbosity_level(verbosity: u8) -> Option<tracing::Level> {
    match verbosity {
        0 => None,
        1 => Some(tracing::Level::WARN),
        2 => Some(tracing::Level::INFO),
        3 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Runtime settings for the sweeper daemon.
#[derive(Clone, Debug)]
pub struct Settings {
    pub dsn: String,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    pub ledger_retention: Duration,
}

/// Parse arguments, initialize telemetry, and return the daemon settings.
///
/// # Errors
///
/// Returns an error if telemetry initialization fails or arguments are
/// inconsistent.
pub fn start() -> Result<Settings> {
    let matches = commands::new().get_matches();

    let verbosity_level = get_verbosity_level(
        matches
            .get_one::<u8>(commands::ARG_VERBOSITY)
            .copied()
            .unwrap_or(0),
    );
    telemetry::init(verbosity_level)?;

    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing database connection string")?;
    let sweep_interval_hours = matches
        .get_one::<i64>(commands::ARG_SWEEP_INTERVAL_HOURS)
        .copied()
        .context("missing sweep interval")?;
    let sweep_batch_size = matches
        .get_one::<i64>(commands::ARG_SWEEP_BATCH_SIZE)
        .copied()
        .context("missing sweep batch size")?;
    let retention_days = matches
        .get_one::<i64>(commands::ARG_LEDGER_RETENTION_DAYS)
        .copied()
        .context("missing ledger retention")?;

    Ok(Settings {
        dsn,
        sweep_interval: Duration::hours(sweep_interval_hours),
        sweep_batch_size,
        ledger_retention: Duration::days(retention_days),
    })
}
