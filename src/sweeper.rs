//! Background cleanup of expired refresh tokens and aged-out ledger rows.
//!
//! The sweeper runs on a fixed interval and deletes in bounded batches so a
//! large backlog never turns into one long-running statement. Revoked but
//! unexpired rows are left alone; they are still load-bearing for replay
//! detection. Ledger rows are kept for the configured retention window after
//! revocation, then aged out.

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::store::{RevocationLedger, TokenStore};

pub struct CleanupSweeper {
    tokens: Arc<dyn TokenStore>,
    ledger: Arc<dyn RevocationLedger>,
    config: AuthConfig,
}

/// Handle to a running sweeper. Dropping it does not stop the task; call
/// [`SweeperHandle::shutdown`] for an orderly stop.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(target: "auth.sweeper", error = %err, "sweeper task panicked");
        }
    }
}

impl CleanupSweeper {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        ledger: Arc<dyn RevocationLedger>,
        config: AuthConfig,
    ) -> Self {
        Self {
            tokens,
            ledger,
            config,
        }
    }

    /// Spawn the periodic sweep loop. The first pass runs one full interval
    /// after startup, not immediately.
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let (stop, mut stopped) = watch::channel(false);
        let period = match std::time::Duration::try_from(self.config.sweep_interval()) {
            Ok(period) => period,
            Err(_) => std::time::Duration::from_secs(24 * 60 * 60),
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Consume the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once(OffsetDateTime::now_utc()).await;
                    }
                    _ = stopped.changed() => {
                        info!(target: "auth.sweeper", "sweeper stopping");
                        return;
                    }
                }
            }
        });
        SweeperHandle { stop, task }
    }

    /// One full pass over both tables. Errors are logged and left for the
    /// next tick; a failed sweep never takes the service down.
    pub async fn sweep_once(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();

        let limit = self.config.sweep_batch_size();
        loop {
            match self.tokens.delete_expired(now, limit).await {
                Ok(deleted) => {
                    report.expired_tokens += deleted;
                    if deleted < limit as u64 {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "auth.sweeper", error = %err, "expired-token sweep failed; will retry next tick");
                    report.failed = true;
                    break;
                }
            }
        }

        let cutoff = now - self.config.ledger_retention();
        loop {
            match self.ledger.delete_older_than(cutoff, limit).await {
                Ok(deleted) => {
                    report.aged_ledger_rows += deleted;
                    if deleted < limit as u64 {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "auth.sweeper", error = %err, "ledger sweep failed; will retry next tick");
                    report.failed = true;
                    break;
                }
            }
        }

        if report.expired_tokens > 0 || report.aged_ledger_rows > 0 {
            info!(
                target: "auth.sweeper",
                expired_tokens = report.expired_tokens,
                aged_ledger_rows = report.aged_ledger_rows,
                "sweep pass complete"
            );
        } else {
            debug!(target: "auth.sweeper", "sweep pass found nothing to delete");
        }
        report
    }
}

/// What a single sweep pass removed.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepReport {
    pub expired_tokens: u64,
    pub aged_ledger_rows: u64,
    /// At least one batch errored; remaining rows wait for the next tick.
    pub failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::{
        RefreshTokenRecord, RevocationReason, RevokedTokenRecord, TokenType,
    };
    use time::Duration;
    use uuid::Uuid;

    fn token_row(expires_at: OffsetDateTime, now: OffsetDateTime) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: Uuid::new_v4().as_bytes().to_vec(),
            family_id: Uuid::new_v4(),
            expires_at,
            created_at: now,
            last_used_at: None,
            ip_address: None,
            user_agent: None,
            is_revoked: false,
            revoked_at: None,
            revoked_by: None,
            reason: None,
        }
    }

    fn ledger_row(revoked_at: OffsetDateTime) -> RevokedTokenRecord {
        RevokedTokenRecord {
            user_id: Uuid::new_v4(),
            token_hash: Uuid::new_v4().as_bytes().to_vec(),
            token_type: TokenType::Refresh,
            expires_at: Some(revoked_at + Duration::days(7)),
            revoked_by: "system".to_string(),
            reason: RevocationReason::Logout,
            ip_address: None,
            user_agent: None,
            revoked_at,
        }
    }

    fn sweeper(store: &Arc<InMemoryStore>, config: AuthConfig) -> CleanupSweeper {
        CleanupSweeper::new(
            Arc::clone(store) as Arc<dyn TokenStore>,
            Arc::clone(store) as Arc<dyn RevocationLedger>,
            config,
        )
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_tokens() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let now = OffsetDateTime::now_utc();

        store.insert(token_row(now - Duration::hours(1), now)).await?;
        store.insert(token_row(now + Duration::days(1), now)).await?;

        // Revoked but unexpired: must survive the sweep.
        let revoked = token_row(now + Duration::days(1), now);
        let revoked_hash = revoked.token_hash.clone();
        store.insert(revoked).await?;
        store
            .revoke_if_active(&revoked_hash, RevocationReason::Logout, "system", now)
            .await?;

        let report = sweeper(&store, AuthConfig::new()).sweep_once(now).await;
        assert_eq!(report.expired_tokens, 1);
        assert!(!report.failed);
        assert_eq!(store.token_rows().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_drains_backlog_in_batches() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let now = OffsetDateTime::now_utc();
        for _ in 0..7 {
            store.insert(token_row(now - Duration::hours(1), now)).await?;
        }

        let config = AuthConfig::new().with_sweep_batch_size(3);
        let report = sweeper(&store, config).sweep_once(now).await;
        assert_eq!(report.expired_tokens, 7);
        assert_eq!(store.token_rows().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn zero_batch_size_still_terminates() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let now = OffsetDateTime::now_utc();
        store.insert(token_row(now - Duration::hours(1), now)).await?;

        let config = AuthConfig::new().with_sweep_batch_size(0);
        let report = sweeper(&store, config).sweep_once(now).await;
        assert_eq!(report.expired_tokens, 1);
        assert_eq!(store.token_rows().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_ages_out_ledger_rows_past_retention() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let now = OffsetDateTime::now_utc();

        store.append(ledger_row(now - Duration::days(31))).await?;
        store.append(ledger_row(now - Duration::days(2))).await?;

        let report = sweeper(&store, AuthConfig::new()).sweep_once(now).await;
        assert_eq!(report.aged_ledger_rows, 1);
        assert_eq!(store.ledger_len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn spawned_sweeper_shuts_down_cleanly() {
        let store = Arc::new(InMemoryStore::new());
        let config = AuthConfig::new().with_sweep_interval(Duration::hours(1));
        let handle = sweeper(&store, config).spawn();
        handle.shutdown().await;
    }
}
