//! Failed-attempt tracking and temporary account lockout.
//!
//! The lock check runs before any password verification so a locked account
//! never costs a KDF pass and the caller sees a uniform "locked" response
//! regardless of whether the password would have matched.

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::warn;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::store::{CredentialStore, SecurityProfile};

pub struct LockoutManager {
    store: Arc<dyn CredentialStore>,
    threshold: i32,
    duration: Duration,
}

impl LockoutManager {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, config: &AuthConfig) -> Self {
        Self {
            store,
            threshold: config.max_failed_logins(),
            duration: config.lockout_duration(),
        }
    }

    /// Fail with `AccountLocked` while an unexpired lock exists.
    pub async fn check(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        let profile = self
            .store
            .load(user_id)
            .await
            .map_err(AuthError::Store)?;
        if let Some(until) = profile.and_then(|p| p.lock_active(now)) {
            return Err(AuthError::AccountLocked { until });
        }
        Ok(())
    }

    /// Count a failure; arms the lock at the threshold. Returns the updated
    /// profile so callers can log the state.
    pub async fn on_failed_login(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<SecurityProfile> {
        let locked_until = now + self.duration;
        let profile = self
            .store
            .record_failure(user_id, self.threshold, locked_until, now)
            .await
            .map_err(AuthError::Store)?;
        if profile.lock_active(now).is_some() {
            warn!(
                target: "auth.lockout",
                %user_id,
                attempts = profile.failed_login_attempts,
                "account locked after repeated login failures"
            );
        }
        Ok(profile)
    }

    /// Clear the counter and lock, stamp `last_login`.
    pub async fn on_successful_login(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        self.store
            .record_success(user_id, now)
            .await
            .map_err(AuthError::Store)
    }
}
