//! In-memory store for tests and single-process embedding.
//!
//! One mutex guards all tables, so every operation is trivially atomic and
//! the conditional-update contract of `revoke_if_active` holds by
//! construction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CredentialStore, RefreshTokenRecord, RevocationLedger, RevocationReason, RevokedTokenRecord,
    SecurityProfile, TokenStore,
};

#[derive(Default)]
struct Inner {
    tokens: HashMap<Vec<u8>, RefreshTokenRecord>,
    ledger: Vec<RevokedTokenRecord>,
    profiles: HashMap<Uuid, SecurityProfile>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    // Test hook: fail the next revocation write to exercise the
    // partial-failure path of rotation.
    fail_next_revoke: AtomicBool,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_revoke(&self) {
        self.fail_next_revoke.store(true, Ordering::SeqCst);
    }

    fn take_revoke_failure(&self) -> bool {
        self.fail_next_revoke.swap(false, Ordering::SeqCst)
    }

    /// Number of ledger rows, revoked or not. Test visibility only.
    pub async fn ledger_len(&self) -> usize {
        self.inner.lock().await.ledger.len()
    }

    /// Total refresh rows including dead ones. Test visibility only.
    pub async fn token_rows(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }
}

fn revoke_record(
    record: &mut RefreshTokenRecord,
    reason: RevocationReason,
    revoked_by: &str,
    now: OffsetDateTime,
) {
    record.is_revoked = true;
    record.revoked_at = Some(now);
    record.revoked_by = Some(revoked_by.to_string());
    record.reason = Some(reason);
}

#[async_trait]
impl TokenStore for InMemoryStore {
    async fn insert(&self, record: RefreshTokenRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tokens.contains_key(&record.token_hash) {
            return Err(anyhow!("duplicate token hash"));
        }
        inner.tokens.insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<RefreshTokenRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.tokens.get(token_hash).cloned())
    }

    async fn revoke_if_active(
        &self,
        token_hash: &[u8],
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Option<RefreshTokenRecord>> {
        if self.take_revoke_failure() {
            return Err(anyhow!("injected revoke failure"));
        }
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.tokens.get_mut(token_hash) else {
            return Ok(None);
        };
        if record.is_revoked {
            return Ok(None);
        }
        revoke_record(record, reason, revoked_by, now);
        Ok(Some(record.clone()))
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let mut inner = self.inner.lock().await;
        let mut revoked = Vec::new();
        for record in inner.tokens.values_mut() {
            if record.family_id == family_id && !record.is_revoked {
                revoke_record(record, reason, revoked_by, now);
                revoked.push(record.clone());
            }
        }
        Ok(revoked)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let mut inner = self.inner.lock().await;
        let mut revoked = Vec::new();
        for record in inner.tokens.values_mut() {
            if record.user_id == user_id && !record.is_revoked {
                revoke_record(record, reason, revoked_by, now);
                revoked.push(record.clone());
            }
        }
        Ok(revoked)
    }

    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let inner = self.inner.lock().await;
        let mut active: Vec<RefreshTokenRecord> = inner
            .tokens
            .values()
            .filter(|record| record.user_id == user_id && record.is_active(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn delete_expired(&self, now: OffsetDateTime, limit: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<Vec<u8>> = inner
            .tokens
            .values()
            .filter(|record| record.is_expired(now))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|record| record.token_hash.clone())
            .collect();
        for hash in &doomed {
            inner.tokens.remove(hash);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl RevocationLedger for InMemoryStore {
    async fn append(&self, record: RevokedTokenRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ledger.push(record);
        Ok(())
    }

    async fn contains(&self, token_hash: &[u8]) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .any(|record| record.token_hash == token_hash))
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime, limit: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut deleted = 0u64;
        let limit = u64::try_from(limit).unwrap_or(u64::MAX);
        inner.ledger.retain(|record| {
            if deleted < limit && record.revoked_at < cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn load(&self, user_id: Uuid) -> Result<Option<SecurityProfile>> {
        let inner = self.inner.lock().await;
        Ok(inner.profiles.get(&user_id).cloned())
    }

    async fn record_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        locked_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<SecurityProfile> {
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .entry(user_id)
            .or_insert_with(|| SecurityProfile::new(user_id));
        profile.failed_login_attempts += 1;
        // An active lock is never extended by further failures.
        if profile.failed_login_attempts >= threshold && profile.lock_active(now).is_none() {
            profile.locked_until = Some(locked_until);
        }
        Ok(profile.clone())
    }

    async fn record_success(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .entry(user_id)
            .or_insert_with(|| SecurityProfile::new(user_id));
        profile.failed_login_attempts = 0;
        profile.locked_until = None;
        profile.last_login = Some(now);
        Ok(())
    }

    async fn mark_password_changed(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .entry(user_id)
            .or_insert_with(|| SecurityProfile::new(user_id));
        profile.password_changed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(user_id: Uuid, family_id: Uuid, hash: u8, now: OffsetDateTime) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id,
            token_hash: vec![hash; 32],
            family_id,
            expires_at: now + Duration::days(7),
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

    #[tokio::test]
    async fn revoke_if_active_flips_exactly_once() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let family = Uuid::new_v4();
        store.insert(record(user, family, 1, now)).await?;

        let first = store
            .revoke_if_active(&[1; 32], RevocationReason::Rotation, "test", now)
            .await?;
        assert!(first.is_some());

        let second = store
            .revoke_if_active(&[1; 32], RevocationReason::Rotation, "test", now)
            .await?;
        assert!(second.is_none());

        let missing = store
            .revoke_if_active(&[9; 32], RevocationReason::Rotation, "test", now)
            .await?;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_hash_insert_fails() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let family = Uuid::new_v4();
        store.insert(record(user, family, 1, now)).await?;
        assert!(store.insert(record(user, family, 1, now)).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn family_revocation_skips_already_dead_rows() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let family = Uuid::new_v4();
        store.insert(record(user, family, 1, now)).await?;
        store.insert(record(user, family, 2, now)).await?;
        store.insert(record(user, Uuid::new_v4(), 3, now)).await?;

        store
            .revoke_if_active(&[1; 32], RevocationReason::Rotation, "test", now)
            .await?;
        let revoked = store
            .revoke_family(family, RevocationReason::Security, "system", now)
            .await?;
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].token_hash, vec![2; 32]);

        // The other family is untouched.
        let other = store.find_by_hash(&[3; 32]).await?;
        assert!(other.is_some_and(|r| !r.is_revoked));
        Ok(())
    }

    #[tokio::test]
    async fn active_for_user_is_oldest_first_and_excludes_dead() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let family = Uuid::new_v4();

        let mut oldest = record(user, family, 1, now - Duration::hours(2));
        oldest.expires_at = now + Duration::days(7);
        store.insert(oldest).await?;
        store
            .insert(record(user, family, 2, now - Duration::hours(1)))
            .await?;
        let mut expired = record(user, family, 3, now - Duration::days(8));
        expired.expires_at = now - Duration::days(1);
        store.insert(expired).await?;

        let active = store.active_for_user(user, now).await?;
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].token_hash, vec![1; 32]);
        assert_eq!(active[1].token_hash, vec![2; 32]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_expired_respects_batch_limit() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        for i in 0..3u8 {
            let mut dead = record(user, Uuid::new_v4(), i, now - Duration::days(8));
            dead.expires_at = now - Duration::days(1);
            store.insert(dead).await?;
        }
        store.insert(record(user, Uuid::new_v4(), 9, now)).await?;

        assert_eq!(store.delete_expired(now, 2).await?, 2);
        assert_eq!(store.delete_expired(now, 2).await?, 1);
        assert_eq!(store.delete_expired(now, 2).await?, 0);
        // The live row survives every sweep.
        assert!(store.find_by_hash(&[9; 32]).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn ledger_retention_keeps_recent_rows() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        for (hash, age_days) in [(1u8, 40i64), (2, 10)] {
            store
                .append(RevokedTokenRecord {
                    user_id: user,
                    token_hash: vec![hash; 32],
                    token_type: super::super::TokenType::Refresh,
                    expires_at: None,
                    revoked_by: "test".to_string(),
                    reason: RevocationReason::Logout,
                    ip_address: None,
                    user_agent: None,
                    revoked_at: now - Duration::days(age_days),
                })
                .await?;
        }

        let cutoff = now - Duration::days(30);
        assert_eq!(store.delete_older_than(cutoff, 100).await?, 1);
        assert!(!store.contains(&[1; 32]).await?);
        assert!(store.contains(&[2; 32]).await?);
        Ok(())
    }

    #[tokio::test]
    async fn failure_counter_locks_at_threshold_without_extending() -> Result<()> {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let until = now + Duration::minutes(30);

        for _ in 0..4 {
            let profile = store.record_failure(user, 5, until, now).await?;
            assert_eq!(profile.lock_active(now), None);
        }
        let profile = store.record_failure(user, 5, until, now).await?;
        assert_eq!(profile.lock_active(now), Some(until));

        // A sixth failure must not move the lock.
        let later = now + Duration::minutes(5);
        let pushed = later + Duration::minutes(30);
        let profile = store.record_failure(user, 5, pushed, later).await?;
        assert_eq!(profile.lock_active(later), Some(until));

        store.record_success(user, later).await?;
        let profile = store.load(user).await?.map(|p| p.failed_login_attempts);
        assert_eq!(profile, Some(0));
        Ok(())
    }
}
