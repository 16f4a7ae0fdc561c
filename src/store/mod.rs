//! Persistence seams for refresh tokens, the revocation ledger, and
//! per-user security profiles.
//!
//! Every mutation the rotation protocol depends on is expressed as a
//! single-row conditional update (`revoke_if_active`) or a single statement,
//! so the invariants hold even when the backing store offers no multi-row
//! transactions. Implementations must make `revoke_if_active` atomic: of two
//! racing calls on the same hash, exactly one observes the flip.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Why a token was revoked. Closed set with stable text forms for storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationReason {
    /// Consumed by a successful rotation.
    Rotation,
    Logout,
    LogoutAll,
    /// Oldest session revoked to enforce the per-user cap.
    LimitExceeded,
    /// Theft detected; the whole family was put down.
    Security,
    PasswordChange,
}

impl RevocationReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rotation => "rotation",
            Self::Logout => "logout",
            Self::LogoutAll => "logout_all",
            Self::LimitExceeded => "limit_exceeded",
            Self::Security => "security",
            Self::PasswordChange => "password_change",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rotation" => Some(Self::Rotation),
            "logout" => Some(Self::Logout),
            "logout_all" => Some(Self::LogoutAll),
            "limit_exceeded" => Some(Self::LimitExceeded),
            "security" => Some(Self::Security),
            "password_change" => Some(Self::PasswordChange),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

/// Client metadata captured at issuance for the forensic trail.
#[derive(Clone, Debug, Default)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One outstanding (or dead) refresh token row.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the opaque token value; the raw value is never stored.
    pub token_hash: Vec<u8>,
    pub family_id: Uuid,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_revoked: bool,
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_by: Option<String>,
    pub reason: Option<RevocationReason>,
}

impl RefreshTokenRecord {
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Logically alive: not revoked and not past expiry.
    #[must_use]
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        !self.is_revoked && !self.is_expired(now)
    }
}

/// Append-only audit row in the revocation ledger.
#[derive(Clone, Debug)]
pub struct RevokedTokenRecord {
    pub user_id: Uuid,
    /// SHA-256 of the refresh-token value, or of the access token's `jti`.
    pub token_hash: Vec<u8>,
    pub token_type: TokenType,
    /// Original expiry when known; `None` when the source row was already
    /// swept before the revocation was recorded.
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_by: String,
    pub reason: RevocationReason,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub revoked_at: OffsetDateTime,
}

/// Per-user security state, keyed 1:1 by user id.
#[derive(Clone, Debug)]
pub struct SecurityProfile {
    pub user_id: Uuid,
    pub failed_login_attempts: i32,
    pub locked_until: Option<OffsetDateTime>,
    pub password_changed_at: Option<OffsetDateTime>,
    pub two_factor_enabled: bool,
    pub last_login: Option<OffsetDateTime>,
}

impl SecurityProfile {
    #[must_use]
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            failed_login_attempts: 0,
            locked_until: None,
            password_changed_at: None,
            two_factor_enabled: false,
            last_login: None,
        }
    }

    #[must_use]
    pub fn lock_active(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.locked_until.filter(|&until| until > now)
    }
}

/// Aggregate view of a user's live sessions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active_count: usize,
    pub last_used_at: Option<OffsetDateTime>,
    pub oldest_created_at: Option<OffsetDateTime>,
}

/// Durable table of outstanding refresh tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert a freshly minted row. Must fail on a duplicate `token_hash`.
    async fn insert(&self, record: RefreshTokenRecord) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<RefreshTokenRecord>>;

    /// Atomically revoke the row iff it is not yet revoked. Returns the row
    /// this call revoked, or `None` when it was missing or already revoked.
    /// Of two concurrent calls on the same hash, exactly one gets `Some`.
    async fn revoke_if_active(
        &self,
        token_hash: &[u8],
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Option<RefreshTokenRecord>>;

    /// Revoke every non-revoked row in the family; returns the rows revoked
    /// by this call.
    async fn revoke_family(
        &self,
        family_id: Uuid,
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>>;

    /// Revoke every non-revoked row for the user; returns the rows revoked
    /// by this call.
    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>>;

    /// Non-revoked, non-expired rows for the user, oldest `created_at` first.
    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>>;

    /// Hard-delete rows past expiry, at most `limit` per call. Requires no
    /// prior read and is safe to run concurrently with itself.
    async fn delete_expired(&self, now: OffsetDateTime, limit: i64) -> Result<u64>;
}

/// Append-only revocation audit log, the source of truth for rejecting
/// still-valid access tokens.
#[async_trait]
pub trait RevocationLedger: Send + Sync {
    async fn append(&self, record: RevokedTokenRecord) -> Result<()>;

    async fn contains(&self, token_hash: &[u8]) -> Result<bool>;

    /// Age out rows revoked before `cutoff`, at most `limit` per call.
    async fn delete_older_than(&self, cutoff: OffsetDateTime, limit: i64) -> Result<u64>;
}

/// Per-user security-profile state backing the lockout manager.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, user_id: Uuid) -> Result<Option<SecurityProfile>>;

    /// Count one failed attempt, creating the profile if needed. Arms the
    /// lock at `locked_until` when the counter reaches `threshold` and no
    /// unexpired lock exists; an active lock is never pushed further out.
    async fn record_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        locked_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<SecurityProfile>;

    /// Reset the counter, clear the lock, and stamp `last_login`.
    async fn record_success(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()>;

    async fn mark_password_changed(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn reason_text_forms_round_trip() {
        for reason in [
            RevocationReason::Rotation,
            RevocationReason::Logout,
            RevocationReason::LogoutAll,
            RevocationReason::LimitExceeded,
            RevocationReason::Security,
            RevocationReason::PasswordChange,
        ] {
            assert_eq!(RevocationReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(RevocationReason::parse("garbage"), None);
    }

    #[test]
    fn record_liveness_follows_flags_and_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: vec![1; 32],
            family_id: Uuid::new_v4(),
            expires_at: now + Duration::days(7),
            created_at: now,
            last_used_at: None,
            ip_address: None,
            user_agent: None,
            is_revoked: false,
            revoked_at: None,
            revoked_by: None,
            reason: None,
        };
        assert!(record.is_active(now));

        record.is_revoked = true;
        assert!(!record.is_active(now));

        record.is_revoked = false;
        record.expires_at = now - Duration::seconds(1);
        assert!(record.is_expired(now));
        assert!(!record.is_active(now));
    }

    #[test]
    fn lock_active_ignores_expired_locks() {
        let now = OffsetDateTime::now_utc();
        let mut profile = SecurityProfile::new(Uuid::new_v4());
        assert_eq!(profile.lock_active(now), None);

        profile.locked_until = Some(now - Duration::minutes(1));
        assert_eq!(profile.lock_active(now), None);

        let until = now + Duration::minutes(30);
        profile.locked_until = Some(until);
        assert_eq!(profile.lock_active(now), Some(until));
    }
}
