//! The credential and token lifecycle service.
//!
//! `AuthService` owns the whole protocol: login gating (policy, lockout,
//! peppered verification), token-pair issuance, refresh-token rotation with
//! reuse detection, revocation, the per-user session cap, and stateless
//! access-token verification against the revocation ledger.
//!
//! Security-relevant events are emitted under targeted tracing names:
//! - `auth.login` - successful login
//! - `auth.token.refresh` - successful rotation
//! - `auth.token.reuse_detected` - replay of a rotated token (critical)
//! - `auth.token.revoke_all` - family/user-wide revocation
//! - `auth.session_cap` - oldest session evicted by the cap
//! - `auth.lockout` - account locked after repeated failures

use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::directory::{normalize_email, require_active_user, DirectoryUser, UserDirectory};
use crate::error::{AuthError, Result};
use crate::lockout::LockoutManager;
use crate::password::CredentialHasher;
use crate::store::{
    ClientMeta, CredentialStore, RefreshTokenRecord, RevocationLedger, RevocationReason,
    RevokedTokenRecord, SessionStats, TokenStore, TokenType,
};
use crate::token::{generate_refresh_token, hash_token_value, AccessClaims, TokenSigner};

/// Actor recorded on revocations the service performs on its own authority.
const SYSTEM_ACTOR: &str = "system";

/// A freshly minted access/refresh pair.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: i64,
    pub family_id: Uuid,
}

pub struct AuthService {
    directory: Arc<dyn UserDirectory>,
    tokens: Arc<dyn TokenStore>,
    ledger: Arc<dyn RevocationLedger>,
    credentials: Arc<dyn CredentialStore>,
    lockout: LockoutManager,
    hasher: CredentialHasher,
    signer: TokenSigner,
    config: AuthConfig,
}

impl AuthService {
    #[must_use]
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        tokens: Arc<dyn TokenStore>,
        ledger: Arc<dyn RevocationLedger>,
        credentials: Arc<dyn CredentialStore>,
        hasher: CredentialHasher,
        signer: TokenSigner,
        config: AuthConfig,
    ) -> Self {
        let lockout = LockoutManager::new(Arc::clone(&credentials), &config);
        Self {
            directory,
            tokens,
            ledger,
            credentials,
            lockout,
            hasher,
            signer,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Authenticate by email and password and mint the first token pair of a
    /// new family.
    ///
    /// Unknown user, inactive user, and wrong password all return the same
    /// `AuthenticationFailed`, and the unknown-user path burns an equivalent
    /// KDF verification so the caller cannot tell them apart by timing.
    pub async fn login(&self, email: &str, password: &str, meta: ClientMeta) -> Result<TokenPair> {
        let now = OffsetDateTime::now_utc();
        let email = normalize_email(email);

        let Some(user) = self.directory.get_user_by_email(&email).await? else {
            self.hasher.verify_dummy(password);
            return Err(AuthError::AuthenticationFailed);
        };
        if !user.is_active {
            self.hasher.verify_dummy(password);
            return Err(AuthError::AuthenticationFailed);
        }

        // Locked accounts are rejected before any hashing work.
        self.lockout.check(user.id, now).await?;

        let verified = self
            .hasher
            .verify(password, &user.password_hash)
            .map_err(AuthError::Crypto)?;
        if !verified {
            self.lockout.on_failed_login(user.id, now).await?;
            return Err(AuthError::AuthenticationFailed);
        }

        self.lockout.on_successful_login(user.id, now).await?;

        let pair = self.mint_pair(&user, Uuid::new_v4(), &meta, None, now).await?;
        self.enforce_session_cap(user.id, now).await?;
        info!(target: "auth.login", user_id = %user.id, family = %pair.family_id, "login succeeded");
        Ok(pair)
    }

    /// Exchange a refresh token for a new pair in the same family.
    ///
    /// A replayed (already-rotated) token is treated as theft: the entire
    /// family is revoked and the caller gets the same generic failure as for
    /// any dead token.
    pub async fn refresh(&self, refresh_token: &str, meta: ClientMeta) -> Result<TokenPair> {
        let now = OffsetDateTime::now_utc();
        let old_hash = hash_token_value(refresh_token);

        let Some(record) = self
            .tokens
            .find_by_hash(&old_hash)
            .await
            .map_err(AuthError::Store)?
        else {
            return Err(AuthError::InvalidRefreshToken);
        };

        if record.is_revoked {
            if record.reason == Some(RevocationReason::Rotation) {
                return Err(self.reuse_detected(&record, now).await?);
            }
            return Err(AuthError::InvalidRefreshToken);
        }
        if record.is_expired(now) {
            return Err(AuthError::InvalidRefreshToken);
        }

        let user = match require_active_user(self.directory.as_ref(), record.user_id).await {
            Ok(user) => user,
            Err(AuthError::AuthenticationFailed) => return Err(AuthError::InvalidRefreshToken),
            Err(err) => return Err(err),
        };

        // Insert the replacement row before consuming the old one: if the
        // final mark fails we are left with an extra valid session, never a
        // stranded user. The replacement carries the rotation time as the
        // session's last use.
        let pair = self
            .mint_pair(&user, record.family_id, &meta, Some(now), now)
            .await?;

        match self
            .tokens
            .revoke_if_active(&old_hash, RevocationReason::Rotation, SYSTEM_ACTOR, now)
            .await
        {
            Ok(Some(consumed)) => {
                self.append_ledger_rows(&[consumed]).await?;
            }
            Ok(None) => {
                // A concurrent rotation consumed the token first; same
                // response as a replay.
                return Err(self.reuse_detected(&record, now).await?);
            }
            Err(err) => {
                warn!(
                    target: "auth.token.refresh",
                    user_id = %user.id,
                    family = %record.family_id,
                    error = %err,
                    "failed to mark rotated token; leaving extra active session"
                );
            }
        }

        self.enforce_session_cap(user.id, now).await?;
        info!(target: "auth.token.refresh", user_id = %user.id, family = %record.family_id, "token rotated");
        Ok(pair)
    }

    /// Revoke one refresh token. Idempotent: revoking an already-dead or
    /// unknown token still appends an audit row and succeeds.
    pub async fn logout(&self, refresh_token: &str, user_id: Uuid) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let hash = hash_token_value(refresh_token);
        let actor = user_id.to_string();

        let revoked = self
            .tokens
            .revoke_if_active(&hash, RevocationReason::Logout, &actor, now)
            .await
            .map_err(AuthError::Store)?;

        // The audit row is written even when the refresh row was already
        // revoked or swept; the original expiry is then unknowable.
        let expires_at = match &revoked {
            Some(record) => Some(record.expires_at),
            None => self
                .tokens
                .find_by_hash(&hash)
                .await
                .map_err(AuthError::Store)?
                .map(|record| record.expires_at),
        };
        self.ledger
            .append(RevokedTokenRecord {
                user_id,
                token_hash: hash,
                token_type: TokenType::Refresh,
                expires_at,
                revoked_by: actor,
                reason: RevocationReason::Logout,
                ip_address: None,
                user_agent: None,
                revoked_at: now,
            })
            .await
            .map_err(AuthError::Store)?;
        Ok(())
    }

    /// Revoke every active refresh token of the user ("log out everywhere").
    /// Returns how many sessions this call ended.
    pub async fn logout_all(&self, user_id: Uuid, reason: RevocationReason) -> Result<u64> {
        let now = OffsetDateTime::now_utc();
        let revoked = self
            .tokens
            .revoke_all_for_user(user_id, reason, SYSTEM_ACTOR, now)
            .await
            .map_err(AuthError::Store)?;
        self.append_ledger_rows(&revoked).await?;
        warn!(
            target: "auth.token.revoke_all",
            %user_id,
            reason = reason.as_str(),
            sessions = revoked.len(),
            "revoked all sessions for user"
        );
        Ok(revoked.len() as u64)
    }

    /// Verify an access token: signature and expiry statelessly, then the
    /// revocation ledger. `None` for anything unacceptable.
    pub async fn verify_access_token(&self, token: &str) -> Result<Option<AccessClaims>> {
        let Some(claims) = self.signer.decode(token) else {
            return Ok(None);
        };
        let revoked = self
            .ledger
            .contains(&hash_token_value(&claims.jti))
            .await
            .map_err(AuthError::Store)?;
        Ok(if revoked { None } else { Some(claims) })
    }

    /// Revoke a still-valid access token ahead of its expiry by ledgering
    /// its `jti`.
    pub async fn revoke_access_token(
        &self,
        token: &str,
        user_id: Uuid,
        reason: RevocationReason,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let Some(claims) = self.signer.decode(token) else {
            return Err(AuthError::AuthenticationFailed);
        };
        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp).ok();
        self.ledger
            .append(RevokedTokenRecord {
                user_id,
                token_hash: hash_token_value(&claims.jti),
                token_type: TokenType::Access,
                expires_at,
                revoked_by: user_id.to_string(),
                reason,
                ip_address: None,
                user_agent: None,
                revoked_at: now,
            })
            .await
            .map_err(AuthError::Store)?;
        Ok(())
    }

    /// Hook for credential changes: stamps `password_changed_at` and forces
    /// every session to re-authenticate.
    pub async fn password_changed(&self, user_id: Uuid) -> Result<u64> {
        let now = OffsetDateTime::now_utc();
        self.credentials
            .mark_password_changed(user_id, now)
            .await
            .map_err(AuthError::Store)?;
        self.logout_all(user_id, RevocationReason::PasswordChange)
            .await
    }

    /// Aggregate view of the user's live sessions. Lock-free read; may lag
    /// in-flight rotations.
    pub async fn session_stats(&self, user_id: Uuid) -> Result<SessionStats> {
        let now = OffsetDateTime::now_utc();
        let active = self
            .tokens
            .active_for_user(user_id, now)
            .await
            .map_err(AuthError::Store)?;
        Ok(SessionStats {
            active_count: active.len(),
            last_used_at: active.iter().filter_map(|r| r.last_used_at).max(),
            oldest_created_at: active.first().map(|r| r.created_at),
        })
    }

    /// Mint a pair and durably insert the refresh row before returning it.
    /// `last_used_at` is the rotation time when the row replaces a consumed
    /// token, `None` for a fresh login.
    async fn mint_pair(
        &self,
        user: &DirectoryUser,
        family_id: Uuid,
        meta: &ClientMeta,
        last_used_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<TokenPair> {
        let (access_token, _claims) = self
            .signer
            .sign(user.id, user.role, family_id, now)
            .map_err(AuthError::Crypto)?;
        let refresh_token = generate_refresh_token().map_err(AuthError::Crypto)?;

        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            token_hash: hash_token_value(&refresh_token),
            family_id,
            expires_at: now + self.config.refresh_ttl(),
            created_at: now,
            last_used_at,
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
            is_revoked: false,
            revoked_at: None,
            revoked_by: None,
            reason: None,
        };
        // No token leaves the service without a matching store row.
        self.tokens.insert(record).await.map_err(AuthError::Store)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_ttl().whole_seconds(),
            family_id,
        })
    }

    /// Revoke the oldest sessions beyond the per-user cap.
    async fn enforce_session_cap(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        let active = self
            .tokens
            .active_for_user(user_id, now)
            .await
            .map_err(AuthError::Store)?;
        let cap = self.config.max_sessions_per_user();
        if active.len() <= cap {
            return Ok(());
        }
        let excess = active.len() - cap;
        for record in active.into_iter().take(excess) {
            let revoked = self
                .tokens
                .revoke_if_active(
                    &record.token_hash,
                    RevocationReason::LimitExceeded,
                    SYSTEM_ACTOR,
                    now,
                )
                .await
                .map_err(AuthError::Store)?;
            if let Some(revoked) = revoked {
                info!(
                    target: "auth.session_cap",
                    %user_id,
                    family = %revoked.family_id,
                    "evicted oldest session beyond cap"
                );
                self.append_ledger_rows(&[revoked]).await?;
            }
        }
        Ok(())
    }

    /// Theft response: revoke the whole family, ledger every row, and hand
    /// back the same generic error a plainly-dead token would get.
    async fn reuse_detected(
        &self,
        record: &RefreshTokenRecord,
        now: OffsetDateTime,
    ) -> Result<AuthError> {
        error!(
            target: "auth.token.reuse_detected",
            user_id = %record.user_id,
            family = %record.family_id,
            "refresh token replay detected; revoking entire family"
        );
        let revoked = self
            .tokens
            .revoke_family(record.family_id, RevocationReason::Security, SYSTEM_ACTOR, now)
            .await
            .map_err(AuthError::Store)?;
        self.append_ledger_rows(&revoked).await?;
        Ok(AuthError::InvalidRefreshToken)
    }

    /// Mirror freshly revoked refresh rows into the append-only ledger.
    async fn append_ledger_rows(&self, rows: &[RefreshTokenRecord]) -> Result<()> {
        for row in rows {
            let reason = row.reason.unwrap_or(RevocationReason::Security);
            let revoked_by = row.revoked_by.clone().unwrap_or_else(|| SYSTEM_ACTOR.to_string());
            self.ledger
                .append(RevokedTokenRecord {
                    user_id: row.user_id,
                    token_hash: row.token_hash.clone(),
                    token_type: TokenType::Refresh,
                    expires_at: Some(row.expires_at),
                    revoked_by,
                    reason,
                    ip_address: row.ip_address.clone(),
                    user_agent: row.user_agent.clone(),
                    revoked_at: row.revoked_at.unwrap_or_else(OffsetDateTime::now_utc),
                })
                .await
                .map_err(AuthError::Store)?;
        }
        Ok(())
    }
}
