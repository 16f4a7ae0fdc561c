//! Postgres-backed store.
//!
//! Revocation is a conditional `UPDATE … WHERE is_revoked = FALSE …
//! RETURNING`, so two racing rotations on the same token resolve at the row
//! level: exactly one statement reports the flip. No multi-row transactions
//! are required anywhere. See `schema.sql` for the table layout.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    CredentialStore, RefreshTokenRecord, RevocationLedger, RevocationReason, RevokedTokenRecord,
    SecurityProfile, TokenStore,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drain the pool. Part of explicit service shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn map_refresh_row(row: &PgRow) -> Result<RefreshTokenRecord> {
    let reason: Option<String> = row.get("reason");
    let reason = match reason {
        Some(text) => Some(
            RevocationReason::parse(&text)
                .ok_or_else(|| anyhow!("unknown revocation reason in store: {text}"))?,
        ),
        None => None,
    };
    Ok(RefreshTokenRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token_hash: row.get("token_hash"),
        family_id: row.get("family_id"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        is_revoked: row.get("is_revoked"),
        revoked_at: row.get("revoked_at"),
        revoked_by: row.get("revoked_by"),
        reason,
    })
}

fn map_profile_row(row: &PgRow) -> SecurityProfile {
    SecurityProfile {
        user_id: row.get("user_id"),
        failed_login_attempts: row.get("failed_login_attempts"),
        locked_until: row.get("locked_until"),
        password_changed_at: row.get("password_changed_at"),
        two_factor_enabled: row.get("two_factor_enabled"),
        last_login: row.get("last_login"),
    }
}

const REFRESH_RETURNING: &str = r"
        RETURNING id, user_id, token_hash, family_id, expires_at, created_at,
                  last_used_at, ip_address, user_agent, is_revoked, revoked_at,
                  revoked_by, reason
";

#[async_trait]
impl TokenStore for PostgresStore {
    async fn insert(&self, record: RefreshTokenRecord) -> Result<()> {
        let query = r"
            INSERT INTO refresh_tokens
                (id, user_id, token_hash, family_id, expires_at, created_at,
                 last_used_at, ip_address, user_agent, is_revoked, revoked_at,
                 revoked_by, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.token_hash)
            .bind(record.family_id)
            .bind(record.expires_at)
            .bind(record.created_at)
            .bind(record.last_used_at)
            .bind(&record.ip_address)
            .bind(&record.user_agent)
            .bind(record.is_revoked)
            .bind(record.revoked_at)
            .bind(&record.revoked_by)
            .bind(record.reason.map(RevocationReason::as_str))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert refresh token")?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<RefreshTokenRecord>> {
        let query = r"
            SELECT id, user_id, token_hash, family_id, expires_at, created_at,
                   last_used_at, ip_address, user_agent, is_revoked, revoked_at,
                   revoked_by, reason
            FROM refresh_tokens
            WHERE token_hash = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup refresh token")?;
        row.as_ref().map(map_refresh_row).transpose()
    }

    async fn revoke_if_active(
        &self,
        token_hash: &[u8],
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Option<RefreshTokenRecord>> {
        // The WHERE clause is the linearization point: only one caller can
        // observe is_revoked flipping FALSE -> TRUE.
        let query = format!(
            r"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = $2, revoked_by = $3, reason = $4
            WHERE token_hash = $1 AND is_revoked = FALSE
            {REFRESH_RETURNING}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .bind(now)
            .bind(revoked_by)
            .bind(reason.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke refresh token")?;
        row.as_ref().map(map_refresh_row).transpose()
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let query = format!(
            r"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = $2, revoked_by = $3, reason = $4
            WHERE family_id = $1 AND is_revoked = FALSE
            {REFRESH_RETURNING}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(family_id)
            .bind(now)
            .bind(revoked_by)
            .bind(reason.as_str())
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke token family")?;
        rows.iter().map(map_refresh_row).collect()
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        revoked_by: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let query = format!(
            r"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = $2, revoked_by = $3, reason = $4
            WHERE user_id = $1 AND is_revoked = FALSE
            {REFRESH_RETURNING}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(now)
            .bind(revoked_by)
            .bind(reason.as_str())
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke user tokens")?;
        rows.iter().map(map_refresh_row).collect()
    }

    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let query = r"
            SELECT id, user_id, token_hash, family_id, expires_at, created_at,
                   last_used_at, ip_address, user_agent, is_revoked, revoked_at,
                   revoked_by, reason
            FROM refresh_tokens
            WHERE user_id = $1 AND is_revoked = FALSE AND expires_at > $2
            ORDER BY created_at ASC, id ASC
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list active tokens")?;
        rows.iter().map(map_refresh_row).collect()
    }

    async fn delete_expired(&self, now: OffsetDateTime, limit: i64) -> Result<u64> {
        // Bounded batches keep sweep statements short-lived.
        let query = r"
            DELETE FROM refresh_tokens
            WHERE id IN (
                SELECT id FROM refresh_tokens WHERE expires_at < $1 LIMIT $2
            )
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .bind(limit)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete expired refresh tokens")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RevocationLedger for PostgresStore {
    async fn append(&self, record: RevokedTokenRecord) -> Result<()> {
        let query = r"
            INSERT INTO revoked_tokens
                (user_id, token_hash, token_type, expires_at, revoked_by,
                 reason, ip_address, user_agent, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.user_id)
            .bind(&record.token_hash)
            .bind(record.token_type.as_str())
            .bind(record.expires_at)
            .bind(&record.revoked_by)
            .bind(record.reason.as_str())
            .bind(&record.ip_address)
            .bind(&record.user_agent)
            .bind(record.revoked_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to append revocation record")?;
        Ok(())
    }

    async fn contains(&self, token_hash: &[u8]) -> Result<bool> {
        let query = r"
            SELECT 1 FROM revoked_tokens WHERE token_hash = $1 LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to check revocation ledger")?;
        Ok(row.is_some())
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime, limit: i64) -> Result<u64> {
        let query = r"
            DELETE FROM revoked_tokens
            WHERE ctid IN (
                SELECT ctid FROM revoked_tokens WHERE revoked_at < $1 LIMIT $2
            )
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(cutoff)
            .bind(limit)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to age out revocation records")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn load(&self, user_id: Uuid) -> Result<Option<SecurityProfile>> {
        let query = r"
            SELECT user_id, failed_login_attempts, locked_until,
                   password_changed_at, two_factor_enabled, last_login
            FROM security_profiles
            WHERE user_id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load security profile")?;
        Ok(row.as_ref().map(map_profile_row))
    }

    async fn record_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        locked_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<SecurityProfile> {
        // Single upsert: the lock is armed only when the incremented counter
        // reaches the threshold and no unexpired lock exists, so repeated
        // failures cannot push an active lock further out.
        let query = r"
            INSERT INTO security_profiles
                (user_id, failed_login_attempts, locked_until, two_factor_enabled)
            VALUES ($1, 1, CASE WHEN 1 >= $2 THEN $3 END, FALSE)
            ON CONFLICT (user_id) DO UPDATE
            SET failed_login_attempts = security_profiles.failed_login_attempts + 1,
                locked_until = CASE
                    WHEN security_profiles.failed_login_attempts + 1 >= $2
                         AND (security_profiles.locked_until IS NULL
                              OR security_profiles.locked_until <= $4)
                    THEN $3
                    ELSE security_profiles.locked_until
                END
            RETURNING user_id, failed_login_attempts, locked_until,
                      password_changed_at, two_factor_enabled, last_login
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(threshold)
            .bind(locked_until)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login failure")?;
        Ok(map_profile_row(&row))
    }

    async fn record_success(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        let query = r"
            INSERT INTO security_profiles
                (user_id, failed_login_attempts, locked_until, two_factor_enabled, last_login)
            VALUES ($1, 0, NULL, FALSE, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET failed_login_attempts = 0,
                locked_until = NULL,
                last_login = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login success")?;
        Ok(())
    }

    async fn mark_password_changed(&self, user_id: Uuid, now: OffsetDateTime) -> Result<()> {
        let query = r"
            INSERT INTO security_profiles
                (user_id, failed_login_attempts, two_factor_enabled, password_changed_at)
            VALUES ($1, 0, FALSE, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET password_changed_at = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to stamp password change")?;
        Ok(())
    }
}
