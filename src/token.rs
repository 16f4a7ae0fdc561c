//! Access-token signing and opaque refresh-token primitives.
//!
//! Access tokens are short-lived signed JWTs verified statelessly. Refresh
//! tokens are deliberately unstructured: 32 random bytes, base64url encoded,
//! so there is nothing to parse or tamper with offline. Only SHA-256 hashes
//! of refresh tokens (and of access-token `jti`s, for the revocation ledger)
//! ever reach the database.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::directory::{Permission, Role};

/// Claims carried by a signed access token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub jti: String,
    pub family: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Signs and verifies access tokens with a process-wide HS256 secret.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
}

impl TokenSigner {
    #[must_use]
    pub fn new(secret: &[u8], issuer: &str, access_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer: issuer.to_string(),
            access_ttl,
        }
    }

    /// Mint a signed access token for the user. Returns the token and its
    /// `jti`, which callers need for ad-hoc revocation.
    pub fn sign(
        &self,
        user_id: Uuid,
        role: Role,
        family: Uuid,
        now: OffsetDateTime,
    ) -> Result<(String, AccessClaims)> {
        let claims = AccessClaims {
            sub: user_id,
            role,
            permissions: role.permissions().to_vec(),
            jti: Uuid::new_v4().to_string(),
            family,
            iat: now.unix_timestamp(),
            exp: (now + self.access_ttl).unix_timestamp(),
            iss: self.issuer.clone(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| anyhow!("failed to sign access token: {err}"))?;
        Ok((token, claims))
    }

    /// Validate signature, expiry, and issuer. Any failure is `None`; the
    /// caller cannot distinguish why a token was rejected.
    #[must_use]
    pub fn decode(&self, token: &str) -> Option<AccessClaims> {
        jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .ok()
    }
}

/// Generate an opaque refresh-token value: 32 random bytes, base64url.
///
/// The raw value is only ever returned to the caller; the store keeps a hash.
pub fn generate_refresh_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token value (refresh token or access `jti`) for storage and lookup.
#[must_use]
pub fn hash_token_value(value: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().to_vec()
}
