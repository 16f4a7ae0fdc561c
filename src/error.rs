//! Error taxonomy for the credential and token lifecycle service.
//!
//! Credential and token validation failures collapse into uniform variants so
//! callers cannot tell "unknown user" from "wrong password" from "revoked
//! token". Lockout carries its expiry so a UI can show a countdown. Theft
//! detection is logged server-side and surfaced as the same generic failure
//! the attacker would see for any dead token.

use crate::password::PolicyViolation;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The password failed policy validation; every violation is reported.
    #[error("password policy violation")]
    PolicyViolation(Vec<PolicyViolation>),

    /// Bad credentials. Deliberately carries no detail.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Unknown, expired, revoked, or replayed refresh token. One variant for
    /// all of them.
    #[error("invalid refresh token")]
    InvalidRefreshToken,

    /// The account is temporarily locked after repeated failures.
    #[error("account locked")]
    AccountLocked { until: OffsetDateTime },

    /// Hashing or signing failed. Indicates misconfiguration (missing
    /// secret, broken KDF) and is fatal for the request.
    #[error("credential backend failure")]
    Crypto(#[source] anyhow::Error),

    /// Persistence failure. Never swallowed for security-relevant writes.
    #[error("store failure")]
    Store(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_no_detail() {
        assert_eq!(
            AuthError::AuthenticationFailed.to_string(),
            "authentication failed"
        );
        assert_eq!(
            AuthError::InvalidRefreshToken.to_string(),
            "invalid refresh token"
        );
        // The lockout expiry lives in the variant, not the message.
        let locked = AuthError::AccountLocked {
            until: OffsetDateTime::UNIX_EPOCH,
        };
        assert_eq!(locked.to_string(), "account locked");
    }
}
