//! Password policy and hashing.
//!
//! Hashes are Argon2id in PHC string format, keyed with a 32-byte server-side
//! pepper supplied as the argon2 secret. The pepper is loaded once at process
//! start and generated if absent. Verification transparently accepts legacy
//! bcrypt hashes (`$2a$`/`$2b$`/`$2y$`) left over from the pre-migration
//! store; those predate the pepper and are verified without it.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::SaltString, Algorithm, Argon2, Params, PasswordHash, PasswordHasher,
    PasswordVerifier, Version,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::config::AuthConfig;

pub const PEPPER_LEN: usize = 32;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

// Lowercased substrings that fail the policy outright.
const WEAK_SUBSTRINGS: &[&str] = &[
    "password", "qwerty", "123456", "letmein", "welcome", "abc123", "iloveyou",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyViolation {
    TooShort,
    TooLong,
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSpecial,
    WeakSubstring,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::TooShort => "password must be at least 8 characters",
            Self::TooLong => "password must be at most 128 characters",
            Self::MissingUppercase => "password must contain an uppercase letter",
            Self::MissingLowercase => "password must contain a lowercase letter",
            Self::MissingDigit => "password must contain a digit",
            Self::MissingSpecial => "password must contain a special character",
            Self::WeakSubstring => "password contains a common weak phrase",
        };
        f.write_str(message)
    }
}

/// Check a candidate password against the policy, reporting every violation
/// rather than stopping at the first.
#[must_use]
pub fn validate_password(password: &str) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();
    let length = password.chars().count();
    if length < MIN_PASSWORD_LEN {
        violations.push(PolicyViolation::TooShort);
    }
    if length > MAX_PASSWORD_LEN {
        violations.push(PolicyViolation::TooLong);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push(PolicyViolation::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push(PolicyViolation::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push(PolicyViolation::MissingDigit);
    }
    if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        violations.push(PolicyViolation::MissingSpecial);
    }
    let lowered = password.to_lowercase();
    if WEAK_SUBSTRINGS.iter().any(|weak| lowered.contains(weak)) {
        violations.push(PolicyViolation::WeakSubstring);
    }
    violations
}

/// Fallible form of [`validate_password`] for callers accepting a new
/// credential: fails with the full violation list.
pub fn enforce_password_policy(password: &str) -> crate::error::Result<()> {
    let violations = validate_password(password);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(crate::error::AuthError::PolicyViolation(violations))
    }
}

/// Server-side pepper mixed into every argon2 hash as the KDF secret.
pub struct Pepper(SecretBox<Vec<u8>>);

impl Pepper {
    /// Load the pepper from `path`, generating and persisting a fresh one
    /// (mode 0600) when the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read pepper file {}", path.display()))?;
            if bytes.len() != PEPPER_LEN {
                return Err(anyhow!(
                    "pepper file {} must hold exactly {PEPPER_LEN} bytes",
                    path.display()
                ));
            }
            return Ok(Self::from_bytes(bytes));
        }

        let mut bytes = vec![0u8; PEPPER_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate pepper")?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("failed to create pepper file {}", path.display()))?;
        file.write_all(&bytes).context("failed to write pepper")?;

        Ok(Self::from_bytes(bytes))
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

/// Argon2id hasher bound to the server pepper.
///
/// Hashing is deliberately expensive (memory-hard); callers should keep it
/// off any path that holds shared locks.
pub struct CredentialHasher {
    pepper: Pepper,
    params: Params,
    // Pre-built hash so unknown-user logins burn the same KDF cost as a
    // wrong-password verify.
    dummy_hash: String,
}

impl CredentialHasher {
    pub fn new(pepper: Pepper, config: &AuthConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_kib(),
            config.argon2_iterations(),
            config.argon2_parallelism(),
            Some(Params::DEFAULT_OUTPUT_LEN),
        )
        .map_err(|err| anyhow!("invalid argon2 params: {err}"))?;

        let mut hasher = Self {
            pepper,
            params,
            dummy_hash: String::new(),
        };
        hasher.dummy_hash = hasher.hash("fincred-dummy-credential")?;
        Ok(hasher)
    }

    fn argon2(&self) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(
            self.pepper.expose(),
            Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
        .map_err(|err| anyhow!("failed to initialize argon2: {err}"))
    }

    /// Hash a password into a PHC string. Fails only on misconfiguration.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| anyhow!("argon2 hashing failed: {err}"))
    }

    /// Verify a password against a stored hash, routing legacy bcrypt hashes
    /// to the legacy verifier. Malformed hashes verify false.
    pub fn verify(&self, password: &str, stored_hash: &str) -> Result<bool> {
        if is_legacy_bcrypt(stored_hash) {
            // Legacy hashes were created before the pepper existed.
            return bcrypt::verify(password, stored_hash)
                .map_err(|err| anyhow!("bcrypt verification failed: {err}"));
        }
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return Ok(false);
        };
        Ok(self
            .argon2()?
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// Burn a full verification's worth of KDF work without checking
    /// anything. Keeps login timing uniform when the user does not exist.
    pub fn verify_dummy(&self, password: &str) {
        let _ = self.verify(password, &self.dummy_hash);
    }
}

fn is_legacy_bcrypt(hash: &str) -> bool {
    hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$")
}

#[cfg(test)]
pub(crate) fn test_hasher() -> CredentialHasher {
    // Cheap KDF parameters; production costs are pointless in unit tests.
    let config = AuthConfig::new().with_argon2_params(8, 1, 1);
    match CredentialHasher::new(Pepper::from_bytes(vec![7u8; PEPPER_LEN]), &config) {
        Ok(hasher) => hasher,
        Err(err) => panic!("test hasher construction failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_password_passes() {
        assert!(validate_password("Aa1!aaaa").is_empty());
    }

    #[test]
    fn all_violations_reported_at_once() {
        // Too short, no upper, no digit, no special.
        let violations = validate_password("abc");
        assert!(violations.contains(&PolicyViolation::TooShort));
        assert!(violations.contains(&PolicyViolation::MissingUppercase));
        assert!(violations.contains(&PolicyViolation::MissingDigit));
        assert!(violations.contains(&PolicyViolation::MissingSpecial));
        assert_eq!(violations.len(), 4);
    }

    #[test]
    fn policy_failure_surfaces_as_error() {
        use crate::error::AuthError;

        assert!(enforce_password_policy("Aa1!aaaa").is_ok());
        let err = match enforce_password_policy("short") {
            Err(err) => err,
            Ok(()) => panic!("weak password accepted"),
        };
        let AuthError::PolicyViolation(violations) = err else {
            panic!("expected PolicyViolation, got {err:?}");
        };
        assert!(violations.contains(&PolicyViolation::TooShort));
        assert!(violations.contains(&PolicyViolation::MissingUppercase));
    }

    #[test]
    fn weak_substring_rejected_case_insensitively() {
        let violations = validate_password("PassWord1!x");
        assert!(violations.contains(&PolicyViolation::WeakSubstring));
    }

    #[test]
    fn overlong_password_rejected() {
        let long = "Aa1!".repeat(40);
        assert!(validate_password(&long).contains(&PolicyViolation::TooLong));
    }

    #[test]
    fn hash_then_verify_round_trips() -> Result<()> {
        let hasher = test_hasher();
        let hash = hasher.hash("Aa1!aaaa")?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("Aa1!aaaa", &hash)?);
        Ok(())
    }

    #[test]
    fn single_character_mutation_fails_verification() -> Result<()> {
        let hasher = test_hasher();
        let hash = hasher.hash("Aa1!aaaa")?;
        assert!(!hasher.verify("Aa1!aaab", &hash)?);
        assert!(!hasher.verify("Ba1!aaaa", &hash)?);
        Ok(())
    }

    #[test]
    fn different_pepper_fails_verification() -> Result<()> {
        let hasher = test_hasher();
        let hash = hasher.hash("Aa1!aaaa")?;

        let config = AuthConfig::new().with_argon2_params(8, 1, 1);
        let other = CredentialHasher::new(Pepper::from_bytes(vec![9u8; PEPPER_LEN]), &config)?;
        assert!(!other.verify("Aa1!aaaa", &hash)?);
        Ok(())
    }

    #[test]
    fn legacy_bcrypt_hash_verifies_transparently() -> Result<()> {
        let hasher = test_hasher();
        let legacy = bcrypt::hash("Aa1!aaaa", 4).map_err(|err| anyhow!("{err}"))?;
        assert!(hasher.verify("Aa1!aaaa", &legacy)?);
        assert!(!hasher.verify("wrong-pass", &legacy)?);
        Ok(())
    }

    #[test]
    fn malformed_hash_verifies_false() -> Result<()> {
        let hasher = test_hasher();
        assert!(!hasher.verify("Aa1!aaaa", "not-a-phc-string")?);
        Ok(())
    }

    #[test]
    fn pepper_generated_once_and_reloaded() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("fincred-pepper-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join("pepper.key");
        let _ = fs::remove_file(&path);

        let first = Pepper::load_or_generate(&path)?;
        let second = Pepper::load_or_generate(&path)?;
        assert_eq!(first.expose(), second.expose());
        assert_eq!(first.expose().len(), PEPPER_LEN);

        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn short_pepper_file_rejected() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("fincred-pepper-short-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join("pepper.key");
        fs::write(&path, b"too-short")?;
        assert!(Pepper::load_or_generate(&path).is_err());
        fs::remove_file(&path)?;
        Ok(())
    }
}
