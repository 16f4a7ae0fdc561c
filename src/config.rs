//! Service configuration with builder-style overrides.

use time::Duration;

const DEFAULT_ACCESS_TTL: Duration = Duration::minutes(15);
const DEFAULT_REFRESH_TTL: Duration = Duration::days(7);
const DEFAULT_MAX_SESSIONS: usize = 5;
const DEFAULT_MAX_FAILED_LOGINS: i32 = 5;
const DEFAULT_LOCKOUT_DURATION: Duration = Duration::minutes(30);
const DEFAULT_LEDGER_RETENTION: Duration = Duration::days(30);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::hours(24);
const DEFAULT_SWEEP_BATCH_SIZE: i64 = 500;
const DEFAULT_ISSUER: &str = "fincred";

// Argon2id defaults: 64 MiB, 3 iterations, single lane, 32-byte output.
const DEFAULT_ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const DEFAULT_ARGON2_ITERATIONS: u32 = 3;
const DEFAULT_ARGON2_PARALLELISM: u32 = 1;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    max_sessions_per_user: usize,
    max_failed_logins: i32,
    lockout_duration: Duration,
    ledger_retention: Duration,
    sweep_interval: Duration,
    sweep_batch_size: i64,
    argon2_memory_kib: u32,
    argon2_iterations: u32,
    argon2_parallelism: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS,
            max_failed_logins: DEFAULT_MAX_FAILED_LOGINS,
            lockout_duration: DEFAULT_LOCKOUT_DURATION,
            ledger_retention: DEFAULT_LEDGER_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_iterations: DEFAULT_ARGON2_ITERATIONS,
            argon2_parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_sessions_per_user(mut self, max: usize) -> Self {
        self.max_sessions_per_user = max;
        self
    }

    #[must_use]
    pub fn with_max_failed_logins(mut self, max: i32) -> Self {
        self.max_failed_logins = max;
        self
    }

    #[must_use]
    pub fn with_lockout_duration(mut self, duration: Duration) -> Self {
        self.lockout_duration = duration;
        self
    }

    #[must_use]
    pub fn with_ledger_retention(mut self, retention: Duration) -> Self {
        self.ledger_retention = retention;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Clamped to at least 1; a non-positive batch would stall the sweep
    /// loop's termination check.
    #[must_use]
    pub fn with_sweep_batch_size(mut self, batch_size: i64) -> Self {
        self.sweep_batch_size = batch_size.max(1);
        self
    }

    /// Lower the KDF cost. Intended for tests; production keeps the
    /// memory-hard defaults.
    #[must_use]
    pub fn with_argon2_params(mut self, memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        self.argon2_memory_kib = memory_kib;
        self.argon2_iterations = iterations;
        self.argon2_parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str { &self.issuer }
    #[must_use]
    pub fn access_ttl(&self) -> Duration { self.access_ttl }
    #[must_use]
    pub fn refresh_ttl(&self) -> Duration { self.refresh_ttl }
    #[must_use]
    pub fn max_sessions_per_user(&self) -> usize { self.max_sessions_per_user }
    #[must_use]
    pub fn max_failed_logins(&self) -> i32 { self.max_failed_logins }
    #[must_use]
    pub fn lockout_duration(&self) -> Duration { self.lockout_duration }
    #[must_use]
    pub fn ledger_retention(&self) -> Duration { self.ledger_retention }
    #[must_use]
    pub fn sweep_interval(&self) -> Duration { self.sweep_interval }
    #[must_use]
    pub fn sweep_batch_size(&self) -> i64 { self.sweep_batch_size }
    #[must_use]
    pub fn argon2_memory_kib(&self) -> u32 { self.argon2_memory_kib }
    #[must_use]
    pub fn argon2_iterations(&self) -> u32 { self.argon2_iterations }
    #[must_use]
    pub fn argon2_parallelism(&self) -> u32 { self.argon2_parallelism }
}
