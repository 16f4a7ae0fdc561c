//! # Fincred (Credential & Token Lifecycle Service)
//!
//! `fincred` is the credential and session authority for a multi-tenant
//! finance dashboard. It owns password verification, access-token issuance,
//! and the full refresh-token lifecycle.
//!
//! ## Token Model
//!
//! - **Access tokens** are short-lived signed JWTs (15 minutes) verified
//!   statelessly, then checked against a revocation ledger so individual
//!   tokens can be killed before expiry.
//! - **Refresh tokens** are opaque random values. Only SHA-256 hashes are
//!   stored. Each refresh consumes the presented token and issues a new one
//!   in the same **family**; presenting an already-rotated token is treated
//!   as theft and revokes the entire family.
//! - At most five sessions per user; the oldest is evicted when a sixth is
//!   opened.
//!
//! ## Credentials
//!
//! Passwords are hashed with Argon2id keyed by a server-side pepper.
//! Legacy bcrypt hashes verify transparently during migration. Login failures
//! are counted per user and lock the account temporarily at a threshold.
//!
//! Unknown email, wrong password, and inactive account all produce the same
//! failure, and the unknown-email path burns an equivalent hashing cost.
//!
//! ## Maintenance
//!
//! A background sweeper hard-deletes expired refresh tokens and ages
//! revocation-ledger rows out after a retention window, in bounded batches.

pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod lockout;
pub mod password;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod token;

pub use config::AuthConfig;
pub use error::{AuthError, Result};
pub use service::{AuthService, TokenPair};
