//! Local user accounts and sessions.
//!
//! Provides:
//! - The [`UserDirectory`] seam the sync core talks to
//! - A SQLite-backed [`AuthStore`] implementing it, with password login for
//!   accounts that originate on this site
//! - Session token management (opaque hex tokens, SHA-256 hashed for storage, time-limited)
//!
//! ## Design Decisions
//! - Sessions use opaque random tokens with server-side SHA-256 hashed lookup.
//! - Accounts mirrored from a peer have no usable password; they can only be
//!   entered through synchronization.
//! - Email and login lookups are case-insensitive.

pub mod store;

pub use store::AuthStore;

use anyhow::Result;

/// A local account as seen by the sync core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub login: String,
    pub email: String,
    /// Set for accounts whose email is trusted (local registrations and
    /// accounts created by synchronization). Only verified users broadcast.
    pub email_verified: bool,
    pub created_at: i64,
}

/// Account storage collaborator of the session synchronizer.
pub trait UserDirectory: Send + Sync {
    fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    fn find_by_login(&self, login: &str) -> Result<Option<UserRecord>>;
    /// Create an account without a usable password.
    fn create_user(&self, login: &str, email: &str, email_verified: bool) -> Result<UserRecord>;
    /// Revoke every session of a user. Returns the number revoked.
    fn destroy_all_sessions(&self, user_id: &str) -> Result<u64>;
    /// Issue a fresh session for a user and return its plaintext token.
    fn set_current_session(&self, user_id: &str) -> Result<String>;
    /// Resolve a session token to its user, if valid.
    fn session_user(&self, token: &str) -> Result<Option<UserRecord>>;
}
