//! SQLite-backed user directory.
//!
//! Tables:
//! - `users`: login, email, password_hash, salt, email_verified, created_at
//! - `sessions`: token_hash, user_id, created_at, expires_at

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{UserDirectory, UserRecord};

/// Default session duration: 30 days (seconds).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 3600;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// Stored in place of a hash for accounts that cannot log in with a password.
const UNUSABLE_PASSWORD: &str = "!";

/// Maximum login length.
const MAX_LOGIN_LEN: usize = 60;

const USER_COLUMNS: &str = "id, login, email, email_verified, created_at";

/// SQLite-backed authentication store.
pub struct AuthStore {
    conn: Mutex<rusqlite::Connection>,
    session_ttl_secs: u64,
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        login: row.get(1)?,
        email: row.get(2)?,
        email_verified: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl AuthStore {
    /// Open (or create) the auth database at the given path.
    pub fn new(db_path: &Path, session_ttl_secs: Option<u64>) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        Self::init(conn, session_ttl_secs)
    }

    /// Throwaway in-memory store.
    pub fn in_memory(session_ttl_secs: Option<u64>) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn, session_ttl_secs)
    }

    fn init(conn: rusqlite::Connection, session_ttl_secs: Option<u64>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                login TEXT NOT NULL UNIQUE COLLATE NOCASE,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                email_verified INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl_secs: session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS),
        })
    }

    // ── User Management ─────────────────────────────────────────────

    fn insert_user(
        &self,
        login: &str,
        email: &str,
        password_hash: &str,
        salt: &str,
        email_verified: bool,
    ) -> Result<UserRecord> {
        let login = login.trim();
        let email = email.trim();
        if login.is_empty() {
            bail!("Login cannot be empty");
        }
        if login.len() > MAX_LOGIN_LEN {
            bail!("Login too long (max {MAX_LOGIN_LEN} characters)");
        }
        if email.is_empty() {
            bail!("Email cannot be empty");
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (id, login, email, password_hash, salt, email_verified, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![id, login, email, password_hash, salt, email_verified, now],
        );

        match result {
            Ok(_) => Ok(UserRecord {
                id,
                login: login.to_string(),
                email: email.to_string(),
                email_verified,
                created_at: now,
            }),
            Err(e) if is_constraint_violation(&e) => {
                bail!("Login '{login}' or email is already taken")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register a local account with a password.
    pub fn register(&self, login: &str, email: &str, password: &str) -> Result<UserRecord> {
        if password.len() < 8 {
            bail!("Password must be at least 8 characters");
        }
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        self.insert_user(login, email, &password_hash, &salt, true)
    }

    /// Authenticate a user by login + password.
    pub fn authenticate(&self, login: &str, password: &str) -> Result<UserRecord> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!(
                "SELECT {USER_COLUMNS}, password_hash, salt FROM users WHERE login = ?1 COLLATE NOCASE"
            ),
            rusqlite::params![login.trim()],
            |row| Ok((row_to_user(row)?, row.get::<_, String>(5)?, row.get::<_, String>(6)?)),
        );

        match row {
            Ok((user, stored_hash, salt)) => {
                if stored_hash == UNUSABLE_PASSWORD {
                    // Keep timing comparable to a real check.
                    let _ = hash_password(password, "0000000000000000");
                    bail!("Invalid login or password");
                }
                let attempt_hash = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt_hash.as_bytes()) {
                    bail!("Invalid login or password");
                }
                Ok(user)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Perform dummy hash to prevent timing side-channel
                let _ = hash_password(password, "0000000000000000");
                bail!("Invalid login or password");
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_one(&self, column: &str, value: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1 COLLATE NOCASE"),
            rusqlite::params![value.trim()],
            row_to_user,
        );

        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count registered users.
    pub fn user_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── Session Management ──────────────────────────────────────────

    /// Create a session token for an authenticated user.
    /// Returns the plaintext token (only revealed once).
    pub fn create_session(&self, user_id: &str) -> Result<String> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();
        let expires_at = now + self.session_ttl_secs;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token_hash, user_id, now as i64, expires_at as i64],
        )?;

        Ok(token)
    }

    /// Validate a session token and return the owning user.
    /// Returns `None` if the token is invalid or expired.
    pub fn validate_session(&self, token: &str) -> Result<Option<UserRecord>> {
        let token_hash = hash_token(token);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT u.id, u.login, u.email, u.email_verified, u.created_at
             FROM sessions s JOIN users u ON s.user_id = u.id
             WHERE s.token_hash = ?1 AND s.expires_at > ?2",
            rusqlite::params![token_hash, now],
            row_to_user,
        );

        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke all sessions for a user.
    pub fn revoke_all_sessions(&self, user_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        Ok(deleted as u64)
    }

    /// Number of live sessions for a user.
    pub fn session_count(&self, user_id: &str) -> Result<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND expires_at > ?2",
            rusqlite::params![user_id, now],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete expired sessions; returns how many were removed.
    pub fn cleanup_expired_sessions(&self) -> Result<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted as u64)
    }
}

impl UserDirectory for AuthStore {
    fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        self.find_one("email", email)
    }

    fn find_by_login(&self, login: &str) -> Result<Option<UserRecord>> {
        self.find_one("login", login)
    }

    fn create_user(&self, login: &str, email: &str, email_verified: bool) -> Result<UserRecord> {
        self.insert_user(login, email, UNUSABLE_PASSWORD, "", email_verified)
    }

    fn destroy_all_sessions(&self, user_id: &str) -> Result<u64> {
        self.revoke_all_sessions(user_id)
    }

    fn set_current_session(&self, user_id: &str) -> Result<String> {
        self.create_session(user_id)
    }

    fn session_user(&self, token: &str) -> Result<Option<UserRecord>> {
        self.validate_session(token)
    }
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random session token (hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    // Iterated hashing for key stretching
    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Hash a session token (single SHA-256 pass).
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ───────────────────────────────────────────────────────────
