//! Configuration schema loaded from `config.toml`.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::keyring::{clean_domain_entry, KeyRing, SecretKeySet, UnknownUserPolicy};

/// Environment variable pointing at the config file.
pub const CONFIG_PATH_ENV: &str = "USSYNC_CONFIG";

/// Prefix of per-key-set secret overrides (`USSYNC_SECRET_KEY_1`, ...).
pub const SECRET_ENV_PREFIX: &str = "USSYNC_SECRET_KEY_";

/// Upper bound on the outbound notification timeout.
const MAX_NOTIFY_TIMEOUT_SECS: u64 = 30;

// ── Sections ─────────────────────────────────────────────────────

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Public URL of this site (e.g. `https://site1.com`).
    pub site_url: String,
    /// SQLite database for users and sessions. Relative paths resolve against
    /// the config file directory.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub key_sets: Vec<KeySetConfig>,
    /// Directory the config was loaded from.
    #[serde(skip)]
    pub config_dir: PathBuf,
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sync requests per client per minute (0 = unlimited).
    #[serde(default = "default_sync_rate_limit")]
    pub sync_rate_limit_per_minute: u32,
    /// Local login/register attempts per client per minute (0 = unlimited).
    #[serde(default = "default_auth_rate_limit")]
    pub auth_rate_limit_per_minute: u32,
    #[serde(default = "default_true")]
    pub allow_registration: bool,
    /// Session lifetime; defaults to the store's 30 days.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sync_rate_limit_per_minute: default_sync_rate_limit(),
            auth_rate_limit_per_minute: default_auth_rate_limit(),
            allow_registration: true,
            session_ttl_secs: None,
        }
    }
}

/// Outbound peer notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Scheme used to address peers in notification URLs.
    #[serde(default = "default_peer_scheme")]
    pub peer_scheme: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_notify_timeout(),
            max_concurrent: default_max_concurrent(),
            peer_scheme: default_peer_scheme(),
        }
    }
}

/// Peer-domain comparison mode for the referer check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainMatch {
    /// Byte-for-byte after trimming and trailing-slash removal.
    #[default]
    Exact,
    /// Additionally strips `http(s)://` and ignores ASCII case.
    Normalized,
}

/// Handshake settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub domain_match: DomainMatch,
}

/// Peer domains, either newline-separated text or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainList {
    Lines(String),
    List(Vec<String>),
}

impl Default for DomainList {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl DomainList {
    /// Cleaned entries in declaration order, empties and duplicates removed.
    pub fn entries(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::Lines(text) => text.lines().collect(),
            Self::List(items) => items.iter().map(String::as_str).collect(),
        };
        let mut seen = BTreeSet::new();
        raw.into_iter()
            .map(clean_domain_entry)
            .filter(|d| !d.is_empty())
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }
}

/// One `[[key_sets]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySetConfig {
    pub num: u32,
    pub secret: String,
    #[serde(default)]
    pub domains: DomainList,
    /// `register_subscriber` auto-registers unknown users; anything else rejects.
    #[serde(default)]
    pub unknown_user: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ussync.db")
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_sync_rate_limit() -> u32 {
    60
}
fn default_auth_rate_limit() -> u32 {
    20
}
fn default_true() -> bool {
    true
}
fn default_notify_timeout() -> u64 {
    5
}
fn default_max_concurrent() -> usize {
    4
}
fn default_peer_scheme() -> String {
    "http".into()
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Default config file location (`<config dir>/ussync/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ussync").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from an explicit path, `USSYNC_CONFIG`, or the default location,
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(p) if !p.trim().is_empty() => PathBuf::from(p.trim()),
                _ => Self::default_path()
                    .context("Could not determine a config directory; pass --config")?,
            },
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without touching the environment or validating.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `USSYNC_*` overrides through the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("USSYNC_SITE_URL").filter(|v| !v.trim().is_empty()) {
            self.site_url = url.trim().to_string();
        }
        if let Some(port) = lookup("USSYNC_GATEWAY_PORT") {
            self.gateway.port = port
                .trim()
                .parse()
                .with_context(|| format!("USSYNC_GATEWAY_PORT is not a port: {port}"))?;
        }
        for key_set in &mut self.key_sets {
            let name = format!("{SECRET_ENV_PREFIX}{}", key_set.num);
            if let Some(secret) = lookup(&name).filter(|v| !v.is_empty()) {
                tracing::debug!(key_num = key_set.num, "Secret overridden from environment");
                key_set.secret = secret;
            }
        }
        Ok(())
    }

    /// Reject configurations the handshake cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.site_url.trim().is_empty() {
            bail!("site_url must not be empty");
        }
        if self.key_sets.is_empty() {
            bail!("At least one [[key_sets]] entry is required");
        }
        let mut nums = BTreeSet::new();
        for key_set in &self.key_sets {
            if key_set.num == 0 {
                bail!("Key set numbers start at 1");
            }
            if !nums.insert(key_set.num) {
                bail!("Duplicate key set number {}", key_set.num);
            }
            if key_set.secret.is_empty() {
                bail!("Key set {} has an empty secret", key_set.num);
            }
        }
        if self.notifier.timeout_secs == 0 || self.notifier.timeout_secs > MAX_NOTIFY_TIMEOUT_SECS
        {
            bail!(
                "notifier.timeout_secs must be between 1 and {MAX_NOTIFY_TIMEOUT_SECS}, got {}",
                self.notifier.timeout_secs
            );
        }
        if self.notifier.max_concurrent == 0 {
            bail!("notifier.max_concurrent must be at least 1");
        }
        if !matches!(self.notifier.peer_scheme.as_str(), "http" | "https") {
            bail!(
                "notifier.peer_scheme must be http or https, got {}",
                self.notifier.peer_scheme
            );
        }
        Ok(())
    }

    /// Resolved database location.
    pub fn database_file(&self) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            self.config_dir.join(&self.database_path)
        }
    }

    /// Build the typed key lookup.
    pub fn key_ring(&self) -> KeyRing {
        let sets = self.key_sets.iter().map(|ks| SecretKeySet {
            num: ks.num,
            secret: ks.secret.clone(),
            domains: ks.domains.entries(),
            unknown_user: UnknownUserPolicy::parse(&ks.unknown_user),
        });
        KeyRing::new(sets, self.sync.domain_match)
    }
}
