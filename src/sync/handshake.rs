//! Handshake validation: turn raw `ussync-*` query parameters into a trusted
//! [`SyncRequest`] or a terminal [`SyncError`].

use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

use super::codec;
use super::error::SyncError;
use super::identity::ClientIdentity;
use crate::config::keyring::domain_matches;
use crate::config::ConfigStore;

pub const PARAM_TOKEN: &str = "ussync-token";
pub const PARAM_ID: &str = "ussync-id";
pub const PARAM_REF: &str = "ussync-ref";
pub const PARAM_KEY: &str = "ussync-key";
pub const PARAM_STATUS: &str = "ussync-status";

/// Key set used when `ussync-key` is absent.
pub const DEFAULT_KEY_NUM: u32 = 1;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$",
    )
    .unwrap()
});

/// Value of `ussync-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// Absent: mirror a login.
    #[default]
    Login,
    /// `loggedin`: echo marker after a completed sync login.
    LoggedIn,
    /// `loggingout`: mirror a logout.
    LoggingOut,
}

impl SyncStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("loggedin") => Self::LoggedIn,
            Some("loggingout") => Self::LoggingOut,
            _ => Self::Login,
        }
    }

    /// Query value, if the status is sent explicitly.
    pub fn as_param(self) -> Option<&'static str> {
        match self {
            Self::Login => None,
            Self::LoggedIn => Some("loggedin"),
            Self::LoggingOut => Some("loggingout"),
        }
    }
}

/// Inbound query parameters the synchronizer looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncParams {
    #[serde(rename = "ussync-token")]
    pub token: Option<String>,
    #[serde(rename = "ussync-id")]
    pub id: Option<String>,
    #[serde(rename = "ussync-ref")]
    pub referer: Option<String>,
    #[serde(rename = "ussync-key")]
    pub key: Option<String>,
    #[serde(rename = "ussync-status")]
    pub status: Option<String>,
    pub redirect_to: Option<String>,
    pub action: Option<String>,
}

impl SyncParams {
    /// All three encrypted parameters are present.
    pub fn has_sync_tokens(&self) -> bool {
        self.token.is_some() && self.id.is_some() && self.referer.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::parse(self.status.as_deref())
    }

    /// `ussync-key`, defaulting to 1. Unparseable values select key set 0,
    /// which is never configured.
    pub fn key_num(&self) -> u32 {
        match self.key.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_KEY_NUM,
            Some(raw) => raw.parse().unwrap_or(0),
        }
    }

    pub fn is_logout_action(&self) -> bool {
        self.action.as_deref() == Some("logout")
    }
}

/// A decrypted request whose referer is a trusted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub user_login: String,
    pub user_email: String,
    pub referer_host: String,
    pub key_num: u32,
    pub status: SyncStatus,
}

/// Lowercase and trim; `None` when not a syntactically valid address.
pub fn sanitize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_ascii_lowercase();
    (email.len() <= 254 && EMAIL_PATTERN.is_match(&email)).then_some(email)
}

/// Decrypts and authenticates inbound sync parameters.
pub struct HandshakeValidator {
    config: Arc<dyn ConfigStore>,
}

impl HandshakeValidator {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    /// Decrypt `ussync-id`, `ussync-ref` and `ussync-token` with the key set's
    /// secret and the current request's identity, then gate on the referer.
    pub fn validate(
        &self,
        params: &SyncParams,
        identity: &ClientIdentity,
    ) -> Result<SyncRequest, SyncError> {
        let key_num = params.key_num();
        let (Some(token), Some(id), Some(referer)) = (
            params.token.as_deref(),
            params.id.as_deref(),
            params.referer.as_deref(),
        ) else {
            return Err(SyncError::Decode);
        };

        let Some(secret) = self.config.secret(key_num) else {
            tracing::warn!(key_num, "Sync request for an unconfigured key set");
            return Err(SyncError::UntrustedReferer);
        };

        let decrypt = |value: &str| codec::decrypt(value.trim(), secret, identity);
        let user_login = decrypt(id)?;
        let referer_host = decrypt(referer)?;
        let raw_email = decrypt(token)?;

        let user_email = sanitize_email(&raw_email).ok_or(SyncError::InvalidEmail)?;

        let mode = self.config.domain_match();
        let trusted = self
            .config
            .peer_domains(key_num)
            .is_some_and(|domains| domains.iter().any(|d| domain_matches(d, &referer_host, mode)));
        if !trusted {
            tracing::warn!(key_num, referer = %referer_host, "Sync request from untrusted host");
            return Err(SyncError::UntrustedReferer);
        }

        Ok(SyncRequest {
            user_login: user_login.trim().to_string(),
            user_email,
            referer_host: referer_host.trim().to_string(),
            key_num,
            status: params.status(),
        })
    }
}
