//! Session synchronizer: the login/logout state machine.
//!
//! One inbound request is resolved to exactly one terminal [`SyncOutcome`] or
//! [`SyncError`]. The decision itself ([`decide`]) is a pure function of the
//! local auth state, the request status and what the directory knows about the
//! target; side effects happen afterwards in [`SessionSynchronizer::apply`].

use std::sync::Arc;

use super::broadcast::BroadcastEmitter;
use super::error::SyncError;
use super::handshake::{HandshakeValidator, SyncParams, SyncRequest, SyncStatus, PARAM_STATUS};
use super::identity::ClientIdentity;
use crate::auth::{UserDirectory, UserRecord};
use crate::config::keyring::bare_host;
use crate::config::{ConfigStore, UnknownUserPolicy};
use crate::notify::NotifyReport;

/// Local authentication state for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    LoggedOut,
    LoggedIn(UserRecord),
}

impl AuthState {
    pub fn current_user(&self) -> Option<&UserRecord> {
        match self {
            Self::LoggedOut => None,
            Self::LoggedIn(user) => Some(user),
        }
    }
}

impl From<Option<UserRecord>> for AuthState {
    fn from(user: Option<UserRecord>) -> Self {
        user.map_or(Self::LoggedOut, Self::LoggedIn)
    }
}

/// What the directory knows about the account a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLookup {
    /// An account with the request's email exists.
    Found(UserRecord),
    /// No account, and none will be created.
    Missing,
    /// No account; the policy allows creating one and the login name is free.
    Registrable,
    /// No account; the policy allows creating one but another account owns the login.
    LoginTaken,
}

/// The single step a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Acknowledge,
    AlreadySynced,
    DestroySessions(UserRecord),
    Authenticate {
        target: UserRecord,
        replace: Option<UserRecord>,
    },
    RegisterThenAuthenticate {
        replace: Option<UserRecord>,
    },
    Reject(SyncError),
}

/// Map (auth state, request status, lookup outcome) to exactly one action.
pub fn decide(auth: &AuthState, request: &SyncRequest, lookup: TargetLookup) -> Action {
    match request.status {
        SyncStatus::LoggedIn => Action::Acknowledge,
        SyncStatus::LoggingOut => match lookup {
            TargetLookup::Found(user) => Action::DestroySessions(user),
            TargetLookup::Missing | TargetLookup::Registrable | TargetLookup::LoginTaken => {
                Action::Reject(SyncError::UserNotFound)
            }
        },
        SyncStatus::Login => {
            let current = auth.current_user();
            if current.is_some_and(|u| u.email.eq_ignore_ascii_case(&request.user_email)) {
                return Action::AlreadySynced;
            }
            let replace = current.cloned();
            match lookup {
                TargetLookup::Found(target) => Action::Authenticate { target, replace },
                TargetLookup::Registrable => Action::RegisterThenAuthenticate { replace },
                TargetLookup::Missing => Action::Reject(SyncError::UnknownUser),
                TargetLookup::LoginTaken => Action::Reject(SyncError::UsernameConflict),
            }
        }
    }
}

/// Successful terminal results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No synchronization parameters; the host application continues.
    PassThrough,
    /// `ussync-status=loggedin` echo.
    Acknowledged,
    /// Already logged in as the requested email.
    AlreadySynced,
    /// Every session of the named user was revoked.
    LoggedOut { user_id: String, sessions: u64 },
    /// A new session was issued; the browser should follow `redirect_to`.
    LoggedIn {
        user: UserRecord,
        session_token: String,
        created: bool,
        redirect_to: String,
    },
    /// Pass-through redirect for an already logged-in user.
    Redirect(String),
    /// Local logout finished and peers were notified.
    LocalLogout(NotifyReport),
}

impl SyncOutcome {
    /// Plain-text body for terminal outcomes that render one.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::Acknowledged => Some("User logged in!"),
            Self::AlreadySynced => Some("User already logged in..."),
            Self::LoggedOut { .. } => Some("User logged out..."),
            Self::LocalLogout(_) => Some("Logged out."),
            Self::PassThrough | Self::LoggedIn { .. } | Self::Redirect(_) => None,
        }
    }
}

/// Explicit service object; build once at startup and share.
pub struct SessionSynchronizer {
    validator: HandshakeValidator,
    config: Arc<dyn ConfigStore>,
    directory: Arc<dyn UserDirectory>,
    emitter: Arc<BroadcastEmitter>,
    site_url: String,
}

impl SessionSynchronizer {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        directory: Arc<dyn UserDirectory>,
        emitter: Arc<BroadcastEmitter>,
        site_url: &str,
    ) -> Self {
        Self {
            validator: HandshakeValidator::new(Arc::clone(&config)),
            config,
            directory,
            emitter,
            site_url: site_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn emitter(&self) -> &BroadcastEmitter {
        &self.emitter
    }

    /// Entry point for every inbound page request.
    pub async fn handle(
        &self,
        params: &SyncParams,
        identity: &ClientIdentity,
        auth: &AuthState,
    ) -> Result<SyncOutcome, SyncError> {
        if params.is_logout_action() {
            return Ok(self.logout_local(auth, identity).await);
        }
        if params.status() == SyncStatus::LoggedIn {
            return Ok(SyncOutcome::Acknowledged);
        }
        if let (Some(_), Some(target)) = (auth.current_user(), params.redirect_to.as_deref()) {
            if !params.has_sync_tokens() {
                return Ok(SyncOutcome::Redirect(self.safe_redirect(target)));
            }
        }
        if !params.has_sync_tokens() {
            return Ok(SyncOutcome::PassThrough);
        }

        let request = self.validator.validate(params, identity).inspect_err(|e| {
            tracing::info!(kind = e.kind(), "Sync request rejected during handshake");
        })?;
        self.apply(&request, auth)
    }

    /// Resolve what the directory knows about the request's target.
    fn lookup_target(&self, request: &SyncRequest) -> Result<TargetLookup, SyncError> {
        let by_email = self
            .directory
            .find_by_email(&request.user_email)
            .map_err(|e| {
                tracing::error!("User lookup failed: {e}");
                SyncError::Directory
            })?;
        if let Some(user) = by_email {
            return Ok(TargetLookup::Found(user));
        }
        if request.status != SyncStatus::Login
            || self.config.unknown_user_policy(request.key_num) != UnknownUserPolicy::AutoRegisterSubscriber
        {
            return Ok(TargetLookup::Missing);
        }

        let by_login = self
            .directory
            .find_by_login(&request.user_login)
            .map_err(|e| {
                tracing::error!("User lookup failed: {e}");
                SyncError::Directory
            })?;
        Ok(match by_login {
            Some(_) => TargetLookup::LoginTaken,
            None => TargetLookup::Registrable,
        })
    }

    /// Execute the state machine for a validated request.
    pub fn apply(&self, request: &SyncRequest, auth: &AuthState) -> Result<SyncOutcome, SyncError> {
        let lookup = match request.status {
            SyncStatus::LoggedIn => TargetLookup::Missing,
            _ => self.lookup_target(request)?,
        };

        let action = decide(auth, request, lookup);
        tracing::debug!(key_num = request.key_num, ?action, "Sync action selected");

        match action {
            Action::Acknowledge => Ok(SyncOutcome::Acknowledged),
            Action::AlreadySynced => Ok(SyncOutcome::AlreadySynced),
            Action::Reject(err) => {
                tracing::info!(key_num = request.key_num, kind = err.kind(), "Sync request rejected");
                Err(err)
            }
            Action::DestroySessions(user) => {
                let sessions = self.directory.destroy_all_sessions(&user.id).map_err(|e| {
                    tracing::error!(user_id = %user.id, "Failed to destroy sessions: {e}");
                    SyncError::Directory
                })?;
                tracing::info!(user_id = %user.id, sessions, referer = %request.referer_host, "Mirrored logout");
                Ok(SyncOutcome::LoggedOut {
                    user_id: user.id,
                    sessions,
                })
            }
            Action::Authenticate { target, replace } => {
                self.authenticate(target, replace.as_ref(), false, request)
            }
            Action::RegisterThenAuthenticate { replace } => {
                let created = self
                    .directory
                    .create_user(&request.user_login, &request.user_email, true)
                    .map_err(|e| {
                        tracing::warn!(key_num = request.key_num, "Auto-registration failed: {e}");
                        SyncError::RegistrationFailed
                    })?;
                tracing::info!(user_id = %created.id, referer = %request.referer_host, "Registered mirrored user");
                self.authenticate(created, replace.as_ref(), true, request)
            }
        }
    }

    fn authenticate(
        &self,
        target: UserRecord,
        replace: Option<&UserRecord>,
        created: bool,
        request: &SyncRequest,
    ) -> Result<SyncOutcome, SyncError> {
        if let Some(current) = replace {
            self.directory.destroy_all_sessions(&current.id).map_err(|e| {
                tracing::error!(user_id = %current.id, "Failed to end current session: {e}");
                SyncError::LoginFailed
            })?;
        }

        let session_token = self.directory.set_current_session(&target.id).map_err(|e| {
            tracing::error!(user_id = %target.id, "Failed to issue session: {e}");
            SyncError::LoginFailed
        })?;

        tracing::info!(
            user_id = %target.id,
            key_num = request.key_num,
            referer = %request.referer_host,
            replaced = replace.is_some(),
            created,
            "Mirrored login"
        );

        Ok(SyncOutcome::LoggedIn {
            user: target,
            session_token,
            created,
            redirect_to: format!(
                "{}/?{PARAM_STATUS}={}",
                self.site_url,
                SyncStatus::LoggedIn.as_param().unwrap_or("loggedin")
            ),
        })
    }

    /// Local logout: revoke the user's sessions, then tell every peer.
    pub async fn logout_local(&self, auth: &AuthState, identity: &ClientIdentity) -> SyncOutcome {
        let Some(user) = auth.current_user() else {
            return SyncOutcome::PassThrough;
        };

        if let Err(e) = self.directory.destroy_all_sessions(&user.id) {
            tracing::error!(user_id = %user.id, "Failed to destroy local sessions: {e}");
        }
        SyncOutcome::LocalLogout(self.emitter.broadcast_logout(user, identity).await)
    }

    /// Beacon URLs to render for a page view, if this view should broadcast.
    pub fn passive_beacons(
        &self,
        auth: &AuthState,
        params: &SyncParams,
        identity: &ClientIdentity,
    ) -> Vec<String> {
        match auth.current_user() {
            Some(user) if user.email_verified && params.token.is_none() => {
                self.emitter.passive_urls(user, identity)
            }
            _ => Vec::new(),
        }
    }

    /// `site_url` with a trailing slash.
    pub fn site_root(&self) -> String {
        format!("{}/", self.site_url)
    }

    /// Accept relative same-site paths and absolute URLs to this site or a
    /// configured peer; anything else falls back to the site root.
    pub fn safe_redirect(&self, target: &str) -> String {
        let fallback = self.site_root();
        let target = target.trim();

        // Browsers drop tab/CR/LF while parsing, so "/\t/host" would become "//host".
        if target.chars().any(|c| c.is_ascii_control() || c == '\\') {
            tracing::warn!("Refused redirect with control characters or backslashes");
            return fallback;
        }

        if target.starts_with('/') {
            return if target.starts_with("//") { fallback } else { target.to_string() };
        }

        let Some(rest) = target
            .strip_prefix("https://")
            .or_else(|| target.strip_prefix("http://"))
        else {
            return fallback;
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() || authority.contains(['@', '\\']) {
            return fallback;
        }
        let host = authority.split(':').next().unwrap_or_default();

        let own = bare_host(&self.site_url);
        let own_host = own.split(':').next().unwrap_or_default();
        let allowed = host.eq_ignore_ascii_case(own_host)
            || self.config.key_nums().into_iter().any(|n| {
                self.config.peer_domains(n).is_some_and(|domains| {
                    domains.iter().any(|d| {
                        let peer = bare_host(d);
                        peer.split(':').next().unwrap_or_default().eq_ignore_ascii_case(host)
                    })
                })
            });

        if allowed {
            target.to_string()
        } else {
            tracing::warn!("Refused off-site redirect");
            fallback
        }
    }
}
