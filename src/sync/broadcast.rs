//! Broadcast emitter: tell every peer site about a local login or logout.
//!
//! Login is passive: the page renders hidden images whose URLs carry the tokens,
//! and the browser fetches them with its own headers and cookies. Logout is
//! active: this server calls each peer directly, replaying the browser identity
//! the tokens were minted for.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::codec;
use super::error::CodecError;
use super::handshake::{SyncStatus, PARAM_ID, PARAM_KEY, PARAM_REF, PARAM_STATUS, PARAM_TOKEN};
use super::identity::ClientIdentity;
use crate::auth::UserRecord;
use crate::config::keyring::bare_host;
use crate::config::ConfigStore;
use crate::notify::{Notifier, NotifyReport, PeerRequest};

/// How a broadcast reaches the peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// Browser-fetched image beacons (login mirroring).
    Passive,
    /// Direct server-side GETs with `ussync-status=loggingout`.
    Active,
}

pub struct BroadcastEmitter {
    config: Arc<dyn ConfigStore>,
    notifier: Arc<dyn Notifier>,
    /// This site's host without scheme or trailing slash; sent as the referer.
    site_host: String,
    peer_scheme: String,
}

impl BroadcastEmitter {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        notifier: Arc<dyn Notifier>,
        site_url: &str,
        peer_scheme: &str,
    ) -> Self {
        Self {
            config,
            notifier,
            site_host: bare_host(site_url),
            peer_scheme: peer_scheme.to_string(),
        }
    }

    pub fn site_host(&self) -> &str {
        &self.site_host
    }

    /// Notification requests for every peer of every key set, skipping this site.
    pub fn peer_requests(
        &self,
        user: &UserRecord,
        identity: &ClientIdentity,
        mode: BroadcastMode,
    ) -> Vec<PeerRequest> {
        let timestamp = chrono::Utc::now().timestamp();
        let status = match mode {
            BroadcastMode::Passive => None,
            BroadcastMode::Active => SyncStatus::LoggingOut.as_param(),
        };

        let mut requests = Vec::new();
        for key_num in self.config.key_nums() {
            let (Some(secret), Some(domains)) =
                (self.config.secret(key_num), self.config.peer_domains(key_num))
            else {
                continue;
            };

            let (email_token, login_token, ref_token) = match self.mint_tokens(user, secret, identity)
            {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::warn!(key_num, "Skipping key set in broadcast: {e}");
                    continue;
                }
            };

            let mut seen = BTreeSet::new();
            for domain in domains {
                let peer = bare_host(domain);
                if peer.is_empty() || peer == self.site_host || !seen.insert(peer.clone()) {
                    continue;
                }

                let mut url = format!(
                    "{scheme}://{peer}/?{PARAM_TOKEN}={email}&{PARAM_KEY}={key_num}&{PARAM_ID}={login}&{PARAM_REF}={referer}",
                    scheme = self.peer_scheme,
                    email = urlencoding::encode(&email_token),
                    login = urlencoding::encode(&login_token),
                    referer = urlencoding::encode(&ref_token),
                );
                if let Some(status) = status {
                    url.push_str(&format!("&{PARAM_STATUS}={status}"));
                }
                url.push_str(&format!("&_={timestamp}"));

                requests.push(PeerRequest {
                    url,
                    identity: identity.clone(),
                });
            }
        }
        requests
    }

    /// Encrypted email, login and referer for one key set.
    fn mint_tokens(
        &self,
        user: &UserRecord,
        secret: &str,
        identity: &ClientIdentity,
    ) -> Result<(String, String, String), CodecError> {
        Ok((
            codec::encrypt(&user.email, secret, identity)?,
            codec::encrypt(&user.login, secret, identity)?,
            codec::encrypt(&self.site_host, secret, identity)?,
        ))
    }

    /// Beacon URLs for a page render.
    pub fn passive_urls(&self, user: &UserRecord, identity: &ClientIdentity) -> Vec<String> {
        self.peer_requests(user, identity, BroadcastMode::Passive)
            .into_iter()
            .map(|r| r.url)
            .collect()
    }

    /// Call every peer with a logout notification. Never fails; delivery
    /// problems are logged by the notifier.
    pub async fn broadcast_logout(
        &self,
        user: &UserRecord,
        identity: &ClientIdentity,
    ) -> NotifyReport {
        let requests = self.peer_requests(user, identity, BroadcastMode::Active);
        if requests.is_empty() {
            return NotifyReport::default();
        }
        let peers = requests.len();
        let report = self.notifier.notify(requests).await;
        tracing::info!(
            peers,
            delivered = report.delivered,
            failed = report.failed,
            "Logout broadcast finished"
        );
        report
    }
}

/// Hidden image tags for passive notification.
pub fn beacon_html(urls: &[String]) -> String {
    urls.iter()
        .map(|url| {
            format!(
                "<img class=\"ussync\" src=\"{}\" style=\"display:none;width:0;height:0;\">",
                url.replace('&', "&amp;").replace('"', "&quot;")
            )
        })
        .collect()
}
