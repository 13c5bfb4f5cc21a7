//! Client identity bound into every token IV.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Header consulted first when resolving the client IP.
pub const CLIENT_IP_HEADER: &str = "Client-IP";

/// Header consulted second when resolving the client IP.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// User-agent and client IP of the browser a token is minted for.
///
/// Encryption and decryption must see the same pair. A token minted during a
/// page render is decrypted by the peer with the headers of the browser's own
/// follow-up request; a token minted for an outbound logout call is decrypted
/// with whatever the origin server sent, which is why the notifier replays this
/// identity as request headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub ip: String,
}

impl ClientIdentity {
    pub fn new(user_agent: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ip: ip.into(),
        }
    }

    /// Resolve from request headers: `Client-IP`, then `X-Forwarded-For` (raw
    /// value), then the TCP peer address.
    pub fn from_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let header_value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };

        let ip = header_value(CLIENT_IP_HEADER)
            .or_else(|| header_value(FORWARDED_FOR_HEADER))
            .or_else(|| peer.map(|addr| addr.to_string()))
            .unwrap_or_default();

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        Self { user_agent, ip }
    }
}
