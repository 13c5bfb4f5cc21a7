//! Typed key-set lookup (the Config Store seen by the sync core).

use std::collections::BTreeMap;

use super::schema::DomainMatch;

/// What to do when a login arrives for an email with no local account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownUserPolicy {
    #[default]
    Reject,
    AutoRegisterSubscriber,
}

impl UnknownUserPolicy {
    /// `register_subscriber` (or its legacy misspelling) enables auto-registration;
    /// every other value rejects.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "register_subscriber" | "register_suscriber" => Self::AutoRegisterSubscriber,
            _ => Self::Reject,
        }
    }
}

/// A secret shared by a group of peer sites.
#[derive(Debug, Clone)]
pub struct SecretKeySet {
    pub num: u32,
    pub secret: String,
    /// Cleaned peer domains in declaration order.
    pub domains: Vec<String>,
    pub unknown_user: UnknownUserPolicy,
}

/// Read-only per-key-set configuration.
pub trait ConfigStore: Send + Sync {
    fn secret(&self, key_num: u32) -> Option<&str>;
    fn peer_domains(&self, key_num: u32) -> Option<&[String]>;
    fn unknown_user_policy(&self, key_num: u32) -> UnknownUserPolicy;
    /// Configured key numbers, ascending.
    fn key_nums(&self) -> Vec<u32>;
    fn domain_match(&self) -> DomainMatch;
}

/// Trim and drop trailing slashes from a configured domain entry.
pub fn clean_domain_entry(raw: &str) -> String {
    raw.trim().trim_end_matches('/').trim_end().to_string()
}

/// Remove a leading `http://` or `https://`.
pub fn strip_scheme(domain: &str) -> &str {
    domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(domain)
}

/// Form used to compare a peer against the current host when broadcasting.
pub fn bare_host(domain: &str) -> String {
    strip_scheme(&clean_domain_entry(domain)).to_string()
}

/// Does `referer` match `configured` under `mode`?
pub fn domain_matches(configured: &str, referer: &str, mode: DomainMatch) -> bool {
    let referer = clean_domain_entry(referer);
    match mode {
        DomainMatch::Exact => configured == referer,
        DomainMatch::Normalized => {
            strip_scheme(configured).eq_ignore_ascii_case(strip_scheme(&referer))
        }
    }
}

/// Key sets indexed by number.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    sets: BTreeMap<u32, SecretKeySet>,
    domain_match: DomainMatch,
}

impl KeyRing {
    pub fn new(sets: impl IntoIterator<Item = SecretKeySet>, domain_match: DomainMatch) -> Self {
        Self {
            sets: sets.into_iter().map(|s| (s.num, s)).collect(),
            domain_match,
        }
    }

    pub fn get(&self, key_num: u32) -> Option<&SecretKeySet> {
        self.sets.get(&key_num)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecretKeySet> {
        self.sets.values()
    }
}

impl ConfigStore for KeyRing {
    fn secret(&self, key_num: u32) -> Option<&str> {
        self.get(key_num).map(|s| s.secret.as_str())
    }

    fn peer_domains(&self, key_num: u32) -> Option<&[String]> {
        self.get(key_num).map(|s| s.domains.as_slice())
    }

    fn unknown_user_policy(&self, key_num: u32) -> UnknownUserPolicy {
        self.get(key_num).map(|s| s.unknown_user).unwrap_or_default()
    }

    fn key_nums(&self) -> Vec<u32> {
        self.sets.keys().copied().collect()
    }

    fn domain_match(&self) -> DomainMatch {
        self.domain_match
    }
}
