pub mod keyring;
pub mod schema;

pub use keyring::{ConfigStore, KeyRing, SecretKeySet, UnknownUserPolicy};
pub use schema::{Config, DomainMatch, GatewayConfig, NotifierConfig};
