//! Cross-site session synchronization.
//!
//! A group of cooperating sites that share a secret key set mirror each
//! other's logins and logouts:
//!
//! - **Login** on one site renders hidden image beacons pointing at every
//!   peer. The browser fetches them, each peer decrypts the tokens with the
//!   same browser identity and logs the same email in locally.
//! - **Logout** on one site is pushed server-side to every peer with
//!   `ussync-status=loggingout`, replaying the browser identity as headers.
//!
//! Tokens are only readable by a request carrying the same `User-Agent` and
//! client IP they were minted for.

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod machine;

pub use broadcast::{beacon_html, BroadcastEmitter, BroadcastMode};
pub use error::{CodecError, SyncError};
pub use handshake::{HandshakeValidator, SyncParams, SyncRequest, SyncStatus};
pub use identity::ClientIdentity;
pub use machine::{AuthState, SessionSynchronizer, SyncOutcome};
