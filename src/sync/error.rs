//! Error kinds for the synchronization handshake and state machine.
//!
//! Every variant is terminal for the current request: the gateway turns it into a
//! short plain-text message and stops. None of them ever carries decrypted token
//! contents.

use thiserror::Error;

/// Token codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The configured secret is empty.
    #[error("secret key is empty")]
    EmptySecret,

    /// Cipher construction failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Malformed token, bad padding or non-UTF-8 plaintext.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Terminal outcomes of a rejected synchronization request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Decrypted email is not a syntactically valid address.
    #[error("invalid email")]
    InvalidEmail,

    /// Decrypted referer is not in the peer-domain set of the key set.
    #[error("referer is not a trusted peer")]
    UntrustedReferer,

    /// Logout requested for an email with no local account.
    #[error("user not found")]
    UserNotFound,

    /// Login requested for an unknown email while the policy rejects unknown users.
    #[error("unknown user")]
    UnknownUser,

    /// Auto-registration blocked because another account owns the login name.
    #[error("username already taken by another account")]
    UsernameConflict,

    /// A token failed to decode or decrypt.
    #[error("malformed synchronization token")]
    Decode,

    /// The user directory refused to create the account.
    #[error("user registration failed")]
    RegistrationFailed,

    /// The user directory failed while authenticating.
    #[error("login failed")]
    LoginFailed,

    /// The user directory could not be queried.
    #[error("user directory unavailable")]
    Directory,
}

impl SyncError {
    /// Short user-visible message for the response body.
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "Invalid email...",
            Self::UntrustedReferer => "Host not allowed to synchronize...",
            Self::UserNotFound => "Error logging out...",
            Self::UnknownUser => "This user doesn't exist...",
            Self::UsernameConflict => "User name already exists!",
            Self::Decode => "Invalid synchronization token...",
            Self::RegistrationFailed => "Error creating a new user!",
            Self::LoginFailed => "Error logging in...",
            Self::Directory => "Error synchronizing session...",
        }
    }

    /// Stable machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "invalid_email",
            Self::UntrustedReferer => "untrusted_referer",
            Self::UserNotFound => "user_not_found",
            Self::UnknownUser => "unknown_user",
            Self::UsernameConflict => "username_conflict",
            Self::Decode => "decode_error",
            Self::RegistrationFailed => "registration_failed",
            Self::LoginFailed => "login_failed",
            Self::Directory => "directory_error",
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(_: CodecError) -> Self {
        Self::Decode
    }
}
