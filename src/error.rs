//! Error types for identity-vault
//!
//! Every variant carries the name of the operation that failed so a log line
//! is enough to locate the failing step. None of these messages are meant for
//! end users; see [`IdentityError::user_message`].

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::types::{KeyId, UserId};

/// Generic text shown to end users for any failure of this layer.
pub const USER_RETRY_MESSAGE: &str = "Something went wrong, please try again later.";

#[derive(Error, Debug)]
pub enum IdentityError {
    /// Missing or invalid key material. Fatal at startup.
    #[error("{op}: configuration error: {reason}")]
    Configuration { op: &'static str, reason: String },

    /// Stored data was written under a key id the ring does not hold.
    #[error("{op}: data sealed under key id {stored}, active key id is {active}")]
    KeyMismatch {
        op: &'static str,
        stored: KeyId,
        active: KeyId,
    },

    /// Empty transport or external id. Rejected before any I/O.
    #[error("{op}: invalid input: {reason}")]
    Input { op: &'static str, reason: &'static str },

    /// AEAD tag mismatch or malformed box. Never says which.
    #[error("{op}: authentication failed")]
    AuthenticationFailed { op: &'static str },

    /// Transaction or connection failure.
    #[error("{op}: storage error: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// The caller's deadline passed; the transaction was rolled back.
    #[error("{op}: deadline exceeded")]
    Cancelled { op: &'static str },

    /// Uniqueness of identity bindings is not enforced by storage.
    #[error("{op}: invariant violated: {detail}")]
    InvariantViolation { op: &'static str, detail: String },
}

impl IdentityError {
    pub fn storage(op: &'static str, source: impl Into<StoreError>) -> Self {
        Self::Storage {
            op,
            source: source.into(),
        }
    }

    pub fn input(op: &'static str, reason: &'static str) -> Self {
        Self::Input { op, reason }
    }

    pub fn configuration(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            op,
            reason: reason.into(),
        }
    }

    /// Map a crypto-layer failure into the taxonomy.
    pub fn from_crypto(op: &'static str, err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => Self::AuthenticationFailed { op },
            other => Self::Configuration {
                op,
                reason: other.to_string(),
            },
        }
    }

    /// The operation name attached to this error.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Configuration { op, .. }
            | Self::KeyMismatch { op, .. }
            | Self::Input { op, .. }
            | Self::AuthenticationFailed { op }
            | Self::Storage { op, .. }
            | Self::Cancelled { op }
            | Self::InvariantViolation { op, .. } => *op,
        }
    }

    /// Only storage failures and expired deadlines are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Cancelled { .. })
    }

    /// What an end user gets to see, whatever went wrong.
    pub fn user_message(&self) -> &'static str {
        USER_RETRY_MESSAGE
    }
}

/// Failures of a storage backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("No such user: {0}")]
    UnknownUser(UserId),

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Timed out waiting for a conflicting transaction")]
    LockTimeout,
}

pub type Result<T, E = IdentityError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        let storage = IdentityError::storage("resolve", StoreError::Schema("boom".into()));
        assert!(storage.is_retryable());
        assert!(IdentityError::Cancelled { op: "resolve" }.is_retryable());

        assert!(!IdentityError::input("resolve", "empty transport").is_retryable());
        assert!(!IdentityError::AuthenticationFailed { op: "open" }.is_retryable());
        assert!(!IdentityError::InvariantViolation {
            op: "resolve",
            detail: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_messages_carry_operation() {
        let err = IdentityError::storage("resolve.bind_identity", StoreError::TransactionFinished);
        assert_eq!(err.op(), "resolve.bind_identity");
        assert!(err.to_string().starts_with("resolve.bind_identity: storage error"));
    }

    #[test]
    fn test_user_message_is_generic() {
        let err = IdentityError::from_crypto("open", CryptoError::AuthenticationFailed);
        assert!(matches!(err, IdentityError::AuthenticationFailed { op: "open" }));
        assert_eq!(err.user_message(), USER_RETRY_MESSAGE);
        assert!(!err.user_message().contains("authentication"));
    }

    #[test]
    fn test_invalid_key_maps_to_configuration() {
        let err = IdentityError::from_crypto("configure", CryptoError::InvalidKey { len: 7 });
        assert!(matches!(err, IdentityError::Configuration { .. }));
    }
}
