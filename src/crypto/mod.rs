//! Cryptographic primitives for identity privacy.
//!
//! # Algorithms
//!
//! - **Encryption**: AES-256-GCM (authenticated encryption, 12-byte nonce,
//!   16-byte tag) wrapped in a versioned box, see [`secret_box`]
//! - **Identity hashing**: HMAC-SHA256 over `transport|external_id`, see
//!   [`identity_hash`]
//!
//! # Key Handling
//!
//! Key material lives only in a [`KeyRing`], is never written to storage, and
//! is zeroized when the ring drops it.

pub mod identity_hash;
pub mod key_ring;
pub mod secret_box;

use thiserror::Error;

pub use identity_hash::{keyed_hash, IdentityHasher};
pub use key_ring::{KeyMaterial, KeyRing};
pub use secret_box::{SecretBox, BOX_VERSION, HEADER_LEN, KEY_LEN, MIN_BOX_LEN, NONCE_LEN, TAG_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes, got {len}")]
    InvalidKey { len: usize },

    #[error("hash key must not be empty")]
    EmptyHashKey,

    /// Carries no detail about the cause.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("encryption failed")]
    Encryption,
}
