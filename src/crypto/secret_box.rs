//! Versioned AES-256-GCM box.
//!
//! # Wire Format
//!
//! ```text
//! +---------+----------------+---------------------------+
//! | version | nonce (12 B)   | ciphertext || tag (16 B)  |
//! +---------+----------------+---------------------------+
//!   byte 0    bytes [1, 13)    bytes [13, ..)
//! ```
//!
//! The version byte is always [`BOX_VERSION`]. The context passed to
//! [`SecretBox::seal`] is bound as associated data: it is not stored in the
//! box, and opening with a different context fails.

use std::fmt;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::CryptoError;

/// Current box format version
pub const BOX_VERSION: u8 = 1;

/// AES-256 key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length (12 bytes)
pub const NONCE_LEN: usize = 12;

/// AES-GCM auth tag length (16 bytes)
pub const TAG_LEN: usize = 16;

/// Version byte plus nonce
pub const HEADER_LEN: usize = 1 + NONCE_LEN;

/// Smallest well-formed box: header plus tag of an empty plaintext
pub const MIN_BOX_LEN: usize = HEADER_LEN + TAG_LEN;

/// Authenticated encryption with a bound context.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Build a box from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey { len: key.len() });
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey { len: key.len() })?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` under a fresh random nonce, binding `context`.
    pub fn seal(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.push(BOX_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a box produced by [`seal`](Self::seal).
    ///
    /// Wrong key, wrong context, tampering, unknown version and truncation all
    /// yield the same [`CryptoError::AuthenticationFailed`].
    pub fn open(&self, sealed: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < MIN_BOX_LEN || sealed[0] != BOX_VERSION {
            return Err(CryptoError::AuthenticationFailed);
        }

        let nonce = &sealed[1..HEADER_LEN];
        let ciphertext = &sealed[HEADER_LEN..];

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Seal an integer as 8 big-endian bytes.
    pub fn seal_i64(&self, value: i64, context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal(&value.to_be_bytes(), context)
    }

    /// Open a box sealed by [`seal_i64`](Self::seal_i64).
    pub fn open_i64(&self, sealed: &[u8], context: &[u8]) -> Result<i64, CryptoError> {
        let plaintext = self.open(sealed, context)?;
        let bytes: [u8; 8] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(i64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBox { .. }")
    }
}
