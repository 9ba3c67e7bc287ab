//! Shared value types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal surrogate user id, independent of any external platform id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version tag of the key that produced a hash or a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub i16);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length of an identity hash (HMAC-SHA256 output).
pub const IDENTITY_HASH_LEN: usize = 32;

/// Keyed, transport-bound hash of an external identifier.
///
/// This is what gets stored in place of the external id. It cannot be
/// reversed, and `Debug` prints only a short prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdentityHash {
    pub transport: String,
    pub hash: [u8; IDENTITY_HASH_LEN],
    pub hash_key_id: KeyId,
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityHash")
            .field("transport", &self.transport)
            .field("hash", &format_args!("{}..", hex::encode(&self.hash[..4])))
            .field("hash_key_id", &self.hash_key_id)
            .finish()
    }
}

/// Sealed secondary attribute row, one per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedAttribute {
    pub user_id: UserId,
    pub ciphertext: Vec<u8>,
    pub enc_key_id: KeyId,
    pub updated_at: DateTime<Utc>,
}

/// Row counts of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub users: u64,
    pub identities: u64,
    pub attributes: u64,
}
