//! Transport-bound keyed hashing of external identifiers.
//!
//! `hash = HMAC-SHA256(key, transport || "|" || external_id)`
//!
//! Including the transport means the same id on two platforms never maps to
//! the same row, so identities cannot be correlated across platforms.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::{IdentityHash, KeyId, IDENTITY_HASH_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Separator between transport and external id in the hashed payload
pub const SEPARATOR: &str = "|";

/// HMAC-SHA256 of `transport|external_id` under `key`.
pub fn keyed_hash(key: &[u8], transport: &str, external_id: &str) -> [u8; IDENTITY_HASH_LEN] {
    // HMAC takes keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(transport.as_bytes());
    mac.update(SEPARATOR.as_bytes());
    mac.update(external_id.as_bytes());

    let mut out = [0u8; IDENTITY_HASH_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Hasher bound to one hash key.
#[derive(Clone, Copy)]
pub struct IdentityHasher<'a> {
    key: &'a [u8],
    key_id: KeyId,
}

impl<'a> IdentityHasher<'a> {
    pub fn new(key: &'a [u8], key_id: KeyId) -> Self {
        Self { key, key_id }
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Raw 32-byte hash.
    pub fn hash(&self, transport: &str, external_id: &str) -> [u8; IDENTITY_HASH_LEN] {
        keyed_hash(self.key, transport, external_id)
    }

    /// Hash tagged with its transport and key id, ready for lookup.
    pub fn identity(&self, transport: &str, external_id: &str) -> IdentityHash {
        IdentityHash {
            transport: transport.to_string(),
            hash: self.hash(transport, external_id),
            hash_key_id: self.key_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_deterministic() {
        let hasher = IdentityHasher::new(KEY, KeyId(1));
        assert_eq!(hasher.hash("telegram", "42"), hasher.hash("telegram", "42"));
        assert_eq!(
            hasher.identity("telegram", "42"),
            hasher.identity("telegram", "42")
        );
    }

    #[test]
    fn test_transport_binding() {
        let hasher = IdentityHasher::new(KEY, KeyId(1));
        assert_ne!(hasher.hash("telegram", "42"), hasher.hash("other", "42"));
    }

    #[test]
    fn test_separator_prevents_shifted_collisions() {
        let hasher = IdentityHasher::new(KEY, KeyId(1));
        // "tele|gram42" vs "telegram|42" hash different payloads
        assert_ne!(hasher.hash("tele", "gram42"), hasher.hash("telegram", "42"));
    }

    #[test]
    fn test_key_dependence() {
        let a = IdentityHasher::new(KEY, KeyId(1));
        let b = IdentityHasher::new(b"another-key", KeyId(1));
        assert_ne!(a.hash("telegram", "42"), b.hash("telegram", "42"));
    }

    #[test]
    fn test_matches_plain_hmac() {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(KEY).unwrap();
        mac.update(b"telegram|1001");
        let expected = mac.finalize().into_bytes();

        assert_eq!(keyed_hash(KEY, "telegram", "1001").as_slice(), expected.as_slice());
    }

    #[test]
    fn test_identity_carries_key_id() {
        let identity = IdentityHasher::new(KEY, KeyId(7)).identity("telegram", "42");
        assert_eq!(identity.hash_key_id, KeyId(7));
        assert_eq!(identity.transport, "telegram");
        assert!(!format!("{identity:?}").contains(&hex::encode(identity.hash)));
    }
}
