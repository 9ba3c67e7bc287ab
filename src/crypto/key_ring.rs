//! Active key material.
//!
//! A [`KeyRing`] holds exactly one hash key and one encryption key, each
//! tagged with a [`KeyId`]. It is a cheap handle: clones share the same
//! active pair, and [`KeyRing::configure`] swaps both keys at once.
//!
//! Readers take a [`KeyMaterial`] snapshot via [`KeyRing::active`] and use it
//! for the whole operation, so a concurrent reconfiguration never mixes a
//! hash under one key id with a ciphertext under another.
//!
//! # Rotation
//!
//! Only one pair is resident. Data written under a previous key id stays
//! tagged with that id and cannot be read until the ring is configured back
//! to the historical key.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use zeroize::Zeroizing;

use super::{CryptoError, IdentityHasher, SecretBox};
use crate::types::KeyId;

/// One configured hash key + encryption key pair.
pub struct KeyMaterial {
    hash_key: Zeroizing<Vec<u8>>,
    hash_key_id: KeyId,
    secret_box: SecretBox,
    enc_key_id: KeyId,
}

impl KeyMaterial {
    /// Validate and build a key pair.
    pub fn new(
        hash_key: &[u8],
        hash_key_id: KeyId,
        enc_key: &[u8],
        enc_key_id: KeyId,
    ) -> Result<Self, CryptoError> {
        if hash_key.is_empty() {
            return Err(CryptoError::EmptyHashKey);
        }
        let secret_box = SecretBox::new(enc_key)?;

        Ok(Self {
            hash_key: Zeroizing::new(hash_key.to_vec()),
            hash_key_id,
            secret_box,
            enc_key_id,
        })
    }

    pub fn hash_key(&self) -> &[u8] {
        &self.hash_key
    }

    pub fn hash_key_id(&self) -> KeyId {
        self.hash_key_id
    }

    pub fn secret_box(&self) -> &SecretBox {
        &self.secret_box
    }

    pub fn enc_key_id(&self) -> KeyId {
        self.enc_key_id
    }

    /// Hasher bound to this snapshot's hash key.
    pub fn hasher(&self) -> IdentityHasher<'_> {
        IdentityHasher::new(&self.hash_key, self.hash_key_id)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("hash_key", &"<redacted>")
            .field("hash_key_id", &self.hash_key_id)
            .field("enc_key", &"<redacted>")
            .field("enc_key_id", &self.enc_key_id)
            .finish()
    }
}

/// Shared handle to the active key pair.
#[derive(Clone, Default)]
pub struct KeyRing {
    active: Arc<RwLock<Option<Arc<KeyMaterial>>>>,
}

impl KeyRing {
    /// An empty ring. [`has_keys`](Self::has_keys) is false until configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// A ring configured with the given pair.
    pub fn with_keys(
        hash_key: &[u8],
        hash_key_id: KeyId,
        enc_key: &[u8],
        enc_key_id: KeyId,
    ) -> Result<Self, CryptoError> {
        let ring = Self::new();
        ring.configure(hash_key, hash_key_id, enc_key, enc_key_id)?;
        Ok(ring)
    }

    /// Replace both active keys. On error the previous pair stays active.
    pub fn configure(
        &self,
        hash_key: &[u8],
        hash_key_id: KeyId,
        enc_key: &[u8],
        enc_key_id: KeyId,
    ) -> Result<(), CryptoError> {
        let material = KeyMaterial::new(hash_key, hash_key_id, enc_key, enc_key_id)?;

        // The slot only ever holds a complete pair, so a poisoned lock is safe to reuse.
        let mut slot = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(material));
        Ok(())
    }

    pub fn has_keys(&self) -> bool {
        self.active().is_some()
    }

    /// Snapshot of the active pair, if any.
    pub fn active(&self) -> Option<Arc<KeyMaterial>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn hash_key_id(&self) -> Option<KeyId> {
        self.active().map(|m| m.hash_key_id())
    }

    pub fn enc_key_id(&self) -> Option<KeyId> {
        self.active().map(|m| m.enc_key_id())
    }

    /// Active SecretBox, if configured.
    pub fn secret_box(&self) -> Option<SecretBox> {
        self.active().map(|m| m.secret_box().clone())
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("hash_key_id", &self.hash_key_id())
            .field("enc_key_id", &self.enc_key_id())
            .finish()
    }
}
