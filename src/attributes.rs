//! Encrypted per-user attributes (e.g. the chat id of a user).
//!
//! Each user has at most one sealed attribute row. Writes overwrite the
//! ciphertext, the key id and the timestamp; no history is kept. The context
//! bound into the box is usually the lowercased transport name, which scopes
//! a ciphertext to one usage domain.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::crypto::KeyMaterial;
use crate::db::IdentityStore;
use crate::deadline::Deadline;
use crate::error::{IdentityError, Result};
use crate::types::{EncryptedAttribute, UserId};

/// Seal `plaintext` for `user_id` under the snapshot's encryption key.
pub fn seal_attribute(
    material: &KeyMaterial,
    user_id: UserId,
    plaintext: &[u8],
    context: &str,
) -> Result<EncryptedAttribute> {
    let ciphertext = material
        .secret_box()
        .seal(plaintext, context.as_bytes())
        .map_err(|e| IdentityError::from_crypto("seal_attribute", e))?;

    Ok(EncryptedAttribute {
        user_id,
        ciphertext,
        enc_key_id: material.enc_key_id(),
        updated_at: Utc::now(),
    })
}

/// Open a stored attribute. The row must carry the snapshot's key id.
pub fn open_attribute(
    material: &KeyMaterial,
    attribute: &EncryptedAttribute,
    context: &str,
) -> Result<Vec<u8>> {
    if attribute.enc_key_id != material.enc_key_id() {
        return Err(IdentityError::KeyMismatch {
            op: "open_attribute",
            stored: attribute.enc_key_id,
            active: material.enc_key_id(),
        });
    }

    material
        .secret_box()
        .open(&attribute.ciphertext, context.as_bytes())
        .map_err(|e| IdentityError::from_crypto("open_attribute", e))
}

fn decode_i64(op: &'static str, plaintext: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = plaintext
        .try_into()
        .map_err(|_| IdentityError::AuthenticationFailed { op })?;
    Ok(i64::from_be_bytes(bytes))
}

fn check_user_id(op: &'static str, user_id: UserId) -> Result<()> {
    if user_id.0 <= 0 {
        return Err(IdentityError::input(op, "user id must be positive"));
    }
    Ok(())
}

/// Reads and writes sealed attributes through a store.
#[derive(Clone)]
pub struct EncryptedAttributeStore {
    store: Arc<dyn IdentityStore>,
    ring: crate::crypto::KeyRing,
}

impl EncryptedAttributeStore {
    pub fn new(store: Arc<dyn IdentityStore>, ring: crate::crypto::KeyRing) -> Self {
        Self { store, ring }
    }

    fn material(&self, op: &'static str) -> Result<Arc<KeyMaterial>> {
        self.ring
            .active()
            .ok_or_else(|| IdentityError::configuration(op, "key ring has no active keys"))
    }

    /// Seal `plaintext` and upsert it as the attribute of `user_id`.
    pub fn upsert_encrypted(
        &self,
        user_id: UserId,
        plaintext: &[u8],
        context: &str,
        deadline: Deadline,
    ) -> Result<()> {
        const OP: &str = "upsert_encrypted";
        check_user_id(OP, user_id)?;
        let material = self.material(OP)?;
        let attribute = seal_attribute(&material, user_id, plaintext, context)?;

        deadline.check(OP)?;
        let mut tx = self
            .store
            .begin(deadline)
            .map_err(|e| IdentityError::storage("upsert_encrypted.begin", e))?;

        deadline.check(OP)?;
        tx.upsert_attribute(&attribute)
            .map_err(|e| IdentityError::storage("upsert_encrypted.upsert", e))?;

        deadline.check(OP)?;
        tx.commit()
            .map_err(|e| IdentityError::storage("upsert_encrypted.commit", e))?;

        debug!(
            user_id = %user_id,
            enc_key_id = %attribute.enc_key_id,
            "Stored encrypted attribute"
        );
        Ok(())
    }

    /// Load and open the attribute of `user_id`, `None` if there is none.
    pub fn read_encrypted(
        &self,
        user_id: UserId,
        context: &str,
        deadline: Deadline,
    ) -> Result<Option<Vec<u8>>> {
        const OP: &str = "read_encrypted";
        check_user_id(OP, user_id)?;
        let material = self.material(OP)?;

        deadline.check(OP)?;
        let mut tx = self
            .store
            .begin(deadline)
            .map_err(|e| IdentityError::storage("read_encrypted.begin", e))?;

        deadline.check(OP)?;
        let attribute = tx
            .load_attribute(user_id)
            .map_err(|e| IdentityError::storage("read_encrypted.load", e))?;
        tx.commit()
            .map_err(|e| IdentityError::storage("read_encrypted.commit", e))?;

        attribute
            .map(|attribute| open_attribute(&material, &attribute, context))
            .transpose()
    }

    /// Store an integer attribute as 8 big-endian bytes.
    pub fn upsert_i64(
        &self,
        user_id: UserId,
        value: i64,
        context: &str,
        deadline: Deadline,
    ) -> Result<()> {
        self.upsert_encrypted(user_id, &value.to_be_bytes(), context, deadline)
    }

    pub fn read_i64(
        &self,
        user_id: UserId,
        context: &str,
        deadline: Deadline,
    ) -> Result<Option<i64>> {
        self.read_encrypted(user_id, context, deadline)?
            .map(|plaintext| decode_i64("read_i64", &plaintext))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyRing, KEY_LEN};
    use crate::db::MemoryStore;
    use crate::types::KeyId;

    fn setup() -> (Arc<MemoryStore>, KeyRing, EncryptedAttributeStore, UserId) {
        let store = Arc::new(MemoryStore::new());
        let ring = KeyRing::with_keys(b"hash-key", KeyId(1), &[3u8; KEY_LEN], KeyId(1)).unwrap();
        let attributes = EncryptedAttributeStore::new(store.clone(), ring.clone());

        let mut tx = store.begin(Deadline::none()).unwrap();
        let user = tx.create_user().unwrap();
        tx.commit().unwrap();

        (store, ring, attributes, user)
    }

    #[test]
    fn test_upsert_and_read() {
        let (store, _, attributes, user) = setup();
        attributes
            .upsert_i64(user, 555555, "telegram", Deadline::none())
            .unwrap();

        assert_eq!(
            attributes.read_i64(user, "telegram", Deadline::none()).unwrap(),
            Some(555555)
        );
        assert_eq!(store.stats().unwrap().attributes, 1);
    }

    #[test]
    fn test_overwrite_keeps_single_row() {
        let (store, _, attributes, user) = setup();
        attributes.upsert_i64(user, 1, "telegram", Deadline::none()).unwrap();
        attributes.upsert_i64(user, 2, "telegram", Deadline::none()).unwrap();

        assert_eq!(
            attributes.read_i64(user, "telegram", Deadline::none()).unwrap(),
            Some(2)
        );
        assert_eq!(store.stats().unwrap().attributes, 1);
    }

    #[test]
    fn test_missing_attribute() {
        let (_, _, attributes, user) = setup();
        assert_eq!(
            attributes.read_encrypted(user, "telegram", Deadline::none()).unwrap(),
            None
        );
    }

    #[test]
    fn test_wrong_context_fails_opaquely() {
        let (_, _, attributes, user) = setup();
        attributes
            .upsert_encrypted(user, b"42", "telegram", Deadline::none())
            .unwrap();

        let err = attributes
            .read_encrypted(user, "whatsapp", Deadline::none())
            .unwrap_err();
        assert!(matches!(err, IdentityError::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_rotated_key_reports_mismatch() {
        let (_, ring, attributes, user) = setup();
        attributes.upsert_i64(user, 7, "telegram", Deadline::none()).unwrap();

        ring.configure(b"hash-key", KeyId(1), &[4u8; KEY_LEN], KeyId(2))
            .unwrap();
        let err = attributes.read_i64(user, "telegram", Deadline::none()).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::KeyMismatch {
                stored: KeyId(1),
                active: KeyId(2),
                ..
            }
        ));

        // Configuring back to the historical key makes the row readable again.
        ring.configure(b"hash-key", KeyId(1), &[3u8; KEY_LEN], KeyId(1))
            .unwrap();
        assert_eq!(
            attributes.read_i64(user, "telegram", Deadline::none()).unwrap(),
            Some(7)
        );
    }

    #[test]
    fn test_unconfigured_ring() {
        let store = Arc::new(MemoryStore::new());
        let attributes = EncryptedAttributeStore::new(store, KeyRing::new());
        let err = attributes
            .upsert_encrypted(UserId(1), b"x", "telegram", Deadline::none())
            .unwrap_err();
        assert!(matches!(err, IdentityError::Configuration { .. }));
    }

    #[test]
    fn test_rejects_non_positive_user() {
        let (_, _, attributes, _) = setup();
        let err = attributes
            .upsert_encrypted(UserId(0), b"x", "telegram", Deadline::none())
            .unwrap_err();
        assert!(matches!(err, IdentityError::Input { .. }));
    }

    #[test]
    fn test_unknown_user_is_storage_error() {
        let (_, _, attributes, _) = setup();
        let err = attributes
            .upsert_encrypted(UserId(99), b"x", "telegram", Deadline::none())
            .unwrap_err();
        assert!(matches!(err, IdentityError::Storage { .. }));
    }

    #[test]
    fn test_expired_deadline_writes_nothing() {
        let (store, _, attributes, user) = setup();
        let err = attributes
            .upsert_encrypted(
                user,
                b"x",
                "telegram",
                Deadline::at(std::time::Instant::now()),
            )
            .unwrap_err();
        assert!(matches!(err, IdentityError::Cancelled { .. }));
        assert_eq!(store.stats().unwrap().attributes, 0);
    }
}
