//! Storage for users, identity bindings and sealed attributes.
//!
//! The resolver talks to storage only through [`IdentityStore`] and the
//! [`IdentityTx`] transactions it opens. All mutual exclusion for identity
//! creation is delegated to the store: the uniqueness of
//! `(transport, external_hash, hash_key_id)` decides who wins a race.
//!
//! ## Backends
//!
//! - [`SqliteStore`] - relational store, UNIQUE index on the binding tuple
//! - [`MemoryStore`] - in-process stand-in, one coarse mutex over the tables
//!
//! ## Tables
//!
//! - `users` - surrogate user ids
//! - `user_identities` - `(transport, external_hash, hash_key_id) -> user_id`
//! - `user_pii` - one sealed attribute per user, tagged with `enc_key_id`

pub mod memory;
pub mod schema;
pub mod sqlite;

use crate::deadline::Deadline;
use crate::error::StoreError;
use crate::types::{EncryptedAttribute, IdentityHash, StoreStats, UserId};

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};

/// Result of inserting an identity binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The binding row was written.
    Bound,
    /// A binding for the same tuple already exists; nothing was written.
    Conflict,
}

/// A store that can open transactions.
pub trait IdentityStore: Send + Sync {
    /// Begin a transaction. The deadline bounds how long the store may wait
    /// for locks; checking it between statements is the caller's job.
    fn begin(&self, deadline: Deadline) -> Result<Box<dyn IdentityTx + '_>, StoreError>;

    /// Row counts, for diagnostics and tests.
    fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// One open transaction.
///
/// Dropping a transaction without calling [`commit`](IdentityTx::commit)
/// rolls it back.
pub trait IdentityTx {
    /// User bound to `identity`, if any.
    fn find_user(&mut self, identity: &IdentityHash) -> Result<Option<UserId>, StoreError>;

    /// Insert a new user row and return its surrogate id.
    fn create_user(&mut self) -> Result<UserId, StoreError>;

    /// Insert-or-ignore the binding `identity -> user_id`.
    fn bind_identity(
        &mut self,
        identity: &IdentityHash,
        user_id: UserId,
    ) -> Result<BindOutcome, StoreError>;

    /// Delete a user row. Returns whether a row was removed.
    fn delete_user(&mut self, user_id: UserId) -> Result<bool, StoreError>;

    /// Insert or overwrite the sealed attribute of `attribute.user_id`.
    fn upsert_attribute(&mut self, attribute: &EncryptedAttribute) -> Result<(), StoreError>;

    fn load_attribute(&mut self, user_id: UserId)
        -> Result<Option<EncryptedAttribute>, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
