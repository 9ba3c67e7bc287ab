//! In-memory identity store.
//!
//! Stands in for the relational store in tests and dev setups. A single
//! coarse mutex guards the committed tables, and the `identities` map plays
//! the role of the unique index.
//!
//! The lock is taken per statement, not per transaction, so two resolutions
//! of the same identity interleave the way they would against a database:
//! both can miss on lookup, both create a user, and only one binding insert
//! succeeds. Each transaction stages its writes privately until commit.
//! Inserting a binding claims its key in the index; other transactions do
//! not see the claim on lookup, and a second insert of the same key waits
//! until the claim is committed (conflict) or rolled back (free again).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{BindOutcome, IdentityStore, IdentityTx};
use crate::deadline::Deadline;
use crate::error::StoreError;
use crate::types::{EncryptedAttribute, IdentityHash, KeyId, StoreStats, UserId, IDENTITY_HASH_LEN};

type BindingKey = (String, [u8; IDENTITY_HASH_LEN], KeyId);

type TxId = u64;

fn binding_key(identity: &IdentityHash) -> BindingKey {
    (
        identity.transport.clone(),
        identity.hash,
        identity.hash_key_id,
    )
}

struct Tables {
    next_user_id: i64,
    next_tx_id: TxId,
    users: BTreeMap<UserId, DateTime<Utc>>,
    identities: HashMap<BindingKey, UserId>,
    attributes: HashMap<UserId, EncryptedAttribute>,
    /// Binding keys inserted by transactions that have not finished yet
    claims: HashMap<BindingKey, TxId>,
    writes: u64,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            next_user_id: 1,
            next_tx_id: 1,
            users: BTreeMap::new(),
            identities: HashMap::new(),
            attributes: HashMap::new(),
            claims: HashMap::new(),
            writes: 0,
        }
    }
}

/// Process-local store with first-writer-wins bindings
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Signalled whenever a transaction releases its binding claims
    released: Condvar,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed row writes so far.
    pub fn write_count(&self) -> Result<u64, StoreError> {
        Ok(lock(&self.tables)?.writes)
    }

    /// Creation time of a committed user row.
    pub fn user_created_at(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(lock(&self.tables)?.users.get(&user_id).copied())
    }
}

fn lock(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>, StoreError> {
    tables
        .lock()
        .map_err(|e| StoreError::LockPoisoned(e.to_string()))
}

impl IdentityStore for MemoryStore {
    fn begin(&self, deadline: Deadline) -> Result<Box<dyn IdentityTx + '_>, StoreError> {
        let id = {
            let mut tables = lock(&self.tables)?;
            let id = tables.next_tx_id;
            tables.next_tx_id += 1;
            id
        };

        Ok(Box::new(MemoryTx {
            store: self,
            id,
            deadline,
            created: BTreeMap::new(),
            deleted: BTreeSet::new(),
            bound: HashMap::new(),
            attributes: HashMap::new(),
            finished: false,
        }))
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let tables = lock(&self.tables)?;
        Ok(StoreStats {
            users: tables.users.len() as u64,
            identities: tables.identities.len() as u64,
            attributes: tables.attributes.len() as u64,
        })
    }
}

/// Open transaction. Nothing it writes is visible to others before commit.
struct MemoryTx<'a> {
    store: &'a MemoryStore,
    id: TxId,
    deadline: Deadline,
    created: BTreeMap<UserId, DateTime<Utc>>,
    /// Committed users deleted by this transaction
    deleted: BTreeSet<UserId>,
    /// Staged bindings, each backed by a claim in `Tables::claims`
    bound: HashMap<BindingKey, UserId>,
    attributes: HashMap<UserId, EncryptedAttribute>,
    finished: bool,
}

impl<'a> MemoryTx<'a> {
    fn tables(&self) -> Result<MutexGuard<'a, Tables>, StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        let store: &'a MemoryStore = self.store;
        lock(&store.tables)
    }

    fn user_visible(&self, tables: &Tables, user_id: UserId) -> bool {
        self.created.contains_key(&user_id)
            || (tables.users.contains_key(&user_id) && !self.deleted.contains(&user_id))
    }

    fn visible_binding(&self, tables: &Tables, key: &BindingKey) -> Option<UserId> {
        if let Some(user_id) = self.bound.get(key) {
            return Some(*user_id);
        }
        tables
            .identities
            .get(key)
            .copied()
            .filter(|user_id| !self.deleted.contains(user_id))
    }

    /// Block until another transaction releases a claim or the deadline passes.
    fn wait_for_release(
        &self,
        tables: MutexGuard<'a, Tables>,
    ) -> Result<MutexGuard<'a, Tables>, StoreError> {
        let store: &'a MemoryStore = self.store;
        let poisoned = |e: String| StoreError::LockPoisoned(e);

        match self.deadline.remaining() {
            None => store
                .released
                .wait(tables)
                .map_err(|e| poisoned(e.to_string())),
            Some(remaining) if remaining.is_zero() => Err(StoreError::LockTimeout),
            Some(remaining) => store
                .released
                .wait_timeout(tables, remaining)
                .map(|(guard, _)| guard)
                .map_err(|e| poisoned(e.to_string())),
        }
    }

    /// Drop staged writes and give up this transaction's claims.
    fn release(&mut self) -> Result<(), StoreError> {
        {
            let mut tables = lock(&self.store.tables)?;
            for key in self.bound.keys() {
                if tables.claims.get(key) == Some(&self.id) {
                    tables.claims.remove(key);
                }
            }
        }
        let had_claims = !self.bound.is_empty();
        self.created.clear();
        self.deleted.clear();
        self.bound.clear();
        self.attributes.clear();
        if had_claims {
            self.store.released.notify_all();
        }
        Ok(())
    }
}

impl IdentityTx for MemoryTx<'_> {
    fn find_user(&mut self, identity: &IdentityHash) -> Result<Option<UserId>, StoreError> {
        let tables = self.tables()?;
        Ok(self.visible_binding(&tables, &binding_key(identity)))
    }

    fn create_user(&mut self) -> Result<UserId, StoreError> {
        let user_id = {
            let mut tables = self.tables()?;
            let user_id = UserId(tables.next_user_id);
            tables.next_user_id += 1;
            user_id
        };
        self.created.insert(user_id, Utc::now());
        Ok(user_id)
    }

    fn bind_identity(
        &mut self,
        identity: &IdentityHash,
        user_id: UserId,
    ) -> Result<BindOutcome, StoreError> {
        let key = binding_key(identity);
        let mut tables = self.tables()?;
        if !self.user_visible(&tables, user_id) {
            return Err(StoreError::UnknownUser(user_id));
        }

        loop {
            if self.visible_binding(&tables, &key).is_some() {
                return Ok(BindOutcome::Conflict);
            }
            let claimed_by_other = tables
                .claims
                .get(&key)
                .is_some_and(|owner| *owner != self.id);
            if !claimed_by_other {
                break;
            }
            tables = self.wait_for_release(tables)?;
        }

        tables.claims.insert(key.clone(), self.id);
        drop(tables);
        self.bound.insert(key, user_id);
        Ok(BindOutcome::Bound)
    }

    fn delete_user(&mut self, user_id: UserId) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let existed = if self.created.remove(&user_id).is_some() {
            true
        } else if tables.users.contains_key(&user_id) && !self.deleted.contains(&user_id) {
            self.deleted.insert(user_id);
            true
        } else {
            false
        };
        if !existed {
            return Ok(false);
        }

        // Cascade to the staged rows of that user
        let released: Vec<BindingKey> = self
            .bound
            .iter()
            .filter(|(_, bound)| **bound == user_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &released {
            self.bound.remove(key);
            tables.claims.remove(key);
        }
        self.attributes.remove(&user_id);
        drop(tables);

        if !released.is_empty() {
            self.store.released.notify_all();
        }
        Ok(true)
    }

    fn upsert_attribute(&mut self, attribute: &EncryptedAttribute) -> Result<(), StoreError> {
        let tables = self.tables()?;
        if !self.user_visible(&tables, attribute.user_id) {
            return Err(StoreError::UnknownUser(attribute.user_id));
        }
        drop(tables);
        self.attributes
            .insert(attribute.user_id, attribute.clone());
        Ok(())
    }

    fn load_attribute(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<EncryptedAttribute>, StoreError> {
        let tables = self.tables()?;
        if let Some(staged) = self.attributes.get(&user_id) {
            return Ok(Some(staged.clone()));
        }
        if self.deleted.contains(&user_id) {
            return Ok(None);
        }
        Ok(tables.attributes.get(&user_id).cloned())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = self.tables()?;

        // A concurrent commit may have deleted a user this one still refers to
        let referenced = self.bound.values().chain(self.attributes.keys());
        for user_id in referenced {
            if !self.created.contains_key(user_id) && !tables.users.contains_key(user_id) {
                return Err(StoreError::UnknownUser(*user_id));
            }
        }

        let mut writes = 0;
        for user_id in mem::take(&mut self.deleted) {
            if tables.users.remove(&user_id).is_some() {
                writes += 1;
            }
            tables.identities.retain(|_, bound| *bound != user_id);
            tables.attributes.remove(&user_id);
        }
        for (user_id, created_at) in mem::take(&mut self.created) {
            tables.users.insert(user_id, created_at);
            writes += 1;
        }
        let had_claims = !self.bound.is_empty();
        for (key, user_id) in mem::take(&mut self.bound) {
            tables.claims.remove(&key);
            tables.identities.insert(key, user_id);
            writes += 1;
        }
        for (user_id, attribute) in mem::take(&mut self.attributes) {
            tables.attributes.insert(user_id, attribute);
            writes += 1;
        }
        tables.writes += writes;
        drop(tables);

        self.finished = true;
        if had_claims {
            self.store.released.notify_all();
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        self.release()?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to roll back abandoned in-memory transaction");
        }
    }
}
