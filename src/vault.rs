//! The identity vault: one store, one key ring, the operations callers need.

use std::sync::Arc;
use std::time::Duration;

use crate::attributes::EncryptedAttributeStore;
use crate::crypto::KeyRing;
use crate::db::IdentityStore;
use crate::deadline::Deadline;
use crate::error::{IdentityError, Result};
use crate::resolver::{IdentityResolver, Resolution, ResolveRequest, ResolverStatsSnapshot};
use crate::types::{StoreStats, UserId};

/// Default bound on a single vault transaction
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry point for resolving identities and protecting attributes.
///
/// Operations without an explicit deadline run under the vault's
/// transaction timeout.
#[derive(Clone)]
pub struct IdentityVault {
    store: Arc<dyn IdentityStore>,
    ring: KeyRing,
    resolver: IdentityResolver,
    attributes: EncryptedAttributeStore,
    tx_timeout: Option<Duration>,
}

impl IdentityVault {
    pub fn new(store: Arc<dyn IdentityStore>, ring: KeyRing) -> Self {
        Self {
            resolver: IdentityResolver::new(store.clone(), ring.clone()),
            attributes: EncryptedAttributeStore::new(store.clone(), ring.clone()),
            store,
            ring,
            tx_timeout: Some(DEFAULT_TX_TIMEOUT),
        }
    }

    /// Replace the transaction timeout; `None` removes the bound.
    pub fn with_tx_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.ring
    }

    fn deadline(&self) -> Deadline {
        self.tx_timeout.map(Deadline::after).unwrap_or_default()
    }

    pub fn resolve(&self, transport: &str, external_id: &str) -> Result<UserId> {
        self.resolver.resolve(transport, external_id, self.deadline())
    }

    /// Resolve with the full request. An unbounded request deadline is
    /// replaced by the vault's transaction timeout.
    pub fn resolve_with(&self, mut request: ResolveRequest<'_>) -> Result<Resolution> {
        if request.deadline.instant().is_none() {
            request.deadline = self.deadline();
        }
        self.resolver.resolve_with(request)
    }

    pub fn upsert_encrypted(&self, user_id: UserId, plaintext: &[u8], context: &str) -> Result<()> {
        self.attributes
            .upsert_encrypted(user_id, plaintext, context, self.deadline())
    }

    pub fn read_encrypted(&self, user_id: UserId, context: &str) -> Result<Option<Vec<u8>>> {
        self.attributes
            .read_encrypted(user_id, context, self.deadline())
    }

    pub fn upsert_chat_id(&self, user_id: UserId, chat_id: i64, context: &str) -> Result<()> {
        self.attributes
            .upsert_i64(user_id, chat_id, context, self.deadline())
    }

    pub fn read_chat_id(&self, user_id: UserId, context: &str) -> Result<Option<i64>> {
        self.attributes.read_i64(user_id, context, self.deadline())
    }

    pub fn store_stats(&self) -> Result<StoreStats> {
        self.store
            .stats()
            .map_err(|e| IdentityError::storage("store_stats", e))
    }

    pub fn resolver_stats(&self) -> ResolverStatsSnapshot {
        self.resolver.stats()
    }
}
