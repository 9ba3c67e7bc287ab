//! Get-or-create resolution of external identities to surrogate user ids.
//!
//! Every attempt runs inside one store transaction:
//!
//! 1. hash `(transport, external_id)` with the active hash key
//! 2. fast path: select the existing binding
//! 3. slow path: create a user, insert-or-ignore the binding
//! 4. race path: the binding was rejected, so another resolution won. Delete
//!    our orphan user and re-select the winner
//!
//! The uniqueness of the binding tuple in storage is the only arbiter. There
//! are no retries here; a failed attempt is rolled back and reported.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::attributes::seal_attribute;
use crate::crypto::KeyMaterial;
use crate::db::{BindOutcome, IdentityStore, IdentityTx};
use crate::deadline::Deadline;
use crate::error::{IdentityError, Result};
use crate::types::{IdentityHash, UserId};

/// How a resolution obtained its user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// The binding already existed.
    Existing,
    /// This call created the user and its binding.
    Created,
    /// A concurrent call bound the identity first; its user was returned.
    LostRace,
}

impl fmt::Display for ResolveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Existing => "existing",
            Self::Created => "created",
            Self::LostRace => "lost_race",
        };
        f.write_str(name)
    }
}

/// Result of [`IdentityResolver::resolve_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub user_id: UserId,
    pub outcome: ResolveOutcome,
}

/// One resolution, optionally carrying an attribute to seal for the user.
#[derive(Clone)]
pub struct ResolveRequest<'a> {
    pub transport: &'a str,
    pub external_id: &'a str,
    /// Plaintext sealed and upserted in the same transaction.
    pub attribute: Option<Vec<u8>>,
    /// Context bound into the attribute box. Defaults to the lowercased
    /// transport.
    pub context: Option<String>,
    pub deadline: Deadline,
}

impl<'a> ResolveRequest<'a> {
    pub fn new(transport: &'a str, external_id: &'a str) -> Self {
        Self {
            transport,
            external_id,
            attribute: None,
            context: None,
            deadline: Deadline::none(),
        }
    }

    pub fn with_attribute(mut self, plaintext: impl Into<Vec<u8>>) -> Self {
        self.attribute = Some(plaintext.into());
        self
    }

    /// Attach a chat id, packed as 8 big-endian bytes.
    pub fn with_chat_id(self, chat_id: i64) -> Self {
        self.with_attribute(chat_id.to_be_bytes())
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    fn attribute_context(&self) -> String {
        self.context
            .clone()
            .unwrap_or_else(|| self.transport.to_lowercase())
    }

    fn validate(&self) -> Result<()> {
        if self.transport.is_empty() {
            return Err(IdentityError::input("resolve", "transport must not be empty"));
        }
        if self.external_id.is_empty() {
            return Err(IdentityError::input("resolve", "external id must not be empty"));
        }
        Ok(())
    }
}

// Debug output never shows the external id or the attribute.
impl fmt::Debug for ResolveRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveRequest")
            .field("transport", &self.transport)
            .field("external_id", &"<redacted>")
            .field("attribute", &self.attribute.as_ref().map(|_| "<redacted>"))
            .field("context", &self.context)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Resolver counters.
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Resolutions answered by an existing binding
    pub existing: AtomicU64,
    /// Users created and bound
    pub created: AtomicU64,
    /// Resolutions that lost the binding race
    pub races_lost: AtomicU64,
    /// Orphan users that could not be deleted after a lost race
    pub orphan_cleanup_failures: AtomicU64,
}

impl ResolverStats {
    fn record(&self, outcome: ResolveOutcome) {
        let counter = match outcome {
            ResolveOutcome::Existing => &self.existing,
            ResolveOutcome::Created => &self.created,
            ResolveOutcome::LostRace => &self.races_lost,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_orphan_cleanup_failure(&self) {
        self.orphan_cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current stats.
    pub fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            existing: self.existing.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            races_lost: self.races_lost.load(Ordering::Relaxed),
            orphan_cleanup_failures: self.orphan_cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ResolverStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStatsSnapshot {
    pub existing: u64,
    pub created: u64,
    pub races_lost: u64,
    pub orphan_cleanup_failures: u64,
}

/// Maps external identities to stable user ids.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    ring: crate::crypto::KeyRing,
    stats: Arc<ResolverStats>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, ring: crate::crypto::KeyRing) -> Self {
        Self {
            store,
            ring,
            stats: Arc::new(ResolverStats::default()),
        }
    }

    pub fn stats(&self) -> ResolverStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve `(transport, external_id)` to its user id, creating the user
    /// on first sight.
    pub fn resolve(&self, transport: &str, external_id: &str, deadline: Deadline) -> Result<UserId> {
        let request = ResolveRequest::new(transport, external_id).with_deadline(deadline);
        self.resolve_with(request).map(|resolution| resolution.user_id)
    }

    pub fn resolve_with(&self, request: ResolveRequest<'_>) -> Result<Resolution> {
        request.validate()?;

        let material = self
            .ring
            .active()
            .ok_or_else(|| IdentityError::configuration("resolve", "key ring has no active keys"))?;
        let identity = material.hasher().identity(request.transport, request.external_id);

        let span = info_span!(
            "resolve",
            transport = %identity.transport,
            hash_key_id = %identity.hash_key_id
        );
        let _guard = span.enter();

        let deadline = request.deadline;
        deadline.check("resolve.begin")?;
        let mut tx = self
            .store
            .begin(deadline)
            .map_err(|e| IdentityError::storage("resolve.begin", e))?;

        deadline.check("resolve.find_user")?;
        let existing = tx
            .find_user(&identity)
            .map_err(|e| IdentityError::storage("resolve.find_user", e))?;

        let resolution = match existing {
            Some(user_id) => Resolution {
                user_id,
                outcome: ResolveOutcome::Existing,
            },
            None => self.create_or_join(tx.as_mut(), &identity, deadline)?,
        };

        if let Some(plaintext) = &request.attribute {
            self.store_attribute(
                tx.as_mut(),
                &material,
                resolution.user_id,
                plaintext,
                &request.attribute_context(),
                deadline,
            )?;
        }

        deadline.check("resolve.commit")?;
        tx.commit()
            .map_err(|e| IdentityError::storage("resolve.commit", e))?;

        self.stats.record(resolution.outcome);
        match resolution.outcome {
            ResolveOutcome::Existing => {
                debug!(user_id = %resolution.user_id, outcome = %resolution.outcome, "Resolved identity")
            }
            _ => info!(user_id = %resolution.user_id, outcome = %resolution.outcome, "Resolved identity"),
        }

        Ok(resolution)
    }

    /// Slow path and, if the binding is rejected, the race path.
    fn create_or_join(
        &self,
        tx: &mut dyn IdentityTx,
        identity: &IdentityHash,
        deadline: Deadline,
    ) -> Result<Resolution> {
        deadline.check("resolve.create_user")?;
        let candidate = tx
            .create_user()
            .map_err(|e| IdentityError::storage("resolve.create_user", e))?;

        deadline.check("resolve.bind_identity")?;
        let bound = tx
            .bind_identity(identity, candidate)
            .map_err(|e| IdentityError::storage("resolve.bind_identity", e))?;

        if bound == BindOutcome::Bound {
            return Ok(Resolution {
                user_id: candidate,
                outcome: ResolveOutcome::Created,
            });
        }

        deadline.check("resolve.delete_orphan")?;
        match tx.delete_user(candidate) {
            Ok(true) => debug!(orphan_user_id = %candidate, "Deleted orphan user after lost race"),
            Ok(false) => {
                self.stats.record_orphan_cleanup_failure();
                warn!(orphan_user_id = %candidate, "Orphan user was already gone after lost race");
            }
            Err(e) => {
                self.stats.record_orphan_cleanup_failure();
                warn!(orphan_user_id = %candidate, error = %e, "Failed to delete orphan user after lost race");
            }
        }

        deadline.check("resolve.reselect")?;
        let winner = tx
            .find_user(identity)
            .map_err(|e| IdentityError::storage("resolve.reselect", e))?;

        match winner {
            Some(user_id) => Ok(Resolution {
                user_id,
                outcome: ResolveOutcome::LostRace,
            }),
            None => {
                error!(
                    orphan_user_id = %candidate,
                    "Binding was rejected but no winning binding exists"
                );
                Err(IdentityError::InvariantViolation {
                    op: "resolve.reselect",
                    detail: format!(
                        "binding rejected for transport {} but re-select found none",
                        identity.transport
                    ),
                })
            }
        }
    }

    fn store_attribute(
        &self,
        tx: &mut dyn IdentityTx,
        material: &KeyMaterial,
        user_id: UserId,
        plaintext: &[u8],
        context: &str,
        deadline: Deadline,
    ) -> Result<()> {
        let attribute = seal_attribute(material, user_id, plaintext, context)?;
        deadline.check("resolve.upsert_attribute")?;
        tx.upsert_attribute(&attribute)
            .map_err(|e| IdentityError::storage("resolve.upsert_attribute", e))
    }
}
