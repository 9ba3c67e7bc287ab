//! identity-vault - identity resolution and attribute privacy
//!
//! Maps a platform identity `(transport, external_id)` to a stable surrogate
//! user id without ever storing the external id in cleartext, and keeps one
//! secondary attribute per user (e.g. a chat id) sealed at rest.
//!
//! ## Architecture
//!
//! ```text
//! (transport, external_id)
//!         │
//!         ▼
//!   IdentityHasher ──── KeyRing ──── SecretBox
//!         │                              │
//!         ▼                              ▼
//!   IdentityResolver          EncryptedAttributeStore
//!         │                              │
//!         └──────── IdentityStore ───────┘
//!                (SQLite or in-memory)
//! ```
//!
//! [`IdentityVault`] bundles one store and one key ring behind the handful of
//! operations callers need.

pub mod attributes;
pub mod config;
pub mod crypto;
pub mod db;
pub mod deadline;
pub mod error;
pub mod logging;
pub mod resolver;
pub mod types;
pub mod vault;

pub use attributes::EncryptedAttributeStore;
pub use config::Args;
pub use crypto::{CryptoError, IdentityHasher, KeyRing, SecretBox};
pub use db::{IdentityStore, IdentityTx, MemoryStore, SqliteStore, SqliteStoreConfig};
pub use deadline::Deadline;
pub use error::{IdentityError, Result, StoreError};
pub use resolver::{IdentityResolver, Resolution, ResolveOutcome, ResolveRequest, ResolverStatsSnapshot};
pub use types::{EncryptedAttribute, IdentityHash, KeyId, StoreStats, UserId};
pub use vault::IdentityVault;
