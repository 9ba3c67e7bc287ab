//! SQLite store integration tests
//!
//! Tests the file-backed store through its connection pool:
//! - Schema creation and reopening
//! - Persistence of bindings and sealed attributes
//! - Racing resolutions on separate pooled connections
//! - Rollback of cancelled and dropped transactions

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tempfile::TempDir;

use identity_vault::{
    db::schema::{get_schema_version, SCHEMA_VERSION},
    Deadline, IdentityError, IdentityStore, IdentityVault, KeyId, KeyRing, SqliteStore,
    SqliteStoreConfig, StoreStats, UserId,
};

fn ring() -> KeyRing {
    KeyRing::with_keys(b"sqlite-hash-key", KeyId(1), &[7u8; 32], KeyId(1)).unwrap()
}

fn open(dir: &TempDir) -> Arc<SqliteStore> {
    let config = SqliteStoreConfig::new(dir.path().join("identity.db"));
    Arc::new(SqliteStore::open(&config).unwrap())
}

// =============================================================================
// Schema & Persistence
// =============================================================================

#[test]
fn test_open_creates_schema() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    assert_eq!(store.path(), Some(dir.path().join("identity.db").as_path()));
    drop(store);

    let conn = Connection::open(dir.path().join("identity.db")).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

    let mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
}

#[test]
fn test_bindings_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let user = {
        let vault = IdentityVault::new(open(&dir), ring());
        let user = vault.resolve("telegram", "1001").unwrap();
        vault.upsert_chat_id(user, 555555, "telegram").unwrap();
        user
    };

    let vault = IdentityVault::new(open(&dir), ring());
    assert_eq!(vault.resolve("telegram", "1001").unwrap(), user);
    assert_eq!(vault.read_chat_id(user, "telegram").unwrap(), Some(555555));
    assert_eq!(vault.resolver_stats().existing, 1);
}

#[test]
fn test_external_id_never_stored() {
    let dir = TempDir::new().unwrap();
    let vault = IdentityVault::new(open(&dir), ring());
    vault.resolve("telegram", "plaintext-external-id").unwrap();

    let conn = Connection::open(dir.path().join("identity.db")).unwrap();
    let (transport, hash, key_id): (String, Vec<u8>, i64) = conn
        .query_row(
            "SELECT transport, external_hash, hash_key_id FROM user_identities",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();

    assert_eq!(transport, "telegram");
    assert_eq!(hash.len(), 32);
    assert_eq!(key_id, 1);
    assert!(!hash
        .windows(b"plaintext-external-id".len())
        .any(|w| w == b"plaintext-external-id"));
}

#[test]
fn test_deleting_user_cascades() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let vault = IdentityVault::new(store.clone(), ring());

    let user = vault.resolve("telegram", "1001").unwrap();
    vault.upsert_chat_id(user, 1, "telegram").unwrap();

    let mut tx = store.begin(Deadline::none()).unwrap();
    assert!(tx.delete_user(user).unwrap());
    tx.commit().unwrap();

    assert_eq!(store.stats().unwrap(), StoreStats::default());
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_racing_resolutions_share_one_user() {
    const THREADS: usize = 8;

    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let vault = IdentityVault::new(store.clone(), ring());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let vault = vault.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                vault.resolve("telegram", "77").unwrap()
            })
        })
        .collect();

    let ids: Vec<UserId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]), "got {ids:?}");

    let stats = store.stats().unwrap();
    assert_eq!(stats.users, 1);
    assert_eq!(stats.identities, 1);
}

#[test]
fn test_conflicting_binding_is_reported() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let hasher_ring = ring();
    let material = hasher_ring.active().unwrap();
    let identity = material.hasher().identity("telegram", "1001");

    let mut tx = store.begin(Deadline::none()).unwrap();
    let first = tx.create_user().unwrap();
    let second = tx.create_user().unwrap();
    assert_eq!(
        tx.bind_identity(&identity, first).unwrap(),
        identity_vault::db::BindOutcome::Bound
    );
    assert_eq!(
        tx.bind_identity(&identity, second).unwrap(),
        identity_vault::db::BindOutcome::Conflict
    );
    assert_eq!(tx.find_user(&identity).unwrap(), Some(first));
    tx.commit().unwrap();
}

// =============================================================================
// Rollback
// =============================================================================

#[test]
fn test_dropped_transaction_rolls_back() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    {
        let mut tx = store.begin(Deadline::none()).unwrap();
        tx.create_user().unwrap();
    }

    assert_eq!(store.stats().unwrap().users, 0);
}

#[test]
fn test_expired_deadline_leaves_no_rows() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let vault = IdentityVault::new(store.clone(), ring());

    let request = identity_vault::ResolveRequest::new("telegram", "1001")
        .with_deadline(Deadline::at(Instant::now()));
    let err = vault.resolve_with(request).unwrap_err();

    assert!(matches!(err, IdentityError::Cancelled { .. }));
    assert_eq!(store.stats().unwrap(), StoreStats::default());
}

#[test]
fn test_writer_lock_wait_is_bounded_by_deadline() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    // Hold the write lock on one pooled connection
    let holder = store.begin(Deadline::none()).unwrap();

    let started = Instant::now();
    let result = store.begin(Deadline::after(Duration::from_millis(200)));
    assert!(result.is_err(), "second writer must not get the lock");
    assert!(started.elapsed() < Duration::from_secs(3));

    drop(holder);
    assert!(store.begin(Deadline::after(Duration::from_secs(1))).is_ok());
}
