//! SQLite-backed identity store.
//!
//! Connections come from an r2d2 pool so concurrent resolutions really run
//! in parallel transactions. Every transaction is opened with
//! `BEGIN IMMEDIATE`, taking the write lock up front; SQLite then orders
//! concurrent writers and the UNIQUE index on `user_identities` decides
//! which creation wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use super::{schema, BindOutcome, IdentityStore, IdentityTx};
use crate::deadline::Deadline;
use crate::error::StoreError;
use crate::types::{EncryptedAttribute, IdentityHash, KeyId, StoreStats, UserId};

/// Connection settings for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Database file
    pub path: PathBuf,

    /// Maximum pooled connections
    pub pool_size: u32,

    /// Lock wait used when the caller gives no deadline
    pub busy_timeout: Duration,
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("identity-vault.db"),
            pool_size: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

type SqliteConn = PooledConnection<SqliteConnectionManager>;

/// Relational identity store on SQLite
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: Option<PathBuf>,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open or create the database and apply the schema
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, StoreError> {
        info!(path = %config.path.display(), pool_size = config.pool_size, "Opening identity database");

        let manager = SqliteConnectionManager::file(&config.path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")
        });
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .build(manager)?;

        {
            let conn = pool.get()?;
            // WAL lets readers proceed while one writer holds the lock
            let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            debug!(journal_mode = %mode, "Journal mode set");
            schema::init_schema(&conn)?;
        }

        Ok(Self {
            pool,
            path: Some(config.path.clone()),
            busy_timeout: config.busy_timeout,
        })
    }

    /// Open a private in-memory database (for testing).
    ///
    /// The pool holds a single connection since every in-memory connection
    /// would otherwise see its own empty database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory identity database");

        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        {
            let conn = pool.get()?;
            schema::init_schema(&conn)?;
        }

        Ok(Self {
            pool,
            path: None,
            busy_timeout: Duration::from_secs(5),
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self, deadline: Deadline) -> Result<SqliteConn, StoreError> {
        let conn = match deadline.remaining() {
            Some(remaining) => self.pool.get_timeout(remaining)?,
            None => self.pool.get()?,
        };
        conn.busy_timeout(deadline.remaining().unwrap_or(self.busy_timeout))?;
        Ok(conn)
    }

    fn count(conn: &SqliteConn, table: &str) -> Result<u64, StoreError> {
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}

impl IdentityStore for SqliteStore {
    fn begin(&self, deadline: Deadline) -> Result<Box<dyn IdentityTx + '_>, StoreError> {
        let conn = self.conn(deadline)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx {
            conn,
            finished: false,
        }))
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn(Deadline::none())?;
        Ok(StoreStats {
            users: Self::count(&conn, "users")?,
            identities: Self::count(&conn, "user_identities")?,
            attributes: Self::count(&conn, "user_pii")?,
        })
    }
}

/// Open SQLite transaction on a pooled connection
struct SqliteTx {
    conn: SqliteConn,
    finished: bool,
}

impl SqliteTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }
}

impl IdentityTx for SqliteTx {
    fn find_user(&mut self, identity: &IdentityHash) -> Result<Option<UserId>, StoreError> {
        self.ensure_open()?;
        let user_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT user_id FROM user_identities
                 WHERE transport = ?1 AND external_hash = ?2 AND hash_key_id = ?3",
                params![
                    identity.transport,
                    &identity.hash[..],
                    identity.hash_key_id.0
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id.map(UserId))
    }

    fn create_user(&mut self) -> Result<UserId, StoreError> {
        self.ensure_open()?;
        let id: i64 = self.conn.query_row(
            "INSERT INTO users DEFAULT VALUES RETURNING id",
            [],
            |row| row.get(0),
        )?;
        Ok(UserId(id))
    }

    fn bind_identity(
        &mut self,
        identity: &IdentityHash,
        user_id: UserId,
    ) -> Result<BindOutcome, StoreError> {
        self.ensure_open()?;
        let inserted = self.conn.execute(
            "INSERT INTO user_identities (user_id, transport, external_hash, hash_key_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (transport, external_hash, hash_key_id) DO NOTHING",
            params![
                user_id.0,
                identity.transport,
                &identity.hash[..],
                identity.hash_key_id.0
            ],
        )?;
        Ok(if inserted == 1 {
            BindOutcome::Bound
        } else {
            BindOutcome::Conflict
        })
    }

    fn delete_user(&mut self, user_id: UserId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let deleted = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![user_id.0])?;
        Ok(deleted > 0)
    }

    fn upsert_attribute(&mut self, attribute: &EncryptedAttribute) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn.execute(
            "INSERT INTO user_pii (user_id, ciphertext, enc_key_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id) DO UPDATE SET
                 ciphertext = excluded.ciphertext,
                 enc_key_id = excluded.enc_key_id,
                 updated_at = excluded.updated_at",
            params![
                attribute.user_id.0,
                attribute.ciphertext,
                attribute.enc_key_id.0,
                attribute.updated_at
            ],
        )?;
        Ok(())
    }

    fn load_attribute(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<EncryptedAttribute>, StoreError> {
        self.ensure_open()?;
        let attribute = self
            .conn
            .query_row(
                "SELECT ciphertext, enc_key_id, updated_at FROM user_pii WHERE user_id = ?1",
                params![user_id.0],
                |row| {
                    Ok(EncryptedAttribute {
                        user_id,
                        ciphertext: row.get(0)?,
                        enc_key_id: KeyId(row.get(1)?),
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(attribute)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        // On failure Drop rolls back whatever is left open.
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // A connection returned to the pool must not carry an open transaction.
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}
