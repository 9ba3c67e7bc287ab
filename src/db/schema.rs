//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new identity schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating identity schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(StoreError::Schema(format!(
            "database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Identity schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
pub fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::Schema(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(IDENTITY_SCHEMA)
        .map_err(|e| StoreError::Schema(format!("Failed to create identity tables: {}", e)))?;
    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    // No released version precedes v1 yet.
    info!(from_version, "No migration steps required");
    set_schema_version(conn, SCHEMA_VERSION)
}

/// Users, identity bindings and sealed per-user attributes.
///
/// The UNIQUE constraint on `user_identities` is the only arbiter of which
/// concurrent resolution creates the user for an identity.
const IDENTITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- External ids are never stored, only their keyed hash
CREATE TABLE IF NOT EXISTS user_identities (
    user_id INTEGER NOT NULL,
    transport TEXT NOT NULL,
    external_hash BLOB NOT NULL,
    hash_key_id INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (transport, external_hash, hash_key_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_user_identities_user ON user_identities(user_id);

-- One sealed attribute (e.g. chat id) per user, no history
CREATE TABLE IF NOT EXISTS user_pii (
    user_id INTEGER PRIMARY KEY NOT NULL,
    ciphertext BLOB NOT NULL,
    enc_key_id INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection, name: &str) -> i64 {
        conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        for table in ["users", "user_identities", "user_pii"] {
            assert_eq!(table_count(&conn, table), 1, "missing table {table}");
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT count(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("UPDATE schema_version SET version = ?", [SCHEMA_VERSION + 1])
            .unwrap();

        assert!(matches!(init_schema(&conn), Err(StoreError::Schema(_))));
    }

    #[test]
    fn test_binding_tuple_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("INSERT INTO users DEFAULT VALUES", []).unwrap();
        conn.execute("INSERT INTO users DEFAULT VALUES", []).unwrap();

        let insert = "INSERT INTO user_identities (user_id, transport, external_hash, hash_key_id)
                      VALUES (?, 'telegram', x'0102', 1)";
        conn.execute(insert, [1]).unwrap();
        assert!(conn.execute(insert, [2]).is_err());
    }
}
