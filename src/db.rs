//! Local SQLite database for the offline queue.
//!
//! Uses rusqlite with WAL mode and `synchronous = FULL` so a committed write
//! survives power loss before the caller is told the action is queued.
//! Provides schema migrations and the shared connection state used by
//! [`crate::store::SqliteStore`].

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::StoreError;

/// Database connection plus the file it was opened from.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "offline-queue.db";

/// Initialize the database at `{data_dir}/offline-queue.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas and
/// runs pending migrations. A file that fails to open is left in place: it
/// may hold unsynced sales, so the error goes back to the caller.
pub fn init(data_dir: &Path) -> Result<DbState, StoreError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Unavailable(format!("create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening offline queue database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "offline queue database failed to open");
        e
    })?;
    run_migrations(&conn)?;

    info!("Offline queue database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory database with the full schema, for ephemeral use and tests.
pub fn open_in_memory() -> Result<DbState, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;

    // Surfaces a corrupt file at open time instead of on the first enqueue.
    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(StoreError::Unavailable(format!(
            "integrity check failed: {check}"
        )));
    }

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Apply one migration script, tagging failures with the target version.
fn apply(conn: &Connection, version: i32, sql: &str) -> Result<(), StoreError> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        StoreError::Migration {
            version,
            detail: e.to_string(),
        }
    })
}

/// Migration v1: the action queue and scalar flags.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    apply(
        conn,
        1,
        "
        BEGIN;

        -- offline_queue (seq preserves read order, id is the idempotency key)
        CREATE TABLE IF NOT EXISTS offline_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            action_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            checksum TEXT NOT NULL,
            provisional_at TEXT NOT NULL,
            local_audit_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'APPLIED', 'REJECTED', 'CONFLICT', 'FAILED')),
            conflict_reason TEXT,
            error_message TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- offline_flags (string key -> string value)
        CREATE TABLE IF NOT EXISTS offline_flags (
            flag_key TEXT PRIMARY KEY,
            flag_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_offline_queue_checksum ON offline_queue(checksum);
        CREATE INDEX IF NOT EXISTS idx_offline_queue_audit ON offline_queue(local_audit_id);
        CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )?;

    info!("Applied migration v1 (offline_queue, offline_flags)");
    Ok(())
}

/// Migration v2: snapshot cache slots and receipt reconciliation history.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    apply(
        conn,
        2,
        "
        BEGIN;

        -- snapshot_cache (one zstd-compressed JSON document per slot)
        CREATE TABLE IF NOT EXISTS snapshot_cache (
            slot TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- receipt_history (append-only, first server number wins)
        CREATE TABLE IF NOT EXISTS receipt_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_receipt_number TEXT UNIQUE NOT NULL,
            receipt_number TEXT NOT NULL,
            synced_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )?;

    info!("Applied migration v2 (snapshot_cache, receipt_history)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "offline_queue",
            "offline_flags",
            "snapshot_cache",
            "receipt_history",
            "schema_version",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_queue_id_unique_and_status_checked() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let insert = "INSERT INTO offline_queue
            (id, action_type, payload, checksum, provisional_at, local_audit_id, status)
            VALUES (?1, 'SALE_COMPLETE', '{}', 'c', '2030-01-01T00:00:00Z', 'a', ?2)";
        conn.execute(insert, rusqlite::params!["id-1", "PENDING"])
            .expect("first insert");
        assert!(
            conn.execute(insert, rusqlite::params!["id-1", "PENDING"])
                .is_err(),
            "duplicate id should be rejected"
        );
        assert!(
            conn.execute(insert, rusqlite::params!["id-2", "DONE"]).is_err(),
            "unknown status should be rejected"
        );
    }

    #[test]
    fn test_init_uses_wal_and_reopens() {
        let dir = std::env::temp_dir().join(format!("pos_offline_wal_{}", uuid::Uuid::new_v4()));

        let state = init(&dir).expect("init file db");
        {
            let conn = state.lock().expect("lock");
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .expect("read journal_mode");
            assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
        }
        drop(state);

        // Second open finds the schema already current.
        let reopened = init(&dir).expect("reopen");
        assert!(reopened.db_path.ends_with(DB_FILE_NAME));
        drop(reopened);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_init_refuses_garbage_file_without_deleting_it() {
        let dir = std::env::temp_dir().join(format!("pos_offline_bad_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DB_FILE_NAME);
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        assert!(init(&dir).is_err());
        assert!(path.exists(), "unreadable queue file must be preserved");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
