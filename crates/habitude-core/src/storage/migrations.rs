//! Database schema migrations for habitude.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const CURRENT_VERSION: i32 = 3;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get::<_, i32>(0),
    )
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: sync queue, entity records and the kv table.
///
/// `sync_actions.sequence` is the append counter that fixes apply order for
/// actions on the same entity; `next_attempt_at` is only set while a
/// transient failure waits out its backoff.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_actions (
            id              TEXT PRIMARY KEY,
            sequence        INTEGER NOT NULL UNIQUE,
            owner_id        TEXT NOT NULL,
            entity_type     TEXT NOT NULL,
            entity_id       TEXT NOT NULL,
            action_type     TEXT NOT NULL,
            command         TEXT NOT NULL,
            priority        INTEGER NOT NULL,
            status          TEXT NOT NULL,
            attempt_count   INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            last_attempt_at TEXT,
            last_error      TEXT,
            failure         TEXT,
            next_attempt_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_actions_drain
            ON sync_actions(status, priority, created_at, sequence);
        CREATE INDEX IF NOT EXISTS idx_sync_actions_entity
            ON sync_actions(entity_id, sequence);

        CREATE TABLE IF NOT EXISTS entity_records (
            id               TEXT PRIMARY KEY,
            owner_id         TEXT NOT NULL,
            entity_type      TEXT NOT NULL,
            fields           TEXT NOT NULL,
            sync_status      TEXT NOT NULL,
            local_updated_at TEXT NOT NULL,
            server_updated_at TEXT,
            last_synced_at   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_entity_records_status
            ON entity_records(owner_id, sync_status);

        CREATE TABLE IF NOT EXISTS kv (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// Migration v2: conflict log.
///
/// Every conflict surfaced by the remote is recorded until it is resolved
/// explicitly (accept server or keep local).
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            action_id         TEXT NOT NULL,
            entity_id         TEXT NOT NULL,
            client_updated_at TEXT,
            server_updated_at TEXT,
            message           TEXT NOT NULL,
            detected_at       TEXT NOT NULL,
            resolved_at       TEXT,
            resolution        TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected ON sync_conflicts(detected_at DESC);",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()
}

/// Migration v3: keep the server's answer on SUCCEEDED actions, so a late
/// caller asking about a settled completion gets the real rewards.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch("ALTER TABLE sync_actions ADD COLUMN response TEXT;")?;

    set_schema_version(&tx, 3)?;
    tx.commit()
}
