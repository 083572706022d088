//! Schema DDL and forward-only migration, mirroring the teacher's
//! `CURRENT_VERSION`/`MINIMUM_SUPPORTED_VERSION` pair from `shipper-store`,
//! applied to a `schema_meta` table instead of a JSON field.

use rusqlite::Connection;

use crate::StoreError;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    started_at_ns INTEGER NOT NULL,
    ended_at_ns INTEGER,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    message TEXT NOT NULL,
    payload TEXT NOT NULL,
    ts_ns INTEGER NOT NULL,
    PRIMARY KEY (run_id, seq)
);

CREATE TABLE IF NOT EXISTS apply_cache (
    cluster_key TEXT NOT NULL,
    namespace TEXT NOT NULL,
    release TEXT NOT NULL,
    command TEXT NOT NULL,
    inputs_digest TEXT NOT NULL,
    live_digest TEXT,
    has_hooks INTEGER NOT NULL,
    last_ok_run_id TEXT NOT NULL,
    last_ok_at_ns INTEGER NOT NULL,
    PRIMARY KEY (cluster_key, namespace, release, command)
);

CREATE TABLE IF NOT EXISTS verify_cache (
    cluster_key TEXT NOT NULL,
    namespace TEXT NOT NULL,
    release TEXT NOT NULL,
    last_ok_at_ns INTEGER NOT NULL,
    last_event_resource_version TEXT,
    last_status TEXT NOT NULL,
    last_message TEXT NOT NULL,
    last_evidence TEXT NOT NULL,
    PRIMARY KEY (cluster_key, namespace, release)
);

CREATE TABLE IF NOT EXISTS process_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    acquired_at_ns INTEGER NOT NULL,
    run_id TEXT
);
";

/// Opens (creating if absent) the store file, enables WAL, and brings the
/// schema up to [`CURRENT_SCHEMA_VERSION`]. Unknown (newer-than-known) schema
/// versions are rejected without mutating anything.
pub fn open_and_migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(DDL)?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
        .ok();

    match version {
        None => {
            conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [CURRENT_SCHEMA_VERSION])?;
        }
        Some(v) if v == CURRENT_SCHEMA_VERSION => {}
        Some(v) if v < CURRENT_SCHEMA_VERSION => {
            migrate_forward(conn, v)?;
        }
        Some(v) => return Err(StoreError::UnsupportedSchemaVersion(v)),
    }

    Ok(())
}

/// Applies migrations in order from `from_version` to [`CURRENT_SCHEMA_VERSION`].
/// No migrations are defined yet; this is the hook future schema bumps use.
fn migrate_forward(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
    let _ = from_version;
    conn.execute("UPDATE schema_meta SET version = ?1", [CURRENT_SCHEMA_VERSION])?;
    Ok(())
}
