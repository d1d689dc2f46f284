//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- Durable event queue. `seq` is both the record id and the creation
    -- sequence number; AUTOINCREMENT keeps it unique and monotonic.
    CREATE TABLE IF NOT EXISTS events (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        category         TEXT NOT NULL,
        event_type       TEXT NOT NULL,
        ts               REAL NOT NULL,

        -- Identity snapshot at enqueue time, never mutated
        customer_ids     JSON NOT NULL,
        properties       JSON NOT NULL,

        -- Destination project, denormalized so a later project switch
        -- never redirects a queued record
        project_base_url TEXT NOT NULL,
        project_token    TEXT NOT NULL,
        project_auth     TEXT,

        tries            INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_base_url, project_token);

    -- Single-row customer identity
    CREATE TABLE IF NOT EXISTS identity (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        cookie           TEXT NOT NULL,
        registered       JSON NOT NULL
    );

    -- Small key/value state: install flag, push token, campaign click
    CREATE TABLE IF NOT EXISTS sdk_state (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL,
        updated_at       DATETIME NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["events", "identity", "sdk_state"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }
}
