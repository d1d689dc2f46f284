//! Database repository layer
//!
//! Query and mutation operations for event records, the customer identity
//! row, and small key/value SDK state. Every public method takes the
//! connection mutex briefly; callers never hold it across network I/O.

use crate::error::Result;
use crate::types::{CustomerIdentity, EventCategory, EventRecord, NewEventRecord, ProjectSettings};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Database handle with a single mutex-guarded connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode so producer appends and drain bookkeeping interleave well
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Event queue operations
    // ============================================

    /// Append a record, returning its assigned sequence number.
    ///
    /// The sequence number is assigned inside the connection lock, so
    /// concurrent appends never share or skip one.
    pub fn insert_event(&self, record: &NewEventRecord) -> Result<i64> {
        let customer_ids = serde_json::to_string(&record.customer_ids)?;
        let properties = serde_json::to_string(&record.properties)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO events (
                category, event_type, ts, customer_ids, properties,
                project_base_url, project_token, project_auth, tries, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
            "#,
            params![
                record.category.as_str(),
                record.event_type,
                record.timestamp,
                customer_ids,
                properties,
                record.project.base_url,
                record.project.project_token,
                record.project.authorization,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All pending records in creation order, ascending by sequence number
    pub fn pending_events(&self) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, category, event_type, ts, customer_ids, properties,
                   project_base_url, project_token, project_auth, tries, created_at
            FROM events
            ORDER BY seq ASC
            "#,
        )?;

        let records = stmt
            .query_map([], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Remove a record after acknowledgment or permanent failure
    pub fn remove_event(&self, seq: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM events WHERE seq = ?1", [seq])?;
        Ok(())
    }

    /// Increment a record's retry count, returning the new count
    pub fn increment_event_tries(&self, seq: i64) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE events SET tries = tries + 1 WHERE seq = ?1", [seq])?;
        let tries: i32 =
            conn.query_row("SELECT tries FROM events WHERE seq = ?1", [seq], |r| r.get(0))?;
        Ok(tries)
    }

    /// Number of pending records
    pub fn event_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(count)
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<EventRecord> {
        let category_str: String = row.get(1)?;
        let customer_ids_str: String = row.get(4)?;
        let properties_str: String = row.get(5)?;
        let auth: Option<String> = row.get(8)?;
        let created_at_str: String = row.get(10)?;

        Ok(EventRecord {
            seq: row.get(0)?,
            category: category_str.parse().unwrap_or(EventCategory::TrackEvent),
            event_type: row.get(2)?,
            timestamp: row.get(3)?,
            customer_ids: serde_json::from_str(&customer_ids_str).unwrap_or_default(),
            properties: serde_json::from_str(&properties_str).unwrap_or_default(),
            project: ProjectSettings {
                base_url: row.get(6)?,
                project_token: row.get(7)?,
                authorization: auth,
            },
            tries: row.get(9)?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // ============================================
    // Identity operations
    // ============================================

    /// Load the persisted customer identity, if one exists
    pub fn load_identity(&self) -> Result<Option<CustomerIdentity>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT cookie, registered FROM identity WHERE id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(cookie, registered)| CustomerIdentity {
            cookie,
            registered: serde_json::from_str::<BTreeMap<String, String>>(&registered)
                .unwrap_or_default(),
        }))
    }

    /// Persist the customer identity, replacing any previous one
    pub fn store_identity(&self, identity: &CustomerIdentity) -> Result<()> {
        let registered = serde_json::to_string(&identity.registered)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO identity (id, cookie, registered)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                cookie = excluded.cookie,
                registered = excluded.registered
            "#,
            params![identity.cookie, registered],
        )?;
        Ok(())
    }

    // ============================================
    // Key/value SDK state
    // ============================================

    /// Read a state value
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row("SELECT value FROM sdk_state WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a state value
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sdk_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Remove a state value
    pub fn clear_state(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sdk_state WHERE key = ?1", [key])?;
        Ok(())
    }
}
