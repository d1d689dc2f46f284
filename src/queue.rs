//! Durable event queue
//!
//! Records appended here survive process restart and are drained by the
//! flush coordinator in creation order. A successful [`EventQueueStore::append`]
//! is durable; storage failures surface to the caller instead of dropping
//! the record silently.

use crate::db::Database;
use crate::error::Result;
use crate::types::{EventRecord, NewEventRecord};
use std::sync::Arc;

/// Durable FIFO queue of event records, keyed by creation sequence number.
pub struct EventQueueStore {
    db: Arc<Database>,
}

impl EventQueueStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a record, returning its assigned sequence number.
    ///
    /// Sequence numbers are unique and monotonically increasing even under
    /// concurrent appends from multiple producer threads.
    pub fn append(&self, record: &NewEventRecord) -> Result<i64> {
        let seq = self.db.insert_event(record)?;
        tracing::debug!(
            seq,
            category = %record.category,
            event_type = %record.event_type,
            project = %record.project.project_token,
            "Event queued"
        );
        Ok(seq)
    }

    /// All pending records, ascending by sequence number, stable
    pub fn list_pending(&self) -> Result<Vec<EventRecord>> {
        self.db.pending_events()
    }

    /// Remove a record after acknowledgment or permanent failure
    pub fn remove(&self, seq: i64) -> Result<()> {
        self.db.remove_event(seq)
    }

    /// Increment a record's retry count, returning the new count
    pub fn increment_tries(&self, seq: i64) -> Result<i32> {
        self.db.increment_event_tries(seq)
    }

    /// Number of pending records
    pub fn count(&self) -> Result<i64> {
        self.db.event_count()
    }
}
