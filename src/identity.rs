//! Customer identity repository
//!
//! Owns the persisted customer identity: a stable anonymous cookie plus any
//! registered external identifiers. The first `get()` mints and persists a
//! fresh identity; `reset()` severs history by minting another one.

use crate::db::Database;
use crate::error::Result;
use crate::types::CustomerIdentity;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Exclusive owner of the persisted [`CustomerIdentity`].
///
/// All operations run under a repository-wide lock so concurrent `get`/`set`
/// never observe partially written state.
pub struct CustomerIdentityRepository {
    db: Arc<Database>,
    lock: Mutex<()>,
}

impl CustomerIdentityRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    /// The current identity; creates and persists a new anonymous one on
    /// first access. Never returns an empty identity.
    pub fn get(&self) -> Result<CustomerIdentity> {
        let _guard = self.lock.lock().unwrap();
        match self.db.load_identity()? {
            Some(identity) => Ok(identity),
            None => self.create_anonymous(),
        }
    }

    /// Merge registered identifiers into the current identity.
    ///
    /// The cookie is preserved; only `reset` replaces it.
    pub fn set(&self, ids: BTreeMap<String, String>) -> Result<CustomerIdentity> {
        let _guard = self.lock.lock().unwrap();
        let mut identity = match self.db.load_identity()? {
            Some(identity) => identity,
            None => self.create_anonymous()?,
        };
        identity.registered.extend(ids);
        self.db.store_identity(&identity)?;
        Ok(identity)
    }

    /// Discard the current identity and persist a brand-new anonymous one.
    pub fn reset(&self) -> Result<CustomerIdentity> {
        let _guard = self.lock.lock().unwrap();
        self.create_anonymous()
    }

    fn create_anonymous(&self) -> Result<CustomerIdentity> {
        let identity = CustomerIdentity {
            cookie: uuid::Uuid::new_v4().to_string(),
            registered: BTreeMap::new(),
        };
        self.db.store_identity(&identity)?;
        tracing::info!(cookie = %identity.cookie, "New anonymous identity created");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_repo() -> CustomerIdentityRepository {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        CustomerIdentityRepository::new(Arc::new(db))
    }

    #[test]
    fn test_first_get_creates_identity() {
        let repo = test_repo();
        let first = repo.get().unwrap();
        assert!(!first.cookie.is_empty());
        assert!(first.registered.is_empty());

        // Stable across calls
        let second = repo.get().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_merges_and_preserves_cookie() {
        let repo = test_repo();
        let original = repo.get().unwrap();

        let mut ids = BTreeMap::new();
        ids.insert("email".to_string(), "a@example.com".to_string());
        let updated = repo.set(ids).unwrap();
        assert_eq!(updated.cookie, original.cookie);
        assert_eq!(
            updated.registered.get("email"),
            Some(&"a@example.com".to_string())
        );

        // Later sets merge, keeping earlier keys
        let mut more = BTreeMap::new();
        more.insert("phone".to_string(), "+100".to_string());
        let updated = repo.set(more).unwrap();
        assert_eq!(updated.registered.len(), 2);
        assert_eq!(updated.cookie, original.cookie);
    }

    #[test]
    fn test_reset_mints_new_identity() {
        let repo = test_repo();
        let mut ids = BTreeMap::new();
        ids.insert("email".to_string(), "a@example.com".to_string());
        repo.set(ids).unwrap();
        let before = repo.get().unwrap();

        let after = repo.reset().unwrap();
        assert_ne!(after.cookie, before.cookie);
        assert!(after.registered.is_empty());
        assert_eq!(repo.get().unwrap(), after);
    }

    #[test]
    fn test_identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let cookie = {
            let db = Database::open(&path).unwrap();
            db.migrate().unwrap();
            CustomerIdentityRepository::new(Arc::new(db))
                .get()
                .unwrap()
                .cookie
        };

        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        let repo = CustomerIdentityRepository::new(Arc::new(db));
        assert_eq!(repo.get().unwrap().cookie, cookie);
    }
}
