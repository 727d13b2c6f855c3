//! Process-local UID/GID cache.
//!
//! Grounded on `original_source/services/userinfo.py`'s `_get_uid_from_firestore`
//! / `_get_gid_from_firestore`: peek the cache, take a lock, peek again, and
//! only then fall through to the document store. The original uses one
//! global lock per kind; §3/§4.4 of the design call for a per-key lock so
//! concurrent misses for *different* names do not serialize behind each
//! other — only concurrent misses for the *same* name coalesce into a
//! single document-store round trip.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Never expires an entry within the process lifetime, matching the
/// original's "Firestore data is cached" comment — UID/GID assignments are
/// permanent for the life of the account.
#[derive(Default)]
pub struct IdCache {
    uids: DashMap<String, u32>,
    gids: DashMap<String, u32>,
    uid_locks: DashMap<String, Arc<Mutex<()>>>,
    gid_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_uid(&self, username: &str) -> Option<u32> {
        self.uids.get(username).map(|v| *v)
    }

    pub fn store_uid(&self, username: &str, uid: u32) {
        self.uids.insert(username.to_string(), uid);
    }

    #[must_use]
    pub fn get_gid(&self, group: &str) -> Option<u32> {
        self.gids.get(group).map(|v| *v)
    }

    pub fn store_gid(&self, group: &str, gid: u32) {
        self.gids.insert(group.to_string(), gid);
    }

    /// Per-username lock guarding a cache-miss document-store round trip.
    #[must_use]
    pub fn uid_lock(&self, username: &str) -> Arc<Mutex<()>> {
        Self::lock_for(&self.uid_locks, username)
    }

    /// Per-group lock guarding a cache-miss document-store round trip.
    #[must_use]
    pub fn gid_lock(&self, group: &str) -> Arc<Mutex<()>> {
        Self::lock_for(&self.gid_locks, group)
    }

    fn lock_for(map: &DashMap<String, Arc<Mutex<()>>>, key: &str) -> Arc<Mutex<()>> {
        map.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Drop all cached entries. Used by tests.
    pub fn clear(&self) {
        self.uids.clear();
        self.gids.clear();
    }
}
