//! Key-value store adapter: typed get/set/delete with TTL.
//!
//! Generalizes the teacher's `key_server::store::TokenStore` trait (which
//! was specific to one token shape) into a byte-oriented store any of the
//! token service, OIDC authorization-code store, and cookie nonce tracking
//! can serialize their own records into.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// A typed get/set/delete store with optional per-entry TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl` if given.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Fetch the value stored under `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the entry stored under `key`, if any. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically fetch and delete in one step — used for single-use
    /// records such as OIDC authorization codes (§3 `OIDCAuthorization`).
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.delete(key).await?;
        }
        Ok(value)
    }
}

/// Redis-backed [`KvStore`], the production implementation.
pub struct RedisKvStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisKvStore {
    /// Connect to `redis_url`, retrying via redis's own connection manager
    /// reconnect logic for the lifetime of the process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyValueStore`] if the initial connection fails.
    pub async fn connect(redis_url: &str, password: Option<&str>) -> Result<Self> {
        let url = if let Some(password) = password {
            let mut parsed = redis::Url::parse(redis_url)
                .map_err(|e| Error::Config(format!("invalid redis_url: {e}")))?;
            let _ = parsed.set_password(Some(password));
            parsed.to_string()
        } else {
            redis_url.to_string()
        };
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<std::time::Instant>,
}

/// In-process [`KvStore`] for tests, mirroring the teacher's
/// `InMemoryTokenStore` (lazy eviction on access, no background sweep
/// required for correctness).
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
    // Guards read-modify-write sequences (`take`) so concurrent callers
    // cannot both observe the same single-use entry.
    take_lock: Mutex<()>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| std::time::Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.expires_at.is_some_and(|exp| exp <= std::time::Instant::now()) {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.take_lock.lock().await;
        let value = self.get(key).await?;
        if value.is_some() {
            self.entries.remove(key);
        }
        Ok(value)
    }
}

/// Convenience alias used throughout the service layer.
pub type SharedKvStore = Arc<dyn KvStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = InMemoryKvStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryKvStore::new();
        store.set("k", b"v", None).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_lazily() {
        let store = InMemoryKvStore::new();
        store
            .set("k", b"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let store = InMemoryKvStore::new();
        store.set("code", b"payload", None).await.unwrap();
        assert_eq!(store.take("code").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.take("code").await.unwrap(), None);
    }
}
