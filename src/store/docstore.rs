//! Document-store adapter: transactional UID/GID counter and name↔id
//! mappings.
//!
//! The real deployment uses Google Firestore; no example repo in the pack
//! pulls in a `firestore` crate, so (per DESIGN.md's recorded Open Question
//! decision) this is implemented against a dedicated Postgres table using
//! `sqlx` transactions with `SELECT ... FOR UPDATE`, which gives the same
//! transactional-counter semantics without fabricating a dependency. Bots
//! allocate from a separate counter so the two ranges never collide.

use sqlx::{PgPool, Row};

use crate::{Error, Result};

const UID_FLOOR: i64 = 10_000;
const UID_BOT_FLOOR: i64 = 100_000;
const GID_FLOOR: i64 = 10_000;
const GID_BOT_FLOOR: i64 = 100_000;
const MAX_ID: i64 = i64::from(u32::MAX);

/// Transactional UID/GID allocator.
#[async_trait::async_trait]
pub trait DocStore: Send + Sync {
    /// Return the existing uid for `username`, allocating one from the
    /// appropriate range (bot or regular) if this is the first request.
    async fn allocate_uid(&self, username: &str, is_bot: bool) -> Result<u32>;

    /// Return the existing gid for `group`, allocating one if needed.
    async fn allocate_gid(&self, group: &str, is_bot: bool) -> Result<u32>;
}

/// Postgres-backed [`DocStore`].
pub struct PostgresDocStore {
    pool: PgPool,
}

impl PostgresDocStore {
    /// Wrap an existing pool (shared with [`crate::store::db::PostgresStore`]).
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn allocate(&self, namespace: &str, name: &str, floor: i64) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = sqlx::query(
            "SELECT id FROM id_allocations WHERE namespace = $1 AND name = $2 FOR UPDATE",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        {
            let id: i64 = row.try_get("id")?;
            tx.commit().await?;
            return Ok(u32::try_from(id).unwrap_or(0));
        }

        let counter_row = sqlx::query(
            "SELECT counter FROM id_counters WHERE namespace = $1 FOR UPDATE",
        )
        .bind(namespace)
        .fetch_optional(&mut *tx)
        .await?;

        let next_id = match counter_row {
            Some(row) => {
                let counter: i64 = row.try_get("counter")?;
                let next = counter + 1;
                sqlx::query("UPDATE id_counters SET counter = $1 WHERE namespace = $2")
                    .bind(next)
                    .bind(namespace)
                    .execute(&mut *tx)
                    .await?;
                next
            }
            None => {
                sqlx::query("INSERT INTO id_counters (namespace, counter) VALUES ($1, $2)")
                    .bind(namespace)
                    .bind(floor)
                    .execute(&mut *tx)
                    .await?;
                floor
            }
        };

        if next_id > MAX_ID {
            return Err(Error::IdAllocationExhausted(namespace_kind(namespace)));
        }

        sqlx::query(
            "INSERT INTO id_allocations (namespace, name, id) VALUES ($1, $2, $3)",
        )
        .bind(namespace)
        .bind(name)
        .bind(next_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(u32::try_from(next_id).unwrap_or(0))
    }
}

fn namespace_kind(namespace: &str) -> &'static str {
    if namespace.starts_with("uid") {
        "uid"
    } else {
        "gid"
    }
}

#[async_trait::async_trait]
impl DocStore for PostgresDocStore {
    async fn allocate_uid(&self, username: &str, is_bot: bool) -> Result<u32> {
        let (namespace, floor) = if is_bot {
            ("uid_bot", UID_BOT_FLOOR)
        } else {
            ("uid", UID_FLOOR)
        };
        self.allocate(namespace, username, floor).await
    }

    async fn allocate_gid(&self, group: &str, is_bot: bool) -> Result<u32> {
        let (namespace, floor) = if is_bot {
            ("gid_bot", GID_BOT_FLOOR)
        } else {
            ("gid", GID_FLOOR)
        };
        self.allocate(namespace, group, floor).await
    }
}
