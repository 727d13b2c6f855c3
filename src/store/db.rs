//! Relational store adapter: transactional persistence of token metadata,
//! admins, and history.
//!
//! The Postgres implementation keeps transactions short per §5's locking
//! discipline — they never wrap a key-value or LDAP call — and uses the
//! `identity_key` column with a unique index plus `INSERT ... ON CONFLICT
//! DO NOTHING` for the at-most-one-concurrent-creation guarantee on derived
//! tokens (§4.1), the SQL equivalent of the teacher's per-identity lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::token::model::{HistoryAction, HistoryEntry, TokenInfo, TokenType};
use crate::{Error, Result};

/// Transactional persistence of token metadata, admins, and history.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert a brand-new token row.
    async fn insert_token_info(&self, info: &TokenInfo) -> Result<()>;

    /// Insert a derived-token row only if no row with the same
    /// `identity_key` already exists. Returns the row that is now
    /// authoritative: the one just inserted, or the pre-existing one.
    async fn insert_derived_if_absent(&self, info: &TokenInfo) -> Result<TokenInfo>;

    /// Fetch a token row by key.
    async fn get_token_info(&self, key: &str) -> Result<Option<TokenInfo>>;

    /// Record that a token was used to authenticate a request.
    async fn touch_last_used(&self, key: &str, when: DateTime<Utc>) -> Result<()>;

    /// Delete a token row and cascade to its derived children.
    async fn delete_token(&self, key: &str) -> Result<()>;

    /// List tokens owned by `username`.
    async fn list_tokens(&self, username: &str) -> Result<Vec<TokenInfo>>;

    /// Modify a token's name, scopes, or expiry.
    async fn modify_token(
        &self,
        key: &str,
        token_name: Option<Option<String>>,
        scopes: Option<Vec<String>>,
        expires: Option<Option<DateTime<Utc>>>,
    ) -> Result<()>;

    /// Whether `username` is a member of the admin set.
    async fn is_admin(&self, username: &str) -> Result<bool>;

    /// Add `username` to the admin set (idempotent).
    async fn add_admin(&self, username: &str) -> Result<()>;

    /// Append a history record.
    async fn append_history(&self, entry: &HistoryEntry) -> Result<()>;

    /// List history entries for a token, most recent first.
    async fn token_history(&self, key: &str) -> Result<Vec<HistoryEntry>>;

    /// Delete history rows older than `horizon`, returning the count removed.
    async fn expire_history(&self, horizon: DateTime<Utc>) -> Result<u64>;

    /// List token keys whose `expires` has elapsed but have not yet had an
    /// `expire` history entry recorded, for the periodic reaper.
    async fn newly_expired_tokens(&self) -> Result<Vec<TokenInfo>>;
}

/// Postgres-backed [`RelationalStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to an already-migrated database.
    ///
    /// Schema migrations are explicitly out of scope for the core (§1 of
    /// the design) and are the responsibility of the deployment's migration
    /// tooling; this only opens the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with [`crate::store::docstore::PostgresDocStore`]
    /// rather than opening a second connection pool against the same database.
    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    fn row_to_token_info(row: &sqlx::postgres::PgRow) -> sqlx::Result<TokenInfo> {
        let token_type_str: String = row.try_get("token_type")?;
        let token_type = parse_token_type(&token_type_str);
        Ok(TokenInfo {
            token_key: row.try_get("token_key")?,
            username: row.try_get("username")?,
            token_type,
            token_name: row.try_get("token_name")?,
            service: row.try_get("service")?,
            scopes: row
                .try_get::<String, _>("scopes")?
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            created: row.try_get("created")?,
            last_used: row.try_get("last_used")?,
            expires: row.try_get("expires")?,
            parent_key: row.try_get("parent_key")?,
            identity_key: row.try_get("identity_key")?,
        })
    }
}

fn parse_token_type(s: &str) -> TokenType {
    match s {
        "user" => TokenType::User,
        "notebook" => TokenType::Notebook,
        "internal" => TokenType::Internal,
        "service" => TokenType::Service,
        "oidc" => TokenType::Oidc,
        _ => TokenType::Session,
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn insert_token_info(&self, info: &TokenInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_info
                (token_key, username, token_type, token_name, service, scopes,
                 created, last_used, expires, parent_key, identity_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&info.token_key)
        .bind(&info.username)
        .bind(info.token_type.to_string())
        .bind(&info.token_name)
        .bind(&info.service)
        .bind(info.scopes.join(","))
        .bind(info.created)
        .bind(info.last_used)
        .bind(info.expires)
        .bind(&info.parent_key)
        .bind(&info.identity_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_derived_if_absent(&self, info: &TokenInfo) -> Result<TokenInfo> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO token_info
                (token_key, username, token_type, token_name, service, scopes,
                 created, last_used, expires, parent_key, identity_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (identity_key) DO NOTHING",
        )
        .bind(&info.token_key)
        .bind(&info.username)
        .bind(info.token_type.to_string())
        .bind(&info.token_name)
        .bind(&info.service)
        .bind(info.scopes.join(","))
        .bind(info.created)
        .bind(info.last_used)
        .bind(info.expires)
        .bind(&info.parent_key)
        .bind(&info.identity_key)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM token_info WHERE identity_key = $1")
            .bind(&info.identity_key)
            .fetch_one(&mut *tx)
            .await?;
        let winner = Self::row_to_token_info(&row)?;
        tx.commit().await?;
        Ok(winner)
    }

    async fn get_token_info(&self, key: &str) -> Result<Option<TokenInfo>> {
        let row = sqlx::query("SELECT * FROM token_info WHERE token_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_token_info).transpose().map_err(Error::from)
    }

    async fn touch_last_used(&self, key: &str, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE token_info SET last_used = $1 WHERE token_key = $2")
            .bind(when)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_token(&self, key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM token_info WHERE parent_key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM token_info WHERE token_key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_tokens(&self, username: &str) -> Result<Vec<TokenInfo>> {
        let rows = sqlx::query("SELECT * FROM token_info WHERE username = $1 ORDER BY created DESC")
            .bind(username)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_token_info).collect::<sqlx::Result<_>>().map_err(Error::from)
    }

    async fn modify_token(
        &self,
        key: &str,
        token_name: Option<Option<String>>,
        scopes: Option<Vec<String>>,
        expires: Option<Option<DateTime<Utc>>>,
    ) -> Result<()> {
        if let Some(name) = token_name {
            sqlx::query("UPDATE token_info SET token_name = $1 WHERE token_key = $2")
                .bind(name)
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        if let Some(scopes) = scopes {
            sqlx::query("UPDATE token_info SET scopes = $1 WHERE token_key = $2")
                .bind(scopes.join(","))
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        if let Some(expires) = expires {
            sqlx::query("UPDATE token_info SET expires = $1 WHERE token_key = $2")
                .bind(expires)
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn is_admin(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM admins WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn add_admin(&self, username: &str) -> Result<()> {
        sqlx::query("INSERT INTO admins (username) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_history
                (token_key, username, action, actor, scopes, expires, ip_address, event_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&entry.token_key)
        .bind(&entry.username)
        .bind(history_action_str(entry.action))
        .bind(&entry.actor)
        .bind(entry.scopes.join(","))
        .bind(entry.expires)
        .bind(&entry.ip_address)
        .bind(entry.event_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn token_history(&self, key: &str) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM token_history WHERE token_key = $1 ORDER BY event_time DESC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> sqlx::Result<HistoryEntry> {
                Ok(HistoryEntry {
                    token_key: row.try_get("token_key")?,
                    username: row.try_get("username")?,
                    action: parse_history_action(&row.try_get::<String, _>("action")?),
                    actor: row.try_get("actor")?,
                    scopes: row
                        .try_get::<String, _>("scopes")?
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    expires: row.try_get("expires")?,
                    ip_address: row.try_get("ip_address")?,
                    event_time: row.try_get("event_time")?,
                })
            })
            .collect::<sqlx::Result<_>>()
            .map_err(Error::from)
    }

    async fn expire_history(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM token_history WHERE event_time < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn newly_expired_tokens(&self) -> Result<Vec<TokenInfo>> {
        let rows = sqlx::query("SELECT * FROM token_info WHERE expires IS NOT NULL AND expires <= now()")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_token_info).collect::<sqlx::Result<_>>().map_err(Error::from)
    }
}

fn history_action_str(action: HistoryAction) -> &'static str {
    match action {
        HistoryAction::Create => "create",
        HistoryAction::Edit => "edit",
        HistoryAction::Expire => "expire",
        HistoryAction::Revoke => "revoke",
    }
}

fn parse_history_action(s: &str) -> HistoryAction {
    match s {
        "edit" => HistoryAction::Edit,
        "expire" => HistoryAction::Expire,
        "revoke" => HistoryAction::Revoke,
        _ => HistoryAction::Create,
    }
}
