//! Token service: session token issuance, hot-path verification, derived
//! notebook/internal tokens, and the audit/reaper housekeeping paths (§4.1).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::store::{KvStore, RelationalStore};
use crate::token::model::{HistoryAction, HistoryEntry, Token, TokenData, TokenInfo, TokenType, identity_key};
use crate::{Error, Result};

/// User attributes folded into a freshly issued session token.
#[derive(Debug, Clone, Default)]
pub struct NewSessionIdentity {
    pub name: Option<String>,
    pub email: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: Vec<String>,
}

/// Result of [`TokenService::audit`].
#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    /// Tokens found past their expiry and (if `fix` was set) reaped.
    pub expired: Vec<String>,
}

/// Coordinates the key-value hot path and the relational system of record.
///
/// Derived-token creation is guarded two ways: an in-process per-identity
/// `tokio::sync::Mutex` (sharded by a `DashMap`) serializes concurrent
/// callers within this instance, and the relational store's `identity_key`
/// unique index with `INSERT ... ON CONFLICT DO NOTHING` (see
/// [`crate::store::db::PostgresStore::insert_derived_if_absent`]) makes the
/// guarantee hold across instances too. Either way exactly one row is ever
/// created per identity; a losing caller recovers the winner's bearer
/// secret from the key-value store it was written to (§4.1, §4.6, §8).
pub struct TokenService {
    kv: Arc<dyn KvStore>,
    db: Arc<dyn RelationalStore>,
    token_lifetime: StdDuration,
    minimum_lifetime_floor: StdDuration,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenService {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        db: Arc<dyn RelationalStore>,
        token_lifetime: StdDuration,
        minimum_lifetime_floor: StdDuration,
    ) -> Self {
        Self {
            kv,
            db,
            token_lifetime,
            minimum_lifetime_floor,
            creation_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn minimum_lifetime_floor(&self) -> StdDuration {
        self.minimum_lifetime_floor
    }

    #[must_use]
    pub fn configured_token_lifetime(&self) -> StdDuration {
        self.token_lifetime
    }

    fn lock_for(&self, identity: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn kv_key(key: &str) -> String {
        format!("token:{key}")
    }

    async fn store_data(&self, data: &TokenData) -> Result<()> {
        let ttl = data.expires.map(|exp| {
            let secs = (exp - Utc::now()).num_seconds().max(0);
            StdDuration::from_secs(u64::try_from(secs).unwrap_or(0))
        });
        let bytes = serde_json::to_vec(data)?;
        self.kv.set(&Self::kv_key(&data.key), &bytes, ttl).await
    }

    /// `create_session_token`: mint a top-level session token bounded only
    /// by configuration (no parent to inherit a shorter lifetime from).
    pub async fn create_session_token(
        &self,
        username: &str,
        scopes: HashSet<String>,
        identity: NewSessionIdentity,
        lifetime: Option<StdDuration>,
        ip_address: Option<String>,
    ) -> Result<Token> {
        let token = Token::new();
        let now = Utc::now();
        let lifetime = lifetime.unwrap_or(self.token_lifetime);
        let expires = Some(now + ChronoDuration::from_std(lifetime).unwrap_or(ChronoDuration::zero()));

        let data = TokenData {
            key: token.key.clone(),
            secret: token.secret.clone(),
            username: username.to_string(),
            token_type: TokenType::Session,
            scopes: scopes.clone(),
            created: now,
            expires,
            name: identity.name,
            email: identity.email,
            uid: identity.uid,
            gid: identity.gid,
            groups: identity.groups,
            parent_key: None,
            service: None,
        };
        self.store_data(&data).await?;

        let info = TokenInfo {
            token_key: token.key.clone(),
            username: username.to_string(),
            token_type: TokenType::Session,
            token_name: None,
            service: None,
            scopes: sorted_vec(&scopes),
            created: now,
            last_used: None,
            expires,
            parent_key: None,
            identity_key: None,
        };
        self.db.insert_token_info(&info).await?;
        self.record_history(&info, HistoryAction::Create, username, ip_address).await?;
        Ok(token)
    }

    /// `create_service_token`: mint a token for a non-interactive service
    /// principal (e.g. a Kubernetes-managed bot user), bounded by the
    /// caller-supplied absolute expiry rather than a relative lifetime.
    /// Used by [`crate::external::kubernetes::ServiceTokenMinter`], which
    /// computes its own expiry from the owning CRD's policy.
    pub async fn create_service_token(
        &self,
        username: &str,
        scopes: HashSet<String>,
        identity: NewSessionIdentity,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Token> {
        let token = Token::new();
        let now = Utc::now();

        let data = TokenData {
            key: token.key.clone(),
            secret: token.secret.clone(),
            username: username.to_string(),
            token_type: TokenType::Service,
            scopes: scopes.clone(),
            created: now,
            expires,
            name: identity.name,
            email: identity.email,
            uid: identity.uid,
            gid: identity.gid,
            groups: identity.groups,
            parent_key: None,
            service: Some(username.to_string()),
        };
        self.store_data(&data).await?;

        let info = TokenInfo {
            token_key: token.key.clone(),
            username: username.to_string(),
            token_type: TokenType::Service,
            token_name: None,
            service: Some(username.to_string()),
            scopes: sorted_vec(&scopes),
            created: now,
            last_used: None,
            expires,
            parent_key: None,
            identity_key: None,
        };
        self.db.insert_token_info(&info).await?;
        self.record_history(&info, HistoryAction::Create, "kubernetes-operator", None).await?;
        Ok(token)
    }

    /// `create_user_token`: mint a named, long-lived token a user creates
    /// for themselves (or, for an admin, for someone else) via the
    /// `/auth/tokens` management surface, bounded by an absolute expiry
    /// rather than the session-token lifetime.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_user_token(
        &self,
        username: &str,
        token_name: String,
        scopes: HashSet<String>,
        identity: NewSessionIdentity,
        expires: Option<DateTime<Utc>>,
        actor: &str,
        ip_address: Option<String>,
    ) -> Result<Token> {
        let token = Token::new();
        let now = Utc::now();

        let data = TokenData {
            key: token.key.clone(),
            secret: token.secret.clone(),
            username: username.to_string(),
            token_type: TokenType::User,
            scopes: scopes.clone(),
            created: now,
            expires,
            name: identity.name,
            email: identity.email,
            uid: identity.uid,
            gid: identity.gid,
            groups: identity.groups,
            parent_key: None,
            service: None,
        };
        self.store_data(&data).await?;

        let info = TokenInfo {
            token_key: token.key.clone(),
            username: username.to_string(),
            token_type: TokenType::User,
            token_name: Some(token_name),
            service: None,
            scopes: sorted_vec(&scopes),
            created: now,
            last_used: None,
            expires,
            parent_key: None,
            identity_key: None,
        };
        self.db.insert_token_info(&info).await?;
        self.record_history(&info, HistoryAction::Create, actor, ip_address).await?;
        Ok(token)
    }

    /// `get_data`: the hot path. Returns `None` for a malformed, unknown,
    /// mismatched-secret, or expired token rather than an error — callers
    /// map absence to `invalid_token` themselves.
    pub async fn get_data(&self, presented: &str) -> Result<Option<TokenData>> {
        let token: Token = match presented.parse() {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };
        let Some(bytes) = self.kv.get(&Self::kv_key(&token.key)).await? else {
            return Ok(None);
        };
        let data: TokenData = serde_json::from_slice(&bytes)?;
        if !Token::secret_matches(&token.secret, &data.secret) {
            return Ok(None);
        }
        if data.is_expired() {
            return Ok(None);
        }
        let _ = self.db.touch_last_used(&token.key, Utc::now()).await;
        Ok(Some(data))
    }

    /// Fetch `TokenData` directly by key, bypassing the secret check
    /// `get_data` performs. Used by the OIDC Provider's token endpoint,
    /// which already trusts its own authorization-code record and never
    /// sees the underlying session token's bearer secret.
    pub async fn get_by_key(&self, key: &str) -> Result<Option<TokenData>> {
        let Some(bytes) = self.kv.get(&Self::kv_key(key)).await? else {
            return Ok(None);
        };
        let data: TokenData = serde_json::from_slice(&bytes)?;
        if data.is_expired() {
            return Ok(None);
        }
        Ok(Some(data))
    }

    async fn get_derived_token(
        &self,
        parent: &TokenData,
        token_type: TokenType,
        service: Option<&str>,
        requested_scopes: Option<&[String]>,
        minimum_lifetime: Option<StdDuration>,
        ip_address: Option<String>,
    ) -> Result<Token> {
        self.check_minimum_lifetime(parent, minimum_lifetime)?;

        // §4.6: effective scopes = sorted(requested ∩ parent.scopes).
        let scopes: Vec<String> = match requested_scopes {
            Some(requested) => {
                let parent_scopes: HashSet<&str> = parent.scopes.iter().map(String::as_str).collect();
                let mut effective: Vec<String> =
                    requested.iter().filter(|s| parent_scopes.contains(s.as_str())).cloned().collect();
                effective.sort();
                effective.dedup();
                effective
            }
            None => sorted_vec(&parent.scopes),
        };

        let identity = identity_key(&parent.key, token_type, service, &scopes);
        let lock = self.lock_for(&identity);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let candidate_expires = lifetime_policy(parent.expires, now, self.token_lifetime);
        let candidate = Token::new();
        let candidate_info = TokenInfo {
            token_key: candidate.key.clone(),
            username: parent.username.clone(),
            token_type,
            token_name: None,
            service: service.map(str::to_string),
            scopes: scopes.clone(),
            created: now,
            last_used: None,
            expires: candidate_expires,
            parent_key: Some(parent.key.clone()),
            identity_key: Some(identity),
        };

        let winner_info = self.db.insert_derived_if_absent(&candidate_info).await?;

        if winner_info.token_key == candidate.key {
            let data = TokenData {
                key: candidate.key.clone(),
                secret: candidate.secret.clone(),
                username: parent.username.clone(),
                token_type,
                scopes: scopes.into_iter().collect(),
                created: now,
                expires: candidate_expires,
                name: parent.name.clone(),
                email: parent.email.clone(),
                uid: parent.uid,
                gid: parent.gid,
                groups: parent.groups.clone(),
                parent_key: Some(parent.key.clone()),
                service: service.map(str::to_string),
            };
            self.store_data(&data).await?;
            self.record_history(&candidate_info, HistoryAction::Create, &parent.username, ip_address).await?;
            Ok(candidate)
        } else {
            // Lost the race: recover the winner's bearer secret from its
            // own key-value record rather than minting a second token.
            let bytes = self
                .kv
                .get(&Self::kv_key(&winner_info.token_key))
                .await?
                .ok_or_else(|| Error::Internal("winning derived token missing from key-value store".to_string()))?;
            let data: TokenData = serde_json::from_slice(&bytes)?;
            Ok(Token { key: data.key, secret: data.secret })
        }
    }

    /// `get_notebook_token`: dedup identity `(parent_key, "notebook")`.
    pub async fn get_notebook_token(
        &self,
        parent: &TokenData,
        minimum_lifetime: Option<StdDuration>,
        ip_address: Option<String>,
    ) -> Result<Token> {
        self.get_derived_token(parent, TokenType::Notebook, None, None, minimum_lifetime, ip_address).await
    }

    /// `get_internal_token`: dedup identity `(parent_key, "internal",
    /// service, sorted(effective_scopes))`.
    pub async fn get_internal_token(
        &self,
        parent: &TokenData,
        service: &str,
        requested_scopes: &[String],
        minimum_lifetime: Option<StdDuration>,
        ip_address: Option<String>,
    ) -> Result<Token> {
        self.get_derived_token(parent, TokenType::Internal, Some(service), Some(requested_scopes), minimum_lifetime, ip_address)
            .await
    }

    fn check_minimum_lifetime(&self, parent: &TokenData, minimum_lifetime: Option<StdDuration>) -> Result<()> {
        let Some(requested) = minimum_lifetime else { return Ok(()) };
        let Some(parent_expires) = parent.expires else { return Ok(()) };
        let remaining = parent_expires - Utc::now();
        let requested_chrono = ChronoDuration::from_std(requested).unwrap_or(ChronoDuration::zero());
        let floor = ChronoDuration::from_std(self.minimum_lifetime_floor).unwrap_or(ChronoDuration::zero());
        if remaining < requested_chrono + floor {
            return Err(Error::LifetimeNotSatisfiable);
        }
        Ok(())
    }

    pub async fn list(&self, username: &str) -> Result<Vec<TokenInfo>> {
        self.db.list_tokens(username).await
    }

    pub async fn get_info(&self, key: &str) -> Result<Option<TokenInfo>> {
        self.db.get_token_info(key).await
    }

    /// `modify`: patch name/scopes/expiry, mirroring the change into the
    /// hot-path record when one is still present.
    pub async fn modify(
        &self,
        key: &str,
        actor: &str,
        token_name: Option<Option<String>>,
        scopes: Option<Vec<String>>,
        expires: Option<Option<DateTime<Utc>>>,
        ip_address: Option<String>,
    ) -> Result<()> {
        self.db.modify_token(key, token_name, scopes.clone(), expires).await?;
        let Some(info) = self.db.get_token_info(key).await? else {
            return Err(Error::NotFound(format!("token {key}")));
        };

        if let Some(bytes) = self.kv.get(&Self::kv_key(key)).await? {
            let mut data: TokenData = serde_json::from_slice(&bytes)?;
            if let Some(scopes) = &scopes {
                data.scopes = scopes.iter().cloned().collect();
            }
            if let Some(expires) = expires {
                data.expires = expires;
            }
            self.store_data(&data).await?;
        }

        self.record_history(&info, HistoryAction::Edit, actor, ip_address).await
    }

    /// `delete`: key-value entry first, then the relational row, then
    /// history — a crash between the two deletes leaves a row `audit` can
    /// still reconcile, never a token servable from the cache alone.
    pub async fn delete(&self, key: &str, actor: &str, ip_address: Option<String>) -> Result<()> {
        let Some(info) = self.db.get_token_info(key).await? else {
            return Err(Error::NotFound(format!("token {key}")));
        };
        self.kv.delete(&Self::kv_key(key)).await?;
        self.db.delete_token(key).await?;
        self.record_history(&info, HistoryAction::Revoke, actor, ip_address).await
    }

    /// `audit`: reconcile newly-expired relational rows against the
    /// key-value store. With `fix`, evicts the stale cache entry and
    /// records the `expire` history entry that a crashed reaper missed.
    pub async fn audit(&self, fix: bool) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        for info in self.db.newly_expired_tokens().await? {
            report.expired.push(info.token_key.clone());
            if fix {
                let _ = self.kv.delete(&Self::kv_key(&info.token_key)).await;
                self.record_history(&info, HistoryAction::Expire, "audit", None).await?;
            }
        }
        Ok(report)
    }

    /// Periodic sweep run from the reaper background task: records
    /// `expire` history for newly-elapsed tokens and deletes history rows
    /// older than the retention horizon. Returns the number of history
    /// rows pruned.
    pub async fn expire_tokens(&self, history_retention: StdDuration) -> Result<u64> {
        for info in self.db.newly_expired_tokens().await? {
            let _ = self.kv.delete(&Self::kv_key(&info.token_key)).await;
            self.record_history(&info, HistoryAction::Expire, "reaper", None).await?;
        }
        let horizon = Utc::now() - ChronoDuration::from_std(history_retention).unwrap_or(ChronoDuration::zero());
        self.db.expire_history(horizon).await
    }

    async fn record_history(&self, info: &TokenInfo, action: HistoryAction, actor: &str, ip_address: Option<String>) -> Result<()> {
        let entry = HistoryEntry {
            token_key: info.token_key.clone(),
            username: info.username.clone(),
            action,
            actor: actor.to_string(),
            scopes: info.scopes.clone(),
            expires: info.expires,
            ip_address,
            event_time: Utc::now(),
        };
        self.db.append_history(&entry).await
    }

    pub async fn token_history(&self, key: &str) -> Result<Vec<HistoryEntry>> {
        self.db.token_history(key).await
    }

    pub async fn is_admin(&self, username: &str) -> Result<bool> {
        self.db.is_admin(username).await
    }
}

/// Spawn the background reaper that periodically runs [`TokenService::expire_tokens`].
///
/// Grounded on the teacher's `key_server::store::spawn_reaper`: a plain
/// `tokio::time::interval` loop with a shutdown signal, logging failures
/// rather than propagating them (a single failed sweep should not bring
/// down the server; it will simply retry next tick).
pub fn spawn_reaper(
    service: Arc<TokenService>,
    interval: StdDuration,
    history_retention: StdDuration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match service.expire_tokens(history_retention).await {
                        Ok(removed) if removed > 0 => {
                            tracing::debug!(removed, "history retention reaper pruned rows");
                        }
                        Ok(_) => {}
                        Err(error) => tracing::warn!(%error, "token reaper sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("token reaper shutting down");
                    break;
                }
            }
        }
    })
}

/// `child.expires = min(parent.expires, now + configured_token_lifetime)`.
fn lifetime_policy(parent_expires: Option<DateTime<Utc>>, now: DateTime<Utc>, token_lifetime: StdDuration) -> Option<DateTime<Utc>> {
    let configured_bound = now + ChronoDuration::from_std(token_lifetime).unwrap_or(ChronoDuration::zero());
    match parent_expires {
        Some(parent) => Some(parent.min(configured_bound)),
        None => Some(configured_bound),
    }
}

fn sorted_vec(scopes: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = scopes.iter().cloned().collect();
    v.sort();
    v
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::store::kv::InMemoryKvStore;

    struct MemoryRelationalStore {
        tokens: Mutex<Vec<TokenInfo>>,
        history: Mutex<Vec<HistoryEntry>>,
        admins: Mutex<HashSet<String>>,
    }

    impl MemoryRelationalStore {
        fn new() -> Self {
            Self { tokens: Mutex::new(Vec::new()), history: Mutex::new(Vec::new()), admins: Mutex::new(HashSet::new()) }
        }
    }

    #[async_trait::async_trait]
    impl RelationalStore for MemoryRelationalStore {
        async fn insert_token_info(&self, info: &TokenInfo) -> Result<()> {
            self.tokens.lock().await.push(info.clone());
            Ok(())
        }

        async fn insert_derived_if_absent(&self, info: &TokenInfo) -> Result<TokenInfo> {
            let mut tokens = self.tokens.lock().await;
            if let Some(existing) =
                tokens.iter().find(|t| t.identity_key.is_some() && t.identity_key == info.identity_key)
            {
                return Ok(existing.clone());
            }
            tokens.push(info.clone());
            Ok(info.clone())
        }

        async fn get_token_info(&self, key: &str) -> Result<Option<TokenInfo>> {
            Ok(self.tokens.lock().await.iter().find(|t| t.token_key == key).cloned())
        }

        async fn touch_last_used(&self, key: &str, when: DateTime<Utc>) -> Result<()> {
            if let Some(t) = self.tokens.lock().await.iter_mut().find(|t| t.token_key == key) {
                t.last_used = Some(when);
            }
            Ok(())
        }

        async fn delete_token(&self, key: &str) -> Result<()> {
            self.tokens.lock().await.retain(|t| t.token_key != key && t.parent_key.as_deref() != Some(key));
            Ok(())
        }

        async fn list_tokens(&self, username: &str) -> Result<Vec<TokenInfo>> {
            Ok(self.tokens.lock().await.iter().filter(|t| t.username == username).cloned().collect())
        }

        async fn modify_token(
            &self,
            key: &str,
            token_name: Option<Option<String>>,
            scopes: Option<Vec<String>>,
            expires: Option<Option<DateTime<Utc>>>,
        ) -> Result<()> {
            if let Some(t) = self.tokens.lock().await.iter_mut().find(|t| t.token_key == key) {
                if let Some(name) = token_name {
                    t.token_name = name;
                }
                if let Some(scopes) = scopes {
                    t.scopes = scopes;
                }
                if let Some(expires) = expires {
                    t.expires = expires;
                }
            }
            Ok(())
        }

        async fn is_admin(&self, username: &str) -> Result<bool> {
            Ok(self.admins.lock().await.contains(username))
        }

        async fn add_admin(&self, username: &str) -> Result<()> {
            self.admins.lock().await.insert(username.to_string());
            Ok(())
        }

        async fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
            self.history.lock().await.push(entry.clone());
            Ok(())
        }

        async fn token_history(&self, key: &str) -> Result<Vec<HistoryEntry>> {
            Ok(self.history.lock().await.iter().filter(|h| h.token_key == key).cloned().collect())
        }

        async fn expire_history(&self, horizon: DateTime<Utc>) -> Result<u64> {
            let mut history = self.history.lock().await;
            let before = history.len();
            history.retain(|h| h.event_time >= horizon);
            Ok((before - history.len()) as u64)
        }

        async fn newly_expired_tokens(&self) -> Result<Vec<TokenInfo>> {
            let now = Utc::now();
            Ok(self.tokens.lock().await.iter().filter(|t| t.expires.is_some_and(|e| e <= now)).cloned().collect())
        }
    }

    fn service() -> TokenService {
        TokenService::new(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(MemoryRelationalStore::new()),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let svc = service();
        let scopes: HashSet<String> = ["read:all".to_string()].into_iter().collect();
        let token = svc
            .create_session_token("alice", scopes.clone(), NewSessionIdentity::default(), None, None)
            .await
            .unwrap();
        let data = svc.get_data(&token.to_string()).await.unwrap().unwrap();
        assert_eq!(data.username, "alice");
        assert_eq!(data.scopes, scopes);
    }

    #[tokio::test]
    async fn get_data_rejects_wrong_secret() {
        let svc = service();
        let token = svc.create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), None, None).await.unwrap();
        let forged = format!("gt-{}.wrongsecretwrongsecretxx", token.key);
        assert!(svc.get_data(&forged).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notebook_token_deduplicates_concurrent_requests() {
        let svc = Arc::new(service());
        let scopes: HashSet<String> = ["read:all".to_string()].into_iter().collect();
        let token = svc.create_session_token("alice", scopes, NewSessionIdentity::default(), None, None).await.unwrap();
        let parent = svc.get_data(&token.to_string()).await.unwrap().unwrap();

        let a = svc.get_notebook_token(&parent, None, None).await.unwrap();
        let b = svc.get_notebook_token(&parent, None, None).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn internal_token_scopes_are_intersected_with_parent() {
        let svc = service();
        let scopes: HashSet<String> = ["read:all".to_string(), "exec:admin".to_string()].into_iter().collect();
        let token = svc.create_session_token("alice", scopes, NewSessionIdentity::default(), None, None).await.unwrap();
        let parent = svc.get_data(&token.to_string()).await.unwrap().unwrap();

        let child_token = svc
            .get_internal_token(&parent, "svc", &["read:all".to_string(), "not:granted".to_string()], None, None)
            .await
            .unwrap();
        let child_data = svc.get_data(&child_token.to_string()).await.unwrap().unwrap();
        assert_eq!(child_data.scopes, ["read:all".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn child_expiry_never_exceeds_parent() {
        let svc = service();
        let token = svc
            .create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), Some(Duration::from_secs(60)), None)
            .await
            .unwrap();
        let parent = svc.get_data(&token.to_string()).await.unwrap().unwrap();
        let child = svc.get_notebook_token(&parent, None, None).await.unwrap();
        let child_data = svc.get_data(&child.to_string()).await.unwrap().unwrap();
        assert!(child_data.expires.unwrap() <= parent.expires.unwrap());
    }

    #[tokio::test]
    async fn minimum_lifetime_below_floor_fails() {
        let svc = service();
        let token = svc
            .create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), Some(Duration::from_secs(60)), None)
            .await
            .unwrap();
        let parent = svc.get_data(&token.to_string()).await.unwrap().unwrap();
        let result = svc.get_notebook_token(&parent, Some(Duration::from_secs(3600)), None).await;
        assert!(matches!(result, Err(Error::LifetimeNotSatisfiable)));
    }

    #[tokio::test]
    async fn delete_removes_token_from_both_stores() {
        let svc = service();
        let token = svc.create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), None, None).await.unwrap();
        svc.delete(&token.key, "alice", None).await.unwrap();
        assert!(svc.get_data(&token.to_string()).await.unwrap().is_none());
        assert!(svc.get_info(&token.key).await.unwrap().is_none());
    }
}
