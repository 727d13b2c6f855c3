//! Collaborator surface for a Kubernetes CRD controller reconciling
//! `GafaelfawrServiceToken` resources into `Secret` objects, grounded on
//! `storage/kubernetes.py` in the original implementation: the controller
//! resolves the identity a CRD names, asks the core for a token, and
//! stores the result in a `Secret` it owns. Minting is the only part that
//! belongs in this crate; watching CRDs, building `Secret` objects, and
//! setting owner references is the controller binary's job (spec.md §1
//! lists the Kubernetes CRD controller itself as out of scope).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::token::{NewSessionIdentity, Token, TokenService};
use crate::userinfo::ResolvedUserInfo;

/// Mints tokens for non-interactive service principals.
///
/// `expires` is an absolute instant rather than a duration: the
/// controller derives it from the owning `GafaelfawrServiceToken`'s own
/// policy (e.g. a fixed lifetime recorded on the CRD), not from this
/// crate's configured session-token lifetime.
#[async_trait]
pub trait ServiceTokenMinter: Send + Sync {
    /// Mint a token for `user_info` carrying `scopes`, expiring at
    /// `expires` (never, if `None`).
    async fn mint_token(
        &self,
        user_info: &ResolvedUserInfo,
        scopes: HashSet<String>,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Token>;
}

/// The production [`ServiceTokenMinter`], backed by the same
/// [`TokenService`] the HTTP surface uses.
pub struct TokenServiceMinter {
    token_service: Arc<TokenService>,
}

impl TokenServiceMinter {
    #[must_use]
    pub fn new(token_service: Arc<TokenService>) -> Self {
        Self { token_service }
    }
}

#[async_trait]
impl ServiceTokenMinter for TokenServiceMinter {
    async fn mint_token(
        &self,
        user_info: &ResolvedUserInfo,
        scopes: HashSet<String>,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Token> {
        let identity = NewSessionIdentity {
            name: user_info.name.clone(),
            email: user_info.email.clone(),
            uid: user_info.uid,
            gid: user_info.gid,
            groups: user_info.groups.clone(),
        };
        self.token_service
            .create_service_token(&user_info.username, scopes, identity, expires)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::RelationalStore;
    use crate::store::kv::InMemoryKvStore;
    use crate::token::model::{HistoryEntry, TokenInfo};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct MemoryRelationalStore {
        tokens: Mutex<Vec<TokenInfo>>,
        admins: Mutex<HashSet<String>>,
    }

    impl MemoryRelationalStore {
        fn new() -> Self {
            Self { tokens: Mutex::new(Vec::new()), admins: Mutex::new(HashSet::new()) }
        }
    }

    #[async_trait]
    impl RelationalStore for MemoryRelationalStore {
        async fn insert_token_info(&self, info: &TokenInfo) -> Result<()> {
            self.tokens.lock().await.push(info.clone());
            Ok(())
        }
        async fn insert_derived_if_absent(&self, info: &TokenInfo) -> Result<TokenInfo> {
            self.tokens.lock().await.push(info.clone());
            Ok(info.clone())
        }
        async fn get_token_info(&self, key: &str) -> Result<Option<TokenInfo>> {
            Ok(self.tokens.lock().await.iter().find(|t| t.token_key == key).cloned())
        }
        async fn touch_last_used(&self, _key: &str, _when: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
        async fn delete_token(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn list_tokens(&self, _username: &str) -> Result<Vec<TokenInfo>> {
            Ok(Vec::new())
        }
        async fn modify_token(
            &self,
            _key: &str,
            _token_name: Option<Option<String>>,
            _scopes: Option<Vec<String>>,
            _expires: Option<Option<DateTime<Utc>>>,
        ) -> Result<()> {
            Ok(())
        }
        async fn is_admin(&self, username: &str) -> Result<bool> {
            Ok(self.admins.lock().await.contains(username))
        }
        async fn add_admin(&self, username: &str) -> Result<()> {
            self.admins.lock().await.insert(username.to_string());
            Ok(())
        }
        async fn append_history(&self, _entry: &HistoryEntry) -> Result<()> {
            Ok(())
        }
        async fn token_history(&self, _key: &str) -> Result<Vec<HistoryEntry>> {
            Ok(Vec::new())
        }
        async fn expire_history(&self, _horizon: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn newly_expired_tokens(&self) -> Result<Vec<TokenInfo>> {
            Ok(Vec::new())
        }
    }

    fn user_info() -> ResolvedUserInfo {
        ResolvedUserInfo {
            username: "bot-ingest".to_string(),
            name: Some("Ingest Bot".to_string()),
            email: None,
            uid: Some(100042),
            gid: Some(100042),
            groups: vec!["g_ingest".to_string()],
        }
    }

    #[tokio::test]
    async fn mint_token_creates_a_service_token() {
        let kv = Arc::new(InMemoryKvStore::new());
        let db = Arc::new(MemoryRelationalStore::new());
        let service = Arc::new(TokenService::new(kv, db, Duration::from_secs(3600), Duration::from_secs(60)));
        let minter = TokenServiceMinter::new(service.clone());

        let scopes: HashSet<String> = ["read:ingest".to_string()].into_iter().collect();
        let token = minter.mint_token(&user_info(), scopes.clone(), None).await.unwrap();

        let data = service.get_by_key(&token.key).await.unwrap().unwrap();
        assert_eq!(data.username, "bot-ingest");
        assert_eq!(data.scopes, scopes);
        assert!(data.expires.is_none());
    }
}
