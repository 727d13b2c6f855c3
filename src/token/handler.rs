//! HTTP wiring for `/auth/tokens/*` (§4.1 "management surface", §6):
//! list/create/inspect/modify/delete a token and read its history.
//!
//! Every route authenticates the caller the same way `/auth` does (session
//! cookie or `Authorization: Bearer`), then resolves a target username from
//! either the path (`POST /auth/tokens` creating for oneself) or a
//! `username` query parameter. Acting on a username other than the caller's
//! own requires the caller to be in the `Admin` set.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authorize::evaluator::resolve_credential;
use crate::crypto::CookieCipher;
use crate::session::SessionCookie;
use crate::token::model::{HistoryEntry, NewSessionIdentity, TokenData, TokenInfo};
use crate::token::service::TokenService;
use crate::{Error, Result};

/// Shared state behind the token-management routes.
pub struct TokenManagementState {
    pub token_service: Arc<TokenService>,
    pub cookie_cipher: CookieCipher,
}

/// Build the `/auth/tokens/*` routes.
#[must_use]
pub fn routes(state: Arc<TokenManagementState>) -> Router {
    Router::new()
        .route("/auth/tokens", get(list_tokens).post(create_token))
        .route(
            "/auth/tokens/{key}",
            get(get_token).patch(modify_token).delete(delete_token),
        )
        .route("/auth/tokens/{key}/history", get(token_history))
        .with_state(state)
}

/// `?username=` query parameter shared by the routes that can target
/// another user's tokens, admin-gated.
#[derive(Debug, Deserialize, Default)]
struct UsernameQuery {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    #[serde(default)]
    username: Option<String>,
    token_name: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreatedToken {
    token: String,
    token_key: String,
}

#[derive(Debug, Deserialize, Default)]
struct ModifyTokenRequest {
    #[serde(default)]
    token_name: Option<Option<String>>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(default)]
    expires: Option<Option<DateTime<Utc>>>,
}

async fn list_tokens(
    State(state): State<Arc<TokenManagementState>>,
    headers: HeaderMap,
    Query(query): Query<UsernameQuery>,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    let target = match authorize_target(&state, &caller, query.username.as_deref()).await {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };
    match state.token_service.list(&target).await {
        Ok(tokens) => Json(tokens).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn create_token(
    State(state): State<Arc<TokenManagementState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTokenRequest>,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    let target = match authorize_target(&state, &caller, body.username.as_deref()).await {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };

    let scopes: HashSet<String> = body.scopes.into_iter().collect();
    let identity = NewSessionIdentity {
        name: caller.name.clone(),
        email: caller.email.clone(),
        uid: caller.uid,
        gid: caller.gid,
        groups: caller.groups.clone(),
    };
    match state
        .token_service
        .create_user_token(&target, body.token_name, scopes, identity, body.expires, &caller.username, client_ip(&headers))
        .await
    {
        Ok(token) => {
            (StatusCode::CREATED, Json(CreatedToken { token: token.to_string(), token_key: token.key.clone() })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_token(State(state): State<Arc<TokenManagementState>>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    match fetch_owned(&state, &caller, &key).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn modify_token(
    State(state): State<Arc<TokenManagementState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<ModifyTokenRequest>,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = fetch_owned(&state, &caller, &key).await {
        return err.into_response();
    }
    match state
        .token_service
        .modify(&key, &caller.username, body.token_name, body.scopes, body.expires, client_ip(&headers))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_token(State(state): State<Arc<TokenManagementState>>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = fetch_owned(&state, &caller, &key).await {
        return err.into_response();
    }
    match state.token_service.delete(&key, &caller.username, client_ip(&headers)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn token_history(State(state): State<Arc<TokenManagementState>>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = fetch_owned(&state, &caller, &key).await {
        return err.into_response();
    }
    match state.token_service.token_history(&key).await {
        Ok(history) => Json(history).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Load `key`'s info and confirm the caller may see it: the owner, or an
/// admin acting on someone else's token.
async fn fetch_owned(state: &TokenManagementState, caller: &TokenData, key: &str) -> Result<TokenInfo> {
    let Some(info) = state.token_service.get_info(key).await? else {
        return Err(Error::NotFound(format!("token {key}")));
    };
    if info.username != caller.username && !state.token_service.is_admin(&caller.username).await? {
        return Err(Error::Forbidden("not permitted to operate on another user's token".to_string()));
    }
    Ok(info)
}

/// Resolve the username these routes should act on: the caller's own,
/// unless a different `username` was requested, which requires the
/// caller to be an admin.
async fn authorize_target(state: &TokenManagementState, caller: &TokenData, requested: Option<&str>) -> Result<String> {
    match requested {
        None | Some("") => Ok(caller.username.clone()),
        Some(username) if username == caller.username => Ok(username.to_string()),
        Some(username) => {
            if state.token_service.is_admin(&caller.username).await? {
                Ok(username.to_string())
            } else {
                Err(Error::Forbidden("not permitted to operate on another user's tokens".to_string()))
            }
        }
    }
}

/// Resolve the caller's own token the same way `/auth` does: session
/// cookie first, then `Authorization: Bearer`.
async fn authenticate(state: &TokenManagementState, headers: &HeaderMap) -> Result<TokenData> {
    let cookie_token = current_session_token(&state.cookie_cipher, headers);
    let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).map(str::to_string);
    let resolved = resolve_credential(cookie_token.as_deref(), authorization.as_deref())?;
    let Some(token_str) = resolved else {
        return Err(Error::InvalidToken("credentials required".to_string()));
    };
    let Some(data) = state.token_service.get_data(&token_str).await? else {
        return Err(Error::InvalidToken("token is invalid or expired".to_string()));
    };
    Ok(data)
}

fn current_session_token(cipher: &CookieCipher, headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    SessionCookie::from_header(cipher, cookie_header)?.token
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::RelationalStore;
    use crate::store::kv::InMemoryKvStore;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct MemoryRelationalStore {
        tokens: Mutex<Vec<TokenInfo>>,
        admins: Mutex<HashSet<String>>,
        history: Mutex<Vec<HistoryEntry>>,
    }

    impl MemoryRelationalStore {
        fn new() -> Self {
            Self { tokens: Mutex::new(Vec::new()), admins: Mutex::new(HashSet::new()), history: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
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
        async fn delete_token(&self, key: &str) -> Result<()> {
            self.tokens.lock().await.retain(|t| t.token_key != key);
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
            let mut tokens = self.tokens.lock().await;
            let Some(info) = tokens.iter_mut().find(|t| t.token_key == key) else {
                return Err(Error::NotFound(format!("token {key}")));
            };
            if let Some(name) = token_name {
                info.token_name = name;
            }
            if let Some(scopes) = scopes {
                info.scopes = scopes;
            }
            if let Some(expires) = expires {
                info.expires = expires;
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
        async fn expire_history(&self, _horizon: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn newly_expired_tokens(&self) -> Result<Vec<TokenInfo>> {
            Ok(Vec::new())
        }
    }

    fn build_state() -> (Arc<TokenManagementState>, Arc<TokenService>, Arc<MemoryRelationalStore>) {
        let kv = Arc::new(InMemoryKvStore::new());
        let db = Arc::new(MemoryRelationalStore::new());
        let token_service = Arc::new(TokenService::new(kv, db.clone(), Duration::from_secs(3600), Duration::from_secs(60)));
        let state = Arc::new(TokenManagementState {
            token_service: token_service.clone(),
            cookie_cipher: CookieCipher::new(&[7u8; 32]).unwrap(),
        });
        (state, token_service, db)
    }

    #[tokio::test]
    async fn authorize_target_defaults_to_caller() {
        let (state, token_service, _db) = build_state();
        let token = token_service
            .create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), None, None)
            .await
            .unwrap();
        let caller = token_service.get_by_key(&token.key).await.unwrap().unwrap();
        let target = authorize_target(&state, &caller, None).await.unwrap();
        assert_eq!(target, "alice");
    }

    #[tokio::test]
    async fn authorize_target_rejects_non_admin_acting_on_other_user() {
        let (state, token_service) = build_state();
        let token = token_service
            .create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), None, None)
            .await
            .unwrap();
        let caller = token_service.get_by_key(&token.key).await.unwrap().unwrap();
        let err = authorize_target(&state, &caller, Some("bob")).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn authorize_target_allows_admin_acting_on_other_user() {
        let (state, token_service) = build_state();
        token_service.db_add_admin_for_test("alice").await;
        let token = token_service
            .create_session_token("alice", HashSet::new(), NewSessionIdentity::default(), None, None)
            .await
            .unwrap();
        let caller = token_service.get_by_key(&token.key).await.unwrap().unwrap();
        let target = authorize_target(&state, &caller, Some("bob")).await.unwrap();
        assert_eq!(target, "bob");
    }
}
