//! `/login` and `/logout` HTTP wiring for the Relying Party flow (§4.5, §6).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use tracing::warn;

use super::provider::Provider;
use crate::crypto::CookieCipher;
use crate::external::Alerter;
use crate::session::SessionCookie;
use crate::store::RelationalStore;
use crate::token::{NewSessionIdentity, TokenService};
use crate::userinfo::UserInfoService;
use crate::{Error, Result};

/// How long a login attempt may sit unfinished before the callback rejects
/// it, guarding against a stale cookie replaying an old `state`.
const LOGIN_ATTEMPT_TIMEOUT: chrono::Duration = chrono::Duration::minutes(10);

/// Shared state behind the RP login/logout routes.
pub struct OidcRpState {
    pub provider: Provider,
    pub token_service: Arc<TokenService>,
    pub userinfo_service: Arc<UserInfoService>,
    pub db: Arc<dyn RelationalStore>,
    pub cookie_cipher: CookieCipher,
    /// Inverted `group_mapping`, from [`crate::config::Config::group_to_scopes`].
    pub group_to_scopes: HashMap<String, HashSet<String>>,
    pub initial_admins: Vec<String>,
    pub after_logout_url: String,
    /// Notified once per occurrence of [`Error::IdAllocationExhausted`].
    pub alerter: Arc<dyn Alerter>,
}

/// Build the `/login` and `/logout` routes.
#[must_use]
pub fn routes(state: Arc<OidcRpState>) -> Router {
    Router::new().route("/login", get(login)).route("/logout", get(logout)).with_state(state)
}

/// `GET /login` query parameters: `rd` on the initial hit, `code`/`state`
/// when the upstream provider redirects back to us (our own `/login` is the
/// configured `redirect_uri`, per §4.5).
#[derive(Debug, Deserialize, Default)]
pub struct LoginQuery {
    #[serde(default)]
    pub rd: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

async fn login(State(state): State<Arc<OidcRpState>>, headers: HeaderMap, Query(query): Query<LoginQuery>) -> Response {
    if let Some(error) = &query.error {
        warn!(%error, "upstream login denied");
        return (StatusCode::FORBIDDEN, format!("login failed: {error}")).into_response();
    }

    match query.code {
        Some(code) => callback(&state, &headers, &code, query.state.as_deref()).await,
        None => start(&state, &headers, query.rd).into_response(),
    }
}

fn start(state: &OidcRpState, headers: &HeaderMap, rd: Option<String>) -> Response {
    let csrf = random_csrf();
    let redirect_uri = login_redirect_uri(headers);
    let authorize_url = state.provider.authorize_url(&csrf, &redirect_uri);

    let cookie = SessionCookie { csrf: Some(csrf), return_url: rd, login_start: Some(Utc::now()), ..Default::default() };
    let Ok(wire) = cookie.encode(&state.cookie_cipher) else {
        return Error::Internal("failed to encode session cookie".to_string()).into_response();
    };

    let mut response = Redirect::to(&authorize_url).into_response();
    set_session_cookie(&mut response, &wire);
    response
}

async fn callback(state: &OidcRpState, headers: &HeaderMap, code: &str, returned_state: Option<&str>) -> Response {
    let Some(pending) = current_session(&state.cookie_cipher, headers) else {
        return Error::InvalidRequest("no login attempt in progress".to_string()).into_response();
    };
    let Some(expected_csrf) = &pending.csrf else {
        return Error::InvalidRequest("no login attempt in progress".to_string()).into_response();
    };
    if returned_state != Some(expected_csrf.as_str()) {
        return Error::InvalidRequest("state parameter does not match".to_string()).into_response();
    }
    let stale = pending
        .login_start
        .is_some_and(|started| Utc::now() - started > LOGIN_ATTEMPT_TIMEOUT);
    if stale {
        return Error::InvalidRequest("login attempt expired, please try again".to_string()).into_response();
    }

    let redirect_uri = login_redirect_uri(headers);
    let claims = match state.provider.complete(code, &redirect_uri).await {
        Ok(claims) => claims,
        Err(err) => {
            warn!(error = %err, "upstream login callback failed");
            return err.into_response();
        }
    };

    let user_info = match state.userinfo_service.user_info_from_claims(&claims).await {
        Ok(info) => info,
        Err(err) => {
            if let Error::IdAllocationExhausted(kind) = &err {
                state.alerter.alert("UID/GID allocation exhausted", &format!("no available {kind} during login"));
            }
            return err.into_response();
        }
    };

    if let Err(err) = ensure_bootstrap_admin(state, &user_info.username).await {
        return err.into_response();
    }

    let scopes = scopes_for_groups(&state.group_to_scopes, &user_info.groups);
    let identity = NewSessionIdentity {
        name: user_info.name.clone(),
        email: user_info.email.clone(),
        uid: user_info.uid,
        gid: user_info.gid,
        groups: user_info.groups.clone(),
    };
    let ip_address = client_ip(headers);
    let token = match state.token_service.create_session_token(&user_info.username, scopes, identity, None, ip_address).await {
        Ok(token) => token,
        Err(err) => return err.into_response(),
    };

    let new_cookie = SessionCookie { token: Some(token.to_string()), ..Default::default() };
    let Ok(wire) = new_cookie.encode(&state.cookie_cipher) else {
        return Error::Internal("failed to encode session cookie".to_string()).into_response();
    };

    let destination = pending.return_url.unwrap_or_else(|| "/".to_string());
    let mut response = Redirect::to(&destination).into_response();
    set_session_cookie(&mut response, &wire);
    response
}

async fn logout(State(state): State<Arc<OidcRpState>>, headers: HeaderMap) -> Response {
    if let Some(session) = current_session(&state.cookie_cipher, &headers) {
        if let Some(token) = &session.token {
            if let Ok(parsed) = token.parse::<crate::token::Token>() {
                let _ = state.token_service.delete(&parsed.key, "logout", client_ip(&headers)).await;
            }
        }
    }

    let mut response = Redirect::to(&state.after_logout_url).into_response();
    clear_session_cookie(&mut response);
    response
}

/// Bootstraps the `initial_admins` set on first login, matching §4.5's
/// "Admin: bootstrapped from configuration at first init."
async fn ensure_bootstrap_admin(state: &OidcRpState, username: &str) -> Result<()> {
    if !state.initial_admins.iter().any(|u| u == username) {
        return Ok(());
    }
    if state.db.is_admin(username).await? {
        return Ok(());
    }
    state.db.add_admin(username).await
}

fn scopes_for_groups(group_to_scopes: &HashMap<String, HashSet<String>>, groups: &[String]) -> HashSet<String> {
    let mut scopes = HashSet::new();
    for group in groups {
        if let Some(granted) = group_to_scopes.get(group) {
            scopes.extend(granted.iter().cloned());
        }
    }
    scopes
}

fn random_csrf() -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; 18];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// The absolute URL of our own `/login`, used as `redirect_uri` with the
/// upstream provider (§4.5). Trusts `Host`/`X-Forwarded-Proto` as seen by
/// this handler, which by the time it runs sit behind the trusted-proxy
/// middleware that validated the forwarding chain.
fn login_redirect_uri(headers: &HeaderMap) -> String {
    let scheme = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()).unwrap_or("https");
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("localhost");
    format!("{scheme}://{host}/login")
}

fn current_session(cipher: &CookieCipher, headers: &HeaderMap) -> Option<SessionCookie> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    SessionCookie::from_header(cipher, cookie_header)
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn set_session_cookie(response: &mut Response, wire: &str) {
    let value = format!("{}={wire}; Path=/; HttpOnly; Secure; SameSite=Lax", crate::session::COOKIE_NAME);
    if let Ok(header_value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(header::SET_COOKIE, header_value);
    }
}

fn clear_session_cookie(response: &mut Response) {
    let value = format!(
        "{}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0",
        crate::session::COOKIE_NAME
    );
    if let Ok(header_value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(header::SET_COOKIE, header_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_redirect_uri_prefers_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "gw.example.com".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(login_redirect_uri(&headers), "https://gw.example.com/login");
    }

    #[test]
    fn login_redirect_uri_defaults_to_https() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "gw.example.com".parse().unwrap());
        assert_eq!(login_redirect_uri(&headers), "https://gw.example.com/login");
    }

    #[test]
    fn scopes_for_groups_unions_across_memberships() {
        let mut mapping = HashMap::new();
        mapping.insert("admins".to_string(), ["exec:admin".to_string()].into_iter().collect());
        mapping.insert("readers".to_string(), ["read:all".to_string()].into_iter().collect());
        let scopes = scopes_for_groups(&mapping, &["admins".to_string(), "readers".to_string()]);
        assert_eq!(scopes, ["exec:admin".to_string(), "read:all".to_string()].into_iter().collect());
    }

    #[test]
    fn scopes_for_groups_ignores_unmapped_group() {
        let mapping = HashMap::new();
        let scopes = scopes_for_groups(&mapping, &["unmapped".to_string()]);
        assert!(scopes.is_empty());
    }

    #[test]
    fn random_csrf_is_not_empty_and_varies() {
        let a = random_csrf();
        let b = random_csrf();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
