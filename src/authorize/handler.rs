//! HTTP wiring for `GET /auth` and `GET /auth/anonymous` (§4.2, §6).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::warn;

use super::evaluator::{self, AuthQuery, Outcome};
use crate::crypto::CookieCipher;
use crate::error::www_authenticate;
use crate::external::Alerter;
use crate::session::SessionCookie;
use crate::token::{Token, TokenService};
use crate::userinfo::UserInfoService;
use crate::{Error, Result};

/// Shared state behind the authorization-evaluator routes.
pub struct AuthorizeState {
    pub token_service: Arc<TokenService>,
    pub userinfo_service: Arc<UserInfoService>,
    pub cookie_cipher: CookieCipher,
    /// Realm named in `WWW-Authenticate` challenges.
    pub realm: String,
    /// Notified once per occurrence of [`Error::IdAllocationExhausted`].
    pub alerter: Arc<dyn Alerter>,
}

/// Build the `/auth` routes.
#[must_use]
pub fn routes(state: Arc<AuthorizeState>) -> Router {
    Router::new()
        .route("/auth", get(auth))
        .route("/auth/anonymous", get(auth_anonymous))
        .with_state(state)
}

/// `GET /auth` (§4.2): the ingress `auth_request` evaluator.
async fn auth(State(state): State<Arc<AuthorizeState>>, headers: HeaderMap, Query(query): Query<AuthQuery>) -> Response {
    let is_ajax = is_ajax_request(&headers);

    if let Err(err) = evaluator::validate_preconditions(
        &query,
        state.token_service.configured_token_lifetime(),
        state.token_service.minimum_lifetime_floor(),
    ) {
        return err.into_response();
    }

    let cookie_token = current_session_token(&state.cookie_cipher, &headers);
    let authorization = bearer_header(&headers);
    let resolved = match evaluator::resolve_credential(cookie_token.as_deref(), authorization.as_deref()) {
        Ok(resolved) => resolved,
        Err(err) => return challenge_response(&err, query.auth_type.as_str(), &state.realm, is_ajax),
    };

    let Some(token_str) = resolved else {
        let err = Error::InvalidToken("Unable to find token".to_string());
        return challenge_response(&err, query.auth_type.as_str(), &state.realm, is_ajax);
    };

    let data = match state.token_service.get_data(&token_str).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            let err = Error::InvalidToken("token is invalid or expired".to_string());
            return challenge_response(&err, query.auth_type.as_str(), &state.realm, is_ajax);
        }
        Err(err) => return err.into_response(),
    };

    let minimum_lifetime = query.minimum_lifetime.map(Duration::from_secs);
    if let Err(err) = evaluator::check_minimum_lifetime(&data, minimum_lifetime) {
        return challenge_response(&err, query.auth_type.as_str(), &state.realm, is_ajax);
    }

    let required = query.required_scopes();
    if let Err(err) = evaluator::check_authorization(&required, query.satisfy, query.username.as_deref(), &data) {
        // already 403 per spec step 5; AJAX does not change an already-403 response.
        return challenge_response(&err, query.auth_type.as_str(), &state.realm, false);
    }

    let user_info = match state.userinfo_service.user_info_from_token(&data).await {
        Ok(info) => info,
        Err(err) => {
            warn!(error = %err, username = %data.username, "user-info lookup failed during /auth");
            if let Error::IdAllocationExhausted(kind) = &err {
                state.alerter.alert("UID/GID allocation exhausted", &format!("no available {kind} for {}", data.username));
            }
            return err.into_response();
        }
    };

    let ip_address = client_ip(&headers);
    let delegated = match mint_delegated_token(&state, &query, &data, minimum_lifetime, ip_address).await {
        Ok(delegated) => delegated,
        Err(err) => return err.into_response(),
    };

    let outcome = Outcome::build(&query, &data);
    build_success_response(&query, &user_info, &token_str, delegated.as_ref(), &outcome)
}

/// `GET /auth/anonymous` (§6): never challenges. Strips the gateway's own
/// cookie and bearer token from the reflected `Cookie`/`Authorization`
/// headers so a backend mounted behind it never sees gateway credentials,
/// regardless of whether the caller is authenticated.
async fn auth_anonymous(State(state): State<Arc<AuthorizeState>>, headers: HeaderMap) -> Response {
    let mut response = StatusCode::OK.into_response();

    if let Some(sanitized) = sanitize_cookie_header(&state.cookie_cipher, &headers) {
        if let Ok(value) = HeaderValue::from_str(&sanitized) {
            response.headers_mut().insert(header::COOKIE, value);
        }
    }

    response
}

async fn mint_delegated_token(
    state: &AuthorizeState,
    query: &AuthQuery,
    data: &crate::token::TokenData,
    minimum_lifetime: Option<Duration>,
    ip_address: Option<String>,
) -> Result<Option<Token>> {
    if query.notebook {
        let token = state.token_service.get_notebook_token(data, minimum_lifetime, ip_address).await?;
        return Ok(Some(token));
    }
    if let Some(service) = &query.delegate_to {
        let scopes = query.effective_delegate_scopes();
        let token = state.token_service.get_internal_token(data, service, &scopes, minimum_lifetime, ip_address).await?;
        return Ok(Some(token));
    }
    Ok(None)
}

fn build_success_response(
    query: &AuthQuery,
    user_info: &crate::userinfo::ResolvedUserInfo,
    presented_token: &str,
    delegated: Option<&Token>,
    outcome: &Outcome,
) -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();

    insert_header(headers, "x-auth-request-user", &user_info.username);
    if let Some(email) = &user_info.email {
        insert_header(headers, "x-auth-request-email", email);
    }
    if !user_info.groups.is_empty() {
        insert_header(headers, "x-auth-request-groups", &user_info.groups.join(","));
    }

    let effective_token = delegated.map(ToString::to_string).unwrap_or_else(|| presented_token.to_string());
    if delegated.is_some() {
        insert_header(headers, "x-auth-request-token", &effective_token);
    }
    if query.use_authorization {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {effective_token}")) {
            headers.insert(header::AUTHORIZATION, value);
        }
    }

    if !outcome.token_scopes.is_empty() {
        insert_header(headers, "x-auth-request-token-scopes", &outcome.token_scopes.join(" "));
    }
    if !outcome.required_scopes.is_empty() {
        insert_header(headers, "x-auth-request-token-scopes-accepted", &outcome.required_scopes.join(" "));
    }
    insert_header(headers, "x-auth-request-token-scopes-satisfy", outcome.satisfy.as_str());

    response
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(header::HeaderName::from_static(name), value);
    }
}

/// Builds the 400/401/403 response for a challenge-bearing error, applying
/// the AJAX rule (§4.2: `X-Requested-With: XMLHttpRequest` forces 403
/// instead of 401, never downgrading an already-higher status).
fn challenge_response(err: &Error, auth_type: &str, realm: &str, is_ajax: bool) -> Response {
    let Some(code) = err.challenge_code() else {
        return err.into_response();
    };

    let mut status = err.status();
    if is_ajax && status == StatusCode::UNAUTHORIZED {
        status = StatusCode::FORBIDDEN;
    }

    let scope = match err {
        Error::InsufficientScope { required } => Some(required.join(" ")),
        _ => None,
    };
    let challenge = www_authenticate(auth_type, realm, code, &err.to_string(), scope.as_deref());

    let mut response = (status, axum::Json(serde_json::json!({ "error": err.to_string() }))).into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response.headers_mut().insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store"));
    response
}

fn is_ajax_request(headers: &HeaderMap) -> bool {
    headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

fn current_session_token(cipher: &CookieCipher, headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    SessionCookie::from_header(cipher, cookie_header)?.token
}

fn bearer_header(headers: &HeaderMap) -> Option<String> {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Strips the gateway's session cookie out of a raw `Cookie` header,
/// returning the remainder (or `None` if nothing is left, so the header is
/// simply omitted rather than reflected empty).
fn sanitize_cookie_header(cipher: &CookieCipher, headers: &HeaderMap) -> Option<String> {
    let _ = cipher;
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    let remaining: Vec<&str> = raw
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.starts_with(&format!("{}=", crate::session::COOKIE_NAME)))
        .collect();
    if remaining.is_empty() {
        None
    } else {
        Some(remaining.join("; "))
    }
}

/// Best-effort client IP for history/audit logging; trusted-proxy
/// resolution of `X-Forwarded-For` happens in the `http` middleware layer
/// before this handler runs, so by the time we get here the header (if
/// present) has already been trimmed to the real client.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ajax_request_detects_header_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("x-requested-with", "xmlhttprequest".parse().unwrap());
        assert!(is_ajax_request(&headers));
    }

    #[test]
    fn is_ajax_request_false_when_absent() {
        assert!(!is_ajax_request(&HeaderMap::new()));
    }

    #[test]
    fn sanitize_cookie_header_strips_gateway_cookie_only() {
        let cipher = CookieCipher::new(&[9u8; 32]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "other=1; gafaelfawr=abc.def; third=2".parse().unwrap());
        let sanitized = sanitize_cookie_header(&cipher, &headers).unwrap();
        assert_eq!(sanitized, "other=1; third=2");
    }

    #[test]
    fn sanitize_cookie_header_none_when_only_gateway_cookie_present() {
        let cipher = CookieCipher::new(&[9u8; 32]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "gafaelfawr=abc.def".parse().unwrap());
        assert!(sanitize_cookie_header(&cipher, &headers).is_none());
    }

    #[test]
    fn challenge_response_applies_ajax_rule() {
        let err = Error::InvalidToken("missing".to_string());
        let response = challenge_response(&err, "Bearer", "test", true);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn challenge_response_defaults_to_401_without_ajax() {
        let err = Error::InvalidToken("missing".to_string());
        let response = challenge_response(&err, "Bearer", "test", false);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
