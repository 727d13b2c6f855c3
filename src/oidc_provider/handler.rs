//! HTTP handlers for the OIDC Provider (§4.3): the authorization-code login
//! endpoint, token redemption, `userinfo`, and the discovery/JWKS documents.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::warn;

use super::service::{OidcProviderService, ProtocolError, protocol_error_redirect};
use crate::crypto::CookieCipher;
use crate::session::SessionCookie;
use crate::{Error, Result};

/// Shared state behind the OIDC Provider routes.
pub struct OidcProviderState {
    /// The pure-logic provider, shared with no other module.
    pub service: OidcProviderService,
    /// Used to read the caller's existing session out of its state cookie.
    pub cookie_cipher: CookieCipher,
}

/// `GET /auth/openid/login` query parameters (§4.3).
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Must be `code`; anything else is an `invalid_request` redirect.
    pub response_type: String,
    /// The requesting OAuth2 client.
    pub client_id: String,
    /// Must match the client's configured `return_uri`.
    pub redirect_uri: String,
    /// Space-separated scopes; must include `openid`.
    #[serde(default)]
    pub scope: String,
    /// Opaque value echoed back unchanged on the redirect.
    #[serde(default)]
    pub state: Option<String>,
    /// Carried through into the issued ID token's `nonce` claim.
    #[serde(default)]
    pub nonce: Option<String>,
}

/// `POST /auth/openid/token` form body (§4.3). `client_secret` arrives via
/// `client_secret_post`, the only auth method this provider advertises.
///
/// Every field is optional at the deserialization layer so a request
/// missing one entirely is still accepted by `axum::Form` and can be
/// reported as the spec-mandated `invalid_request` OAuth2 error rather than
/// axum's generic form-rejection response (§4.3 step 1).
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    /// Must be `authorization_code`.
    pub grant_type: Option<String>,
    /// The client redeeming the code.
    pub client_id: Option<String>,
    /// The client's secret, compared in constant time.
    pub client_secret: Option<String>,
    /// The authorization code to redeem.
    pub code: Option<String>,
    /// Must match the `redirect_uri` the code was issued for.
    pub redirect_uri: Option<String>,
}

/// `GET /auth/openid/userinfo` has no query parameters, just a bearer ID
/// token; kept as a named type so callers passing `?access_token=` (some
/// OIDC clients do this instead of a header) are still served.
#[derive(Debug, Deserialize)]
pub struct UserinfoQuery {
    /// Fallback for clients that pass the ID token as a query parameter
    /// instead of an `Authorization: Bearer` header.
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Build the OIDC Provider routes, mounted at the paths the discovery
/// document advertises.
#[must_use]
pub fn routes(state: Arc<OidcProviderState>) -> Router {
    Router::new()
        .route("/auth/openid/login", get(login))
        .route("/auth/openid/token", post(token))
        .route("/auth/openid/userinfo", get(userinfo))
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks.json", get(jwks))
        .with_state(state)
}

/// `GET /auth/openid/login`: validate the client and protocol parameters,
/// then either issue an authorization code for an already-authenticated
/// session or send the browser to `/login` to establish one (§4.3).
async fn login(State(state): State<Arc<OidcProviderState>>, headers: HeaderMap, Query(query): Query<LoginQuery>) -> Response {
    let validated = match state.service.validate_client(&query.client_id, &query.redirect_uri) {
        Ok(v) => v,
        Err(err) => return err.into_response(),
    };

    let protocol = match OidcProviderService::validate_protocol(&query.response_type, &query.scope) {
        Ok(scopes) => scopes,
        Err(err) => {
            return Redirect::to(&protocol_error_redirect(&query.redirect_uri, &err, query.state.as_deref())).into_response();
        }
    };
    let scopes = state.service.recognized_scopes(&protocol);

    let session = current_session(&state.cookie_cipher, &headers);
    let Some(token) = session.and_then(|s| s.token) else {
        let rd = format!(
            "/auth/openid/login?response_type={}&client_id={}&redirect_uri={}&scope={}{}{}",
            query.response_type,
            query.client_id,
            urlencoding(&query.redirect_uri),
            urlencoding(&query.scope),
            query.state.as_deref().map(|s| format!("&state={}", urlencoding(s))).unwrap_or_default(),
            query.nonce.as_deref().map(|n| format!("&nonce={}", urlencoding(n))).unwrap_or_default(),
        );
        return Redirect::temporary(&format!("/login?rd={}", urlencoding(&rd))).into_response();
    };

    let token_key = match token.parse::<crate::token::Token>() {
        Ok(t) => t.key,
        Err(_) => {
            let err = ProtocolError { error: "invalid_request", description: "session is no longer valid".to_string() };
            return Redirect::to(&protocol_error_redirect(&query.redirect_uri, &err, query.state.as_deref())).into_response();
        }
    };

    match state
        .service
        .authorize(validated.client.id.as_str(), &query.redirect_uri, &token_key, scopes, query.nonce.clone(), query.state.as_deref())
        .await
    {
        Ok(target) => Redirect::to(&target).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /auth/openid/token`: redeem an authorization code for an ID token
/// (§4.3). Responses carry `Cache-Control: no-store` and `Pragma: no-cache`
/// per RFC 6749 §5.1.
async fn token(State(state): State<Arc<OidcProviderState>>, axum::Form(body): axum::Form<TokenRequest>) -> Response {
    let result = match required_token_params(body) {
        Ok((grant_type, client_id, client_secret, code, redirect_uri)) => {
            state.service.redeem(&grant_type, &client_id, &client_secret, &code, &redirect_uri).await
        }
        Err(err) => Err(err),
    };

    let mut response = match result {
        Ok(token_response) => (StatusCode::OK, Json(token_response)).into_response(),
        Err(err) => {
            warn!(error = %err, "token redemption failed");
            oauth_error_response(&err)
        }
    };
    response.headers_mut().insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
    response.headers_mut().insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));
    response
}

/// `GET /auth/openid/userinfo`: return the claims of a previously-issued ID
/// token presented as a bearer credential (§4.3). An `Authorization` header
/// using any scheme other than `Bearer` is a 400 `invalid_request`, never a
/// 401 — only an actually-bad token is `invalid_token`.
async fn userinfo(State(state): State<Arc<OidcProviderState>>, headers: HeaderMap, Query(query): Query<UserinfoQuery>) -> Response {
    let id_token = match authorization_header(&headers) {
        Some(AuthorizationHeader::Bearer(token)) => token,
        Some(AuthorizationHeader::Other(scheme)) => {
            return Error::InvalidRequest(format!("Unknown Authorization type {scheme}")).into_response();
        }
        None => match query.access_token {
            Some(token) => token,
            None => return Error::InvalidToken("Unable to find token".to_string()).into_response(),
        },
    };
    match state.service.userinfo(&id_token) {
        Ok(claims) => Json(claims).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `GET /.well-known/openid-configuration` (§4.3, §6).
async fn discovery(State(state): State<Arc<OidcProviderState>>) -> Response {
    Json(state.service.discovery()).into_response()
}

/// `GET /.well-known/jwks.json` (§4.3).
async fn jwks(State(state): State<Arc<OidcProviderState>>) -> Response {
    Json(state.service.jwks()).into_response()
}

fn current_session(cipher: &CookieCipher, headers: &HeaderMap) -> Option<SessionCookie> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    SessionCookie::from_header(cipher, cookie_header)
}

/// An `Authorization` header, split into the `Bearer` case callers actually
/// want and everything else (wrong scheme, or bytes that aren't even valid
/// header text) — kept distinct from "no header at all" so callers can
/// report each case with its own status (§4.3).
enum AuthorizationHeader {
    Bearer(String),
    Other(String),
}

fn authorization_header(headers: &HeaderMap) -> Option<AuthorizationHeader> {
    let value = headers.get(header::AUTHORIZATION)?;
    let Ok(value) = value.to_str() else {
        return Some(AuthorizationHeader::Other(String::new()));
    };
    match value.strip_prefix("Bearer ") {
        Some(token) => Some(AuthorizationHeader::Bearer(token.to_string())),
        None => {
            let scheme = value.split_whitespace().next().unwrap_or(value);
            Some(AuthorizationHeader::Other(scheme.to_string()))
        }
    }
}

/// §4.3 token-endpoint step 1: every field must be present before
/// `grant_type` (or anything else) is even inspected.
fn required_token_params(body: TokenRequest) -> Result<(String, String, String, String, String)> {
    let grant_type = body.grant_type.ok_or_else(|| Error::InvalidRequest("missing grant_type".to_string()))?;
    let client_id = body.client_id.ok_or_else(|| Error::InvalidRequest("missing client_id".to_string()))?;
    let client_secret = body.client_secret.ok_or_else(|| Error::InvalidRequest("missing client_secret".to_string()))?;
    let code = body.code.ok_or_else(|| Error::InvalidRequest("missing code".to_string()))?;
    let redirect_uri = body.redirect_uri.ok_or_else(|| Error::InvalidRequest("missing redirect_uri".to_string()))?;
    Ok((grant_type, client_id, client_secret, code, redirect_uri))
}

fn urlencoding(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// RFC 6749 §5.2 error body for the token endpoint.
fn oauth_error_response(err: &Error) -> Response {
    let body = serde_json::json!({
        "error": err.oauth_error_code(),
        "error_description": err.to_string(),
    });
    (err.status(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_header_strips_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert!(matches!(authorization_header(&headers), Some(AuthorizationHeader::Bearer(t)) if t == "abc.def"));
    }

    #[test]
    fn authorization_header_flags_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(matches!(authorization_header(&headers), Some(AuthorizationHeader::Other(s)) if s == "Basic"));
    }

    #[test]
    fn authorization_header_absent_is_none() {
        assert!(authorization_header(&HeaderMap::new()).is_none());
    }

    #[test]
    fn required_token_params_reports_first_missing_field() {
        let body = TokenRequest { grant_type: Some("authorization_code".into()), ..Default::default() };
        let err = required_token_params(body).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }

    #[test]
    fn required_token_params_accepts_complete_body() {
        let body = TokenRequest {
            grant_type: Some("authorization_code".into()),
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            code: Some("code".into()),
            redirect_uri: Some("https://example.com/cb".into()),
        };
        assert!(required_token_params(body).is_ok());
    }

    #[test]
    fn current_session_reads_cookie_from_header() {
        let cipher = CookieCipher::new(&[8u8; 32]).unwrap();
        let state = SessionCookie { token: Some("gt-k.s".into()), ..Default::default() };
        let wire = state.encode(&cipher).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, format!("gafaelfawr={wire}").parse().unwrap());
        let decoded = current_session(&cipher, &headers).unwrap();
        assert_eq!(decoded.token.as_deref(), Some("gt-k.s"));
    }
}
