//! Error types for the gateway.
//!
//! One crate-wide [`Error`] enum, following the RFC 6749 / RFC 6750 error
//! taxonomy the authorization evaluator and OIDC Provider need. `to_http`
//! is the single place that turns an `Error` into an HTTP response; nothing
//! downstream of it hand-rolls a status code.

use std::io;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad YAML, missing secret file, validation failure).
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed request: bad `Authorization` header, conflicting query params.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials missing, expired, or fail secret comparison.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token scopes do not satisfy the required set, or `username` mismatch.
    #[error("insufficient scope")]
    InsufficientScope {
        /// The full set of scopes that were required, for the challenge header.
        required: Vec<String>,
    },

    /// `minimum_lifetime` cannot be satisfied given the configured token lifetime.
    #[error("requested minimum_lifetime is not achievable")]
    InvalidMinimumLifetime,

    /// Conflicting or malformed `delegate_to`/`service` query parameters.
    #[error("invalid delegate_to: {0}")]
    InvalidDelegateTo(String),

    /// `service` and `delegate_to` both set but disagree.
    #[error("invalid service: {0}")]
    InvalidService(String),

    /// OIDC Provider login endpoint: `redirect_uri` does not match the
    /// client's configured `return_uri` (§4.3).
    #[error("invalid redirect_uri: {0}")]
    InvalidRedirectUri(String),

    /// A derived token was requested with `min_lifetime` the parent cannot honor.
    #[error("lifetime not satisfiable")]
    LifetimeNotSatisfiable,

    /// LDAP, upstream IdP, or document-store call failed or timed out.
    #[error("external user-info error: {0}")]
    ExternalUserInfo(String),

    /// UID or GID namespace exhausted.
    #[error("no available {0}")]
    IdAllocationExhausted(&'static str),

    /// A claim required to resolve user identity is absent (§4.5).
    #[error("missing claim: {0}")]
    MissingClaims(String),

    /// A claim is present but cannot be parsed into the shape we expect.
    #[error("invalid token claim: {0}")]
    InvalidTokenClaims(String),

    /// An opaque identity could not be mapped to a username via LDAP.
    #[error("no username mapping for identity: {0}")]
    NoUsernameMapping(String),

    /// OAuth2 `invalid_grant` (RFC 6749 §5.2) — kept intentionally opaque.
    #[error("invalid_grant")]
    InvalidGrant,

    /// OAuth2 `invalid_client`.
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// OAuth2 `unsupported_grant_type`.
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,

    /// OIDC/JWT verification failure (bad signature, unknown `kid`, expired).
    #[error("oidc error: {0}")]
    Oidc(String),

    /// Token or cookie not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is authenticated but not permitted to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Relational store error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Key-value store error.
    #[error("key-value store error: {0}")]
    KeyValueStore(#[from] redis::RedisError),

    /// LDAP error.
    #[error("ldap error: {0}")]
    Ldap(String),

    /// JWT encode/decode error.
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound HTTP error (fetching upstream JWKS, exchanging codes).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown in progress.
    #[error("server shutdown")]
    Shutdown,

    /// Catch-all for invariant violations that should never surface verbatim.
    #[error("internal error: {0}")]
    Internal(String),
}

/// RFC 6750 `WWW-Authenticate` challenge codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeCode {
    /// Malformed request.
    InvalidRequest,
    /// Missing, expired, or otherwise unusable token.
    InvalidToken,
    /// Token does not carry the required scope(s).
    InsufficientScope,
}

impl ChallengeCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidToken => "invalid_token",
            Self::InsufficientScope => "insufficient_scope",
        }
    }
}

/// Builds an RFC 6750 `WWW-Authenticate` header value.
///
/// `auth_type` is `Bearer` or `Basic` per the `auth_type` query parameter;
/// `scope` is only emitted for `insufficient_scope` challenges.
#[must_use]
pub fn www_authenticate(
    auth_type: &str,
    realm: &str,
    code: ChallengeCode,
    description: &str,
    scope: Option<&str>,
) -> String {
    let mut value = format!(
        r#"{auth_type} realm="{realm}", error="{}", error_description="{description}""#,
        code.as_str()
    );
    if let Some(scope) = scope {
        value.push_str(&format!(r#", scope="{scope}""#));
    }
    value
}

impl Error {
    /// Whether this error corresponds to the `/auth` evaluator's
    /// 401/403-with-challenge family, and if so, which challenge code.
    #[must_use]
    pub fn challenge_code(&self) -> Option<ChallengeCode> {
        match self {
            Self::InvalidRequest(_) => Some(ChallengeCode::InvalidRequest),
            Self::InvalidToken(_) => Some(ChallengeCode::InvalidToken),
            Self::InsufficientScope { .. } => Some(ChallengeCode::InsufficientScope),
            _ => None,
        }
    }

    /// Status code this error maps to outside of the challenge-bearing
    /// `/auth` path (plain JSON error bodies, OAuth2 endpoints).
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidGrant
            | Self::InvalidClient(_)
            | Self::UnsupportedGrantType
            | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::InvalidMinimumLifetime | Self::InvalidDelegateTo(_) | Self::InvalidService(_) | Self::InvalidRedirectUri(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::InvalidToken(_) | Self::Oidc(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope { .. } | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::LifetimeNotSatisfiable => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MissingClaims(_) | Self::InvalidTokenClaims(_) | Self::NoUsernameMapping(_) => {
                StatusCode::UNAUTHORIZED
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The OAuth2 error code for an error raised from the OIDC Provider's
    /// token endpoint. Per §4.3, causes that should remain opaque to callers
    /// (RFC 6749 §10.2 oracle-attack mitigation) all collapse to `invalid_grant`.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            _ => "invalid_grant",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "error": self.to_string() });
        let mut response = (status, axum::Json(body)).into_response();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            || matches!(self, Self::ExternalUserInfo(_))
        {
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store"),
            );
        }
        response
    }
}
