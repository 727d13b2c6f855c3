//! Pure authorization logic for `GET /auth` (§4.2): query parsing,
//! preconditions, credential resolution across cookie/Bearer/Basic, the
//! scope/`satisfy` combinator, and the username/lifetime checks. Kept free
//! of `axum` so every branch here is a plain unit test; [`super::handler`]
//! wires this to HTTP.

use std::collections::HashSet;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Deserializer};

use crate::token::TokenData;
use crate::{Error, Result};

/// The `satisfy` combinator (§4.2), default `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Satisfy {
    /// At least one required scope must be present.
    Any,
    /// Every required scope must be present.
    All,
}

impl Default for Satisfy {
    fn default() -> Self {
        Self::All
    }
}

impl Satisfy {
    /// The string this combinator renders as in the
    /// `X-Auth-Request-Token-Scopes-Satisfy` header.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
        }
    }
}

/// `auth_type` (§4.2), default `bearer`. Only affects the scheme named in
/// `WWW-Authenticate`; credential resolution itself always tries all three
/// forms (cookie, Bearer, Basic) in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// `WWW-Authenticate: Bearer ...`.
    Bearer,
    /// `WWW-Authenticate: Basic ...`.
    Basic,
}

impl Default for AuthType {
    fn default() -> Self {
        Self::Bearer
    }
}

impl AuthType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "Bearer",
            Self::Basic => "Basic",
        }
    }
}

fn deserialize_csv<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default())
}

/// `GET /auth` query parameters (§4.2).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthQuery {
    /// Required scopes; repeatable, at least one expected.
    pub scope: Vec<String>,
    /// Combinator applied to `scope`.
    pub satisfy: Satisfy,
    /// Challenge scheme named in `WWW-Authenticate`.
    pub auth_type: AuthType,
    /// Request a notebook child token in the response header.
    pub notebook: bool,
    /// Service name for an internal child token.
    pub delegate_to: Option<String>,
    /// Requested scopes on the internal child, comma-separated.
    #[serde(deserialize_with = "deserialize_csv")]
    pub delegate_scope: Vec<String>,
    /// Required remaining lifetime in seconds.
    pub minimum_lifetime: Option<u64>,
    /// Place the delegated token into the outbound `Authorization` header.
    pub use_authorization: bool,
    /// Must equal `delegate_to` if both are set.
    pub service: Option<String>,
    /// Restrict success to this specific username.
    pub username: Option<String>,
}

impl Default for AuthQuery {
    fn default() -> Self {
        Self {
            scope: Vec::new(),
            satisfy: Satisfy::default(),
            auth_type: AuthType::default(),
            notebook: false,
            delegate_to: None,
            delegate_scope: Vec::new(),
            minimum_lifetime: None,
            use_authorization: false,
            service: None,
            username: None,
        }
    }
}

impl AuthQuery {
    /// The scopes a delegated internal token should request: `delegate_scope`
    /// if given, otherwise the full required `scope` set (§4.2:
    /// `delegate_scope` "implicitly added to scope requirements" — when
    /// absent, delegation inherits whatever the caller already required).
    #[must_use]
    pub fn effective_delegate_scopes(&self) -> Vec<String> {
        if self.delegate_scope.is_empty() {
            self.scope.clone()
        } else {
            self.delegate_scope.clone()
        }
    }

    /// The full set of scopes this request actually requires, folding in
    /// `delegate_scope` (§4.2: "implicitly added to scope requirements").
    #[must_use]
    pub fn required_scopes(&self) -> Vec<String> {
        let mut required: Vec<String> = self.scope.clone();
        for scope in &self.delegate_scope {
            if !required.contains(scope) {
                required.push(scope.clone());
            }
        }
        required
    }
}

/// §4.2 preconditions, checked before any credential is resolved.
///
/// # Errors
///
/// Returns [`Error::InvalidDelegateTo`], [`Error::InvalidService`], or
/// [`Error::InvalidMinimumLifetime`] — all surfaced as 422.
pub fn validate_preconditions(
    query: &AuthQuery,
    configured_token_lifetime: Duration,
    minimum_lifetime_floor: Duration,
) -> Result<()> {
    if query.notebook && query.delegate_to.is_some() {
        return Err(Error::InvalidDelegateTo(
            "notebook and delegate_to are mutually exclusive".to_string(),
        ));
    }
    if let (Some(service), Some(delegate_to)) = (&query.service, &query.delegate_to) {
        if service != delegate_to {
            return Err(Error::InvalidService(format!(
                "service ({service}) and delegate_to ({delegate_to}) disagree"
            )));
        }
    }
    if let Some(requested) = query.minimum_lifetime {
        let ceiling = configured_token_lifetime.saturating_sub(minimum_lifetime_floor).as_secs();
        if requested > ceiling {
            return Err(Error::InvalidMinimumLifetime);
        }
    }
    Ok(())
}

/// The placeholder GitHub's device/basic flow expects in the unused half of
/// a Basic credential pair (§4.2 step 1c).
const OAUTH_BASIC_PLACEHOLDER: &str = "x-oauth-basic";

/// Resolve the presented bearer token string from the cookie-derived
/// session token (if any) and the raw `Authorization` header value, per
/// §4.2 step 1's ordering: cookie, then Bearer, then Basic (in either
/// `user:pass` orientation, falling back to `user` alone).
///
/// Returns `Ok(None)` when no credential is presented at all — the caller
/// maps that to 401 (or 403 under the AJAX rule), never an error here.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] for a malformed or unrecognized
/// `Authorization` scheme (400, per §4.2 step 1).
pub fn resolve_credential(cookie_token: Option<&str>, authorization: Option<&str>) -> Result<Option<String>> {
    if let Some(token) = cookie_token {
        return Ok(Some(token.to_string()));
    }
    let Some(authorization) = authorization else {
        return Ok(None);
    };

    if let Some(bearer) = authorization.strip_prefix("Bearer ") {
        let bearer = bearer.trim();
        if bearer.is_empty() {
            return Err(Error::InvalidRequest("empty Bearer credential".to_string()));
        }
        return Ok(Some(bearer.to_string()));
    }

    if let Some(basic) = authorization.strip_prefix("Basic ") {
        let decoded = BASE64_STANDARD
            .decode(basic.trim())
            .map_err(|_| Error::InvalidRequest("malformed Basic credential encoding".to_string()))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| Error::InvalidRequest("malformed Basic credential encoding".to_string()))?;
        let (user, pass) = text
            .split_once(':')
            .ok_or_else(|| Error::InvalidRequest("malformed Basic credential, expected user:pass".to_string()))?;

        if pass == OAUTH_BASIC_PLACEHOLDER {
            return Ok(Some(user.to_string()));
        }
        if user == OAUTH_BASIC_PLACEHOLDER {
            return Ok(Some(pass.to_string()));
        }
        return Ok(Some(user.to_string()));
    }

    Err(Error::InvalidRequest(format!(
        "unrecognized Authorization scheme in '{authorization}'"
    )))
}

/// §4.2 step 4/5: scope/`satisfy` combinator plus the `username` constraint.
///
/// # Errors
///
/// Returns [`Error::InsufficientScope`] (carrying the full required set for
/// the challenge header) if the scope check fails or `username` mismatches.
pub fn check_authorization(required: &[String], satisfy: Satisfy, username: Option<&str>, token: &TokenData) -> Result<()> {
    let authorized = match satisfy {
        Satisfy::Any => required.iter().any(|s| token.scopes.contains(s)),
        Satisfy::All => required.iter().all(|s| token.scopes.contains(s)),
    };
    if !authorized {
        return Err(Error::InsufficientScope { required: required.to_vec() });
    }
    if let Some(username) = username {
        if username != token.username {
            return Err(Error::InsufficientScope { required: required.to_vec() });
        }
    }
    Ok(())
}

/// §4.2 step 3: the presented token's own remaining lifetime, independent
/// of any derived-token minting the request may also trigger.
///
/// # Errors
///
/// Returns [`Error::InvalidToken`] with the description the spec mandates
/// verbatim ("Remaining token lifetime too short") when the presented
/// token does not have enough life left.
pub fn check_minimum_lifetime(token: &TokenData, minimum_lifetime: Option<Duration>) -> Result<()> {
    let Some(requested) = minimum_lifetime else { return Ok(()) };
    let Some(remaining) = token.remaining_lifetime() else {
        return Ok(());
    };
    let requested = chrono::Duration::from_std(requested).unwrap_or_else(|_| chrono::Duration::zero());
    if remaining < requested {
        return Err(Error::InvalidToken("Remaining token lifetime too short".to_string()));
    }
    Ok(())
}

/// Outcome of evaluating an already-authenticated, already-scope-checked
/// request: everything the handler needs to build the success response.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The set of scopes this request required (folded with `delegate_scope`).
    pub required_scopes: Vec<String>,
    /// `satisfy` combinator used.
    pub satisfy: Satisfy,
    /// The authenticated token's own granted scopes, sorted.
    pub token_scopes: Vec<String>,
}

impl Outcome {
    #[must_use]
    pub fn build(query: &AuthQuery, token: &TokenData) -> Self {
        let mut token_scopes: Vec<String> = token.scopes.iter().cloned().collect();
        token_scopes.sort();
        Self { required_scopes: query.required_scopes(), satisfy: query.satisfy, token_scopes }
    }
}

/// Whether the delegated-token scopes a caller asked for are (after
/// intersection with the parent) actually a subset of the parent's scopes
/// — always true after [`crate::token::TokenService::get_internal_token`]'s
/// own intersection, but checked here too so a caller can short-circuit
/// without minting when the intersection would be empty and at least one
/// scope was explicitly requested.
#[must_use]
pub fn has_any_common_scope(requested: &[String], parent_scopes: &HashSet<String>) -> bool {
    requested.is_empty() || requested.iter().any(|s| parent_scopes.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn token(scopes: &[&str], username: &str, expires: Option<chrono::DateTime<Utc>>) -> TokenData {
        TokenData {
            key: "k".into(),
            secret: "s".into(),
            username: username.into(),
            token_type: crate::token::TokenType::Session,
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            created: Utc::now(),
            expires,
            name: None,
            email: None,
            uid: None,
            gid: None,
            groups: Vec::new(),
            parent_key: None,
            service: None,
        }
    }

    #[test]
    fn notebook_and_delegate_to_conflict() {
        let query = AuthQuery { notebook: true, delegate_to: Some("svc".into()), ..Default::default() };
        let err = validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, Error::InvalidDelegateTo(_)));
    }

    #[test]
    fn service_and_delegate_to_must_agree() {
        let query = AuthQuery { service: Some("a".into()), delegate_to: Some("b".into()), ..Default::default() };
        let err = validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, Error::InvalidService(_)));
    }

    #[test]
    fn service_and_delegate_to_matching_is_fine() {
        let query = AuthQuery { service: Some("a".into()), delegate_to: Some("a".into()), ..Default::default() };
        assert!(validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn minimum_lifetime_above_ceiling_is_rejected() {
        let query = AuthQuery { minimum_lifetime: Some(3500), ..Default::default() };
        let err = validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, Error::InvalidMinimumLifetime));
    }

    #[test]
    fn minimum_lifetime_at_ceiling_is_accepted() {
        let query = AuthQuery { minimum_lifetime: Some(3300), ..Default::default() };
        assert!(validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn resolve_credential_prefers_cookie() {
        let resolved = resolve_credential(Some("gt-a.b"), Some("Bearer gt-c.d")).unwrap();
        assert_eq!(resolved.as_deref(), Some("gt-a.b"));
    }

    #[test]
    fn resolve_credential_falls_back_to_bearer() {
        let resolved = resolve_credential(None, Some("Bearer gt-c.d")).unwrap();
        assert_eq!(resolved.as_deref(), Some("gt-c.d"));
    }

    #[test]
    fn resolve_credential_basic_token_then_placeholder() {
        let pair = BASE64_STANDARD.encode("gt-a.b:x-oauth-basic");
        let resolved = resolve_credential(None, Some(&format!("Basic {pair}"))).unwrap();
        assert_eq!(resolved.as_deref(), Some("gt-a.b"));
    }

    #[test]
    fn resolve_credential_basic_placeholder_then_token() {
        let pair = BASE64_STANDARD.encode("x-oauth-basic:gt-a.b");
        let resolved = resolve_credential(None, Some(&format!("Basic {pair}"))).unwrap();
        assert_eq!(resolved.as_deref(), Some("gt-a.b"));
    }

    #[test]
    fn resolve_credential_basic_fallback_to_user() {
        let pair = BASE64_STANDARD.encode("gt-a.b:irrelevant");
        let resolved = resolve_credential(None, Some(&format!("Basic {pair}"))).unwrap();
        assert_eq!(resolved.as_deref(), Some("gt-a.b"));
    }

    #[test]
    fn resolve_credential_missing_is_none() {
        assert!(resolve_credential(None, None).unwrap().is_none());
    }

    #[test]
    fn resolve_credential_malformed_authorization_errors() {
        let err = resolve_credential(None, Some("Nonsense")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn resolve_credential_malformed_basic_errors() {
        let err = resolve_credential(None, Some("Basic not-valid-base64!!")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn check_authorization_satisfy_all_requires_every_scope() {
        let t = token(&["exec:test"], "alice", None);
        let err = check_authorization(&["exec:admin".into(), "exec:test".into()], Satisfy::All, None, &t).unwrap_err();
        assert!(matches!(err, Error::InsufficientScope { .. }));
    }

    #[test]
    fn check_authorization_satisfy_any_accepts_one_match() {
        let t = token(&["exec:test"], "alice", None);
        assert!(check_authorization(&["exec:admin".into(), "exec:test".into()], Satisfy::Any, None, &t).is_ok());
    }

    #[test]
    fn check_authorization_username_mismatch_fails() {
        let t = token(&["exec:test"], "alice", None);
        let err = check_authorization(&["exec:test".into()], Satisfy::All, Some("bob"), &t).unwrap_err();
        assert!(matches!(err, Error::InsufficientScope { .. }));
    }

    #[test]
    fn check_minimum_lifetime_rejects_when_too_short() {
        let t = token(&[], "alice", Some(Utc::now() + chrono::Duration::seconds(30)));
        let err = check_minimum_lifetime(&t, Some(Duration::from_secs(3600))).unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
    }

    #[test]
    fn check_minimum_lifetime_accepts_eternal_token() {
        let t = token(&[], "alice", None);
        assert!(check_minimum_lifetime(&t, Some(Duration::from_secs(999_999))).is_ok());
    }

    #[test]
    fn check_minimum_lifetime_none_requested_always_passes() {
        let t = token(&[], "alice", Some(Utc::now() + chrono::Duration::seconds(1)));
        assert!(check_minimum_lifetime(&t, None).is_ok());
    }

    #[test]
    fn required_scopes_folds_delegate_scope_uniquely() {
        let query = AuthQuery {
            scope: vec!["read:all".into()],
            delegate_scope: vec!["read:all".into(), "exec:admin".into()],
            ..Default::default()
        };
        assert_eq!(query.required_scopes(), vec!["read:all".to_string(), "exec:admin".to_string()]);
    }
}
