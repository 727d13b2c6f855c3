//! OIDC Provider business logic: login-endpoint validation, authorization
//! issuance, token-endpoint redemption, userinfo, JWKS, and discovery
//! (§4.3). Kept free of HTTP types so [`super::handler`] stays a thin
//! translation to axum request/response shapes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{DecodingKey, Validation};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::config::IssuerConfig;
use crate::oidc_provider::authorization::AuthorizationStore;
use crate::oidc_provider::clients::{ClientRegistry, OidcClient};
use crate::oidc_provider::signing::SigningKey;
use crate::token::{Token, TokenService};
use crate::{Error, Result};

/// Client and redirect-uri validated, protocol parameters not yet checked.
pub struct ValidatedClient<'a> {
    /// The matched client.
    pub client: &'a OidcClient,
}

/// The outcome of validating `response_type`/`scope` once the client and
/// `redirect_uri` are already known-good: these MUST be reported by
/// redirecting to `redirect_uri` rather than as a direct error response
/// (§4.3).
#[derive(Debug, Clone)]
pub struct ProtocolError {
    /// Always `invalid_request` for the cases this type models.
    pub error: &'static str,
    /// Human-readable description, safe to place in a redirect query string.
    pub description: String,
}

/// Recognized scopes after filtering against the deployment's known scopes
/// and the fixed OIDC meta-scopes, preserving request order.
fn filter_recognized_scopes(requested: &[&str], known_scopes: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|s| matches!(**s, "openid" | "profile" | "email") || known_scopes.iter().any(|k| k == *s))
        .map(|s| (*s).to_string())
        .collect()
}

/// Core OIDC Provider state: client registry, authorization-code store,
/// signing key, and the token service it reads session claims from.
pub struct OidcProviderService {
    clients: ClientRegistry,
    authorizations: AuthorizationStore,
    signing: SigningKey,
    tokens: Arc<TokenService>,
    issuer: IssuerConfig,
    known_scopes: Vec<String>,
}

impl OidcProviderService {
    /// Assemble the provider over its collaborators.
    #[must_use]
    pub fn new(
        clients: ClientRegistry,
        authorizations: AuthorizationStore,
        signing: SigningKey,
        tokens: Arc<TokenService>,
        issuer: IssuerConfig,
        known_scopes: Vec<String>,
    ) -> Self {
        Self { clients, authorizations, signing, tokens, issuer, known_scopes }
    }

    /// §4.3 login-endpoint step 1: `client_id` must be known and
    /// `redirect_uri` must match the client's configured `return_uri`.
    /// These two failures are reported directly (400/422), never by
    /// redirect, since a bad `redirect_uri` cannot be trusted as a
    /// destination.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidClient`] or [`Error::InvalidRedirectUri`].
    pub fn validate_client(&self, client_id: &str, redirect_uri: &str) -> Result<ValidatedClient<'_>> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| Error::InvalidClient(format!("unknown client_id {client_id}")))?;
        if !ClientRegistry::redirect_uri_matches(client, redirect_uri) {
            return Err(Error::InvalidRedirectUri(format!(
                "redirect_uri does not match the configured return_uri for {client_id}"
            )));
        }
        Ok(ValidatedClient { client })
    }

    /// §4.3 login-endpoint remaining protocol checks, evaluated only after
    /// [`Self::validate_client`] succeeds: `response_type`, presence of
    /// `scope`, and `openid` being one of the requested scopes.
    pub fn validate_protocol(response_type: &str, scope: &str) -> std::result::Result<Vec<String>, ProtocolError> {
        if response_type != "code" {
            return Err(ProtocolError {
                error: "invalid_request",
                description: "response_type must be code".to_string(),
            });
        }
        if scope.trim().is_empty() {
            return Err(ProtocolError { error: "invalid_request", description: "scope is required".to_string() });
        }
        let requested: Vec<&str> = scope.split_whitespace().collect();
        if !requested.contains(&"openid") {
            return Err(ProtocolError {
                error: "invalid_request",
                description: "scope must include openid".to_string(),
            });
        }
        Ok(requested.into_iter().map(str::to_string).collect())
    }

    /// Recognized subset of `requested` scopes (§4.3: unknown scopes are
    /// silently dropped, not an error).
    #[must_use]
    pub fn recognized_scopes(&self, requested: &[String]) -> Vec<String> {
        let refs: Vec<&str> = requested.iter().map(String::as_str).collect();
        filter_recognized_scopes(&refs, &self.known_scopes)
    }

    /// Issue an authorization code for an already-authenticated session and
    /// build the `redirect_uri?code=...&state=...` target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyValueStore`] on a store failure.
    pub async fn authorize(
        &self,
        client_id: &str,
        redirect_uri: &str,
        token_key: &str,
        scopes: Vec<String>,
        nonce: Option<String>,
        state: Option<&str>,
    ) -> Result<String> {
        let code = self.authorizations.issue(client_id, redirect_uri, token_key, scopes, nonce).await?;
        Ok(append_code_redirect(redirect_uri, &code.to_string(), state))
    }

    /// §4.3 token-endpoint redemption, in the exact validation order the
    /// spec requires so every rejected request maps to the right OAuth2
    /// error code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedGrantType`], [`Error::InvalidClient`], or
    /// [`Error::InvalidGrant`] (the last covers every cause the spec
    /// requires to stay indistinguishable: unknown/corrupt/expired code,
    /// client or redirect_uri mismatch, or a deleted underlying token).
    pub async fn redeem(
        &self,
        grant_type: &str,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        if grant_type != "authorization_code" {
            return Err(Error::UnsupportedGrantType);
        }
        let client = self
            .clients
            .authenticate(client_id, client_secret)
            .ok_or_else(|| Error::InvalidClient("unknown client_id or incorrect client_secret".to_string()))?;

        let code_key = code.parse::<Token>().map_err(|_| Error::InvalidGrant)?.key;
        let record = self.authorizations.redeem(code).await?.ok_or(Error::InvalidGrant)?;
        if record.client_id != client.id || record.redirect_uri != redirect_uri {
            return Err(Error::InvalidGrant);
        }
        let data = self.tokens.get_by_key(&record.token_key).await?.ok_or(Error::InvalidGrant)?;

        let now = Utc::now();
        let exp = data.expires.unwrap_or(now + chrono::Duration::minutes(i64::from(self.issuer.exp_minutes)));
        let scope_str = record.scopes.join(" ");

        let mut claims = Map::new();
        claims.insert("iss".to_string(), json!(self.issuer.iss));
        claims.insert("sub".to_string(), json!(data.username));
        claims.insert("aud".to_string(), json!(client.id));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert("exp".to_string(), json!(exp.timestamp()));
        claims.insert("jti".to_string(), json!(code_key));
        claims.insert("scope".to_string(), json!(scope_str));
        if record.scopes.iter().any(|s| s == "profile") {
            claims.insert("preferred_username".to_string(), json!(data.username));
            if let Some(name) = &data.name {
                claims.insert("name".to_string(), json!(name));
            }
        }
        if record.scopes.iter().any(|s| s == "email") {
            if let Some(email) = &data.email {
                claims.insert("email".to_string(), json!(email));
            }
        }
        if let Some(nonce) = &record.nonce {
            claims.insert("nonce".to_string(), json!(nonce));
        }

        let id_token = self.signing.sign(&Value::Object(claims))?;
        let expires_in = (exp - now).num_seconds().max(0);

        Ok(TokenResponse {
            access_token: id_token.clone(),
            id_token,
            token_type: "Bearer",
            expires_in,
            scope: scope_str,
        })
    }

    /// §4.3 `userinfo`: validate the presented ID token's signature and
    /// expiry, then return its claims verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the token does not verify.
    pub fn userinfo(&self, id_token: &str) -> Result<Map<String, Value>> {
        let decoding_key = self.signing.decoding_key()?;
        let mut validation = Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<Map<String, Value>>(id_token, &decoding_key, &validation)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }

    /// The published JWKS document.
    #[must_use]
    pub fn jwks(&self) -> &crate::oidc_provider::signing::Jwks {
        self.signing.jwks()
    }

    /// The discovery document, constant for the process lifetime (§4.3).
    #[must_use]
    pub fn discovery(&self) -> DiscoveryDocument {
        let base = self.issuer.iss.trim_end_matches('/');
        let mut scopes_supported: Vec<String> = vec!["openid".to_string(), "profile".to_string(), "email".to_string()];
        scopes_supported.extend(self.known_scopes.iter().cloned());
        DiscoveryDocument {
            issuer: self.issuer.iss.clone(),
            authorization_endpoint: format!("{base}/auth/openid/login"),
            token_endpoint: format!("{base}/auth/openid/token"),
            userinfo_endpoint: format!("{base}/auth/openid/userinfo"),
            jwks_uri: format!("{base}/.well-known/jwks.json"),
            response_types_supported: vec!["code".to_string()],
            response_modes_supported: vec!["query".to_string()],
            grant_types_supported: vec!["authorization_code".to_string()],
            subject_types_supported: vec!["public".to_string()],
            id_token_signing_alg_values_supported: vec!["RS256".to_string()],
            token_endpoint_auth_methods_supported: vec!["client_secret_post".to_string()],
            scopes_supported,
        }
    }

    /// How long the token endpoint tells intermediaries not to cache its
    /// response for (§4.3: `Cache-Control: no-store, Pragma: no-cache`).
    #[must_use]
    pub fn code_ttl() -> Duration {
        crate::oidc_provider::authorization::CODE_TTL
    }
}

/// `POST /auth/openid/token` success body (§4.3).
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// Always identical to `id_token`.
    pub access_token: String,
    /// The signed RS256 ID token.
    pub id_token: String,
    /// Always `"Bearer"`.
    pub token_type: &'static str,
    /// Seconds until `exp`.
    pub expires_in: i64,
    /// Space-separated recognized scopes.
    pub scope: String,
}

/// `/.well-known/openid-configuration` body (§4.3, §6).
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub response_modes_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
}

fn percent_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Append `code` (and `state`, if supplied) to `redirect_uri`, preserving
/// any query string the caller already included (§8 scenario 5:
/// `...?a=bar&b=baz&code=<c>&state=s`).
fn append_code_redirect(redirect_uri: &str, code: &str, state: Option<&str>) -> String {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut url = format!("{redirect_uri}{separator}code={}", percent_encode(code));
    if let Some(state) = state {
        url.push_str(&format!("&state={}", percent_encode(state)));
    }
    url
}

/// Build the redirect target for a post-client-validation protocol error
/// (§4.3: bad `response_type`, missing `scope`, or `openid` absent from
/// `scope`), reported by redirecting to `redirect_uri` rather than
/// returning a direct error response.
#[must_use]
pub fn protocol_error_redirect(redirect_uri: &str, error: &ProtocolError, state: Option<&str>) -> String {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{redirect_uri}{separator}error={}&error_description={}",
        error.error,
        percent_encode(&error.description)
    );
    if let Some(state) = state {
        url.push_str(&format!("&state={}", percent_encode(state)));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_protocol_rejects_non_code_response_type() {
        let err = OidcProviderService::validate_protocol("token", "openid").unwrap_err();
        assert_eq!(err.error, "invalid_request");
    }

    #[test]
    fn validate_protocol_rejects_missing_openid_scope() {
        let err = OidcProviderService::validate_protocol("code", "profile").unwrap_err();
        assert!(err.description.contains("openid"));
    }

    #[test]
    fn validate_protocol_accepts_well_formed_request() {
        let scopes = OidcProviderService::validate_protocol("code", "openid profile unknown").unwrap();
        assert_eq!(scopes, vec!["openid", "profile", "unknown"]);
    }

    #[test]
    fn filter_recognized_scopes_drops_unknown_and_keeps_order() {
        let known = vec!["exec:admin".to_string()];
        let got = filter_recognized_scopes(&["openid", "profile", "unknown"], &known);
        assert_eq!(got, vec!["openid".to_string(), "profile".to_string()]);
    }

    #[test]
    fn append_code_redirect_preserves_existing_query_string() {
        let url = append_code_redirect("https://h:4444/foo?a=bar&b=baz", "abc", Some("s"));
        assert_eq!(url, "https://h:4444/foo?a=bar&b=baz&code=abc&state=s");
    }

    #[test]
    fn append_code_redirect_starts_fresh_query_string_when_absent() {
        let url = append_code_redirect("https://h/foo", "abc", None);
        assert_eq!(url, "https://h/foo?code=abc");
    }
}
