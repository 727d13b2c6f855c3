//! Upstream login providers: a generic OIDC issuer or GitHub (§4.5, §6
//! config: "exactly one of `github` or `oidc`"). Both produce a claim map
//! fed through [`crate::userinfo::UserInfoService::user_info_from_claims`]
//! so the rest of the login flow does not need to know which provider ran.
//!
//! The upstream JWKS cache is keyed by `kid` and never invalidated within a
//! process (§5 "Shared state"), unlike the teacher's per-issuer, TTL'd
//! `key_server::oidc::JwksCache` this is grounded on: a signing key is
//! assumed immutable for the process lifetime, same as our own.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, jwk::AlgorithmParameters};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{GithubConfig, OidcRpConfig};
use crate::{Error, Result};

/// Process-wide cache of RSA decoding keys, keyed by `kid`. A miss triggers
/// one full JWKS refresh before failing (§4.5: "fetched from the upstream
/// JWKS on demand, cached by `kid`").
pub struct JwksCache {
    keys: DashMap<String, DecodingKey>,
    http: reqwest::Client,
}

impl JwksCache {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { keys: DashMap::new(), http }
    }

    /// Resolve the decoding key for `kid`, refreshing the full key set from
    /// `jwks_uri` once if it is not already cached.
    pub async fn find(&self, jwks_uri: &str, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.keys.get(kid) {
            return Ok(key.clone());
        }
        self.refresh(jwks_uri).await?;
        self.keys
            .get(kid)
            .map(|key| key.clone())
            .ok_or_else(|| Error::Oidc(format!("unknown upstream signing key {kid}")))
    }

    async fn refresh(&self, jwks_uri: &str) -> Result<()> {
        let jwks: jsonwebtoken::jwk::JwkSet = self.http.get(jwks_uri).send().await?.json().await?;
        for jwk in jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else { continue };
            if let AlgorithmParameters::RSA(rsa) = &jwk.algorithm {
                if let Ok(key) = DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                    self.keys.insert(kid, key);
                }
            }
        }
        Ok(())
    }
}

fn default_endpoint(issuer: &str, path: &str) -> String {
    format!("{}{path}", issuer.trim_end_matches('/'))
}

/// Generic upstream OIDC issuer.
pub struct OidcProvider {
    config: OidcRpConfig,
    client_secret: String,
    http: reqwest::Client,
    jwks_cache: JwksCache,
}

impl OidcProvider {
    #[must_use]
    pub fn new(config: OidcRpConfig, client_secret: String) -> Self {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let jwks_cache = JwksCache::new(http.clone());
        Self { config, client_secret, http, jwks_cache }
    }

    #[must_use]
    pub fn authorize_endpoint(&self) -> String {
        self.config.authorize_endpoint.clone().unwrap_or_else(|| default_endpoint(&self.config.issuer, "/authorize"))
    }

    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.config.token_endpoint.clone().unwrap_or_else(|| default_endpoint(&self.config.issuer, "/token"))
    }

    #[must_use]
    pub fn jwks_uri(&self) -> String {
        self.config.jwks_uri.clone().unwrap_or_else(|| default_endpoint(&self.config.issuer, "/.well-known/jwks.json"))
    }

    /// Build the upstream authorization URL (§4.5): `response_type=code,
    /// scope=openid [extra], state=<csrf>, redirect_uri=<our /login>`.
    #[must_use]
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        let mut scope = String::from("openid");
        for extra in &self.config.scopes {
            scope.push(' ');
            scope.push_str(extra);
        }
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.authorize_endpoint(),
            urlencoding(&self.config.client_id),
            urlencoding(redirect_uri),
            urlencoding(&scope),
            urlencoding(state),
        )
    }

    /// Redeem `code` at the token endpoint and verify the returned ID token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oidc`] if the exchange or signature/claim
    /// verification fails.
    pub async fn complete(&self, code: &str, redirect_uri: &str) -> Result<Map<String, Value>> {
        let id_token = self.exchange_code(code, redirect_uri).await?;
        self.verify_id_token(&id_token).await
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            id_token: String,
        }

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self.http.post(self.token_endpoint()).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(Error::Oidc(format!("upstream token endpoint returned {}", response.status())));
        }
        let body: TokenResponse = response.json().await?;
        Ok(body.id_token)
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<Map<String, Value>> {
        let header = jsonwebtoken::decode_header(id_token)?;
        let kid = header.kid.ok_or_else(|| Error::Oidc("upstream ID token missing kid".to_string()))?;
        let key = self.jwks_cache.find(&self.jwks_uri(), &kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.config.issuer]);
        let audience = self.config.audience.clone().unwrap_or_else(|| self.config.client_id.clone());
        validation.set_audience(&[audience]);

        let data = jsonwebtoken::decode::<Map<String, Value>>(id_token, &key, &validation)?;
        Ok(data.claims)
    }
}

fn urlencoding(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// GitHub OAuth login (§4.5, §6: the alternative to a generic `oidc`
/// provider). GitHub does not issue an ID token, so the claim map is built
/// directly from the `user` and `user/emails` REST endpoints, keyed so that
/// [`crate::userinfo::UserInfoService::user_info_from_claims`] sees the same
/// shape it would from a real OIDC provider.
pub struct GithubProvider {
    config: GithubConfig,
    client_secret: String,
    http: reqwest::Client,
    username_claim: String,
    uid_claim: String,
}

impl GithubProvider {
    #[must_use]
    pub fn new(config: GithubConfig, client_secret: String, username_claim: String, uid_claim: String) -> Self {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(Duration::from_secs(10))
            .user_agent("gafaelfawr-rs")
            .build()
            .unwrap_or_default();
        Self { config, client_secret, http, username_claim, uid_claim }
    }

    #[must_use]
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        format!(
            "https://github.com/login/oauth/authorize?client_id={}&redirect_uri={}&state={}&scope=read:user,user:email",
            urlencoding(&self.config.client_id),
            urlencoding(redirect_uri),
            urlencoding(state),
        )
    }

    /// # Errors
    ///
    /// Returns [`Error::Oidc`] if the code exchange or user-info fetch fails.
    pub async fn complete(&self, code: &str, redirect_uri: &str) -> Result<Map<String, Value>> {
        let access_token = self.exchange_code(code, redirect_uri).await?;
        let user = self.fetch_user(&access_token).await?;
        let email = self.fetch_primary_email(&access_token).await?;

        let mut claims = Map::new();
        claims.insert(self.username_claim.clone(), Value::String(user.login));
        claims.insert(self.uid_claim.clone(), Value::from(user.id));
        if let Some(name) = user.name {
            claims.insert("name".to_string(), Value::String(name));
        }
        if let Some(email) = email.or(user.email) {
            claims.insert("email".to_string(), Value::String(email));
        }
        Ok(claims)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct AccessTokenResponse {
            access_token: String,
        }

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        let response = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Oidc(format!("GitHub token exchange returned {}", response.status())));
        }
        let body: AccessTokenResponse = response.json().await?;
        Ok(body.access_token)
    }

    async fn fetch_user(&self, access_token: &str) -> Result<GithubUser> {
        let response = self
            .http
            .get("https://api.github.com/user")
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Oidc(format!("GitHub user lookup returned {}", response.status())));
        }
        Ok(response.json().await?)
    }

    async fn fetch_primary_email(&self, access_token: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get("https://api.github.com/user/emails")
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let emails: Vec<GithubEmail> = response.json().await.unwrap_or_default();
        Ok(emails.into_iter().find(|e| e.primary).map(|e| e.email))
    }
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
}

/// Either of the two mutually-exclusive login providers (§6 config: exactly
/// one of `github` or `oidc`).
pub enum Provider {
    Oidc(OidcProvider),
    Github(GithubProvider),
}

impl Provider {
    #[must_use]
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        match self {
            Self::Oidc(p) => p.authorize_url(state, redirect_uri),
            Self::Github(p) => p.authorize_url(state, redirect_uri),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Oidc`] if code redemption or claim verification fails.
    pub async fn complete(&self, code: &str, redirect_uri: &str) -> Result<Map<String, Value>> {
        match self {
            Self::Oidc(p) => p.complete(code, redirect_uri).await,
            Self::Github(p) => p.complete(code, redirect_uri).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oidc_config() -> OidcRpConfig {
        OidcRpConfig {
            issuer: "https://idp.example.com".to_string(),
            authorize_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            client_id: "client-1".to_string(),
            client_secret_file: String::new(),
            scopes: vec!["profile".to_string(), "email".to_string()],
            audience: None,
        }
    }

    #[test]
    fn default_endpoints_derive_from_issuer() {
        let provider = OidcProvider::new(oidc_config(), "secret".to_string());
        assert_eq!(provider.authorize_endpoint(), "https://idp.example.com/authorize");
        assert_eq!(provider.token_endpoint(), "https://idp.example.com/token");
        assert_eq!(provider.jwks_uri(), "https://idp.example.com/.well-known/jwks.json");
    }

    #[test]
    fn authorize_url_includes_extra_scopes_and_state() {
        let provider = OidcProvider::new(oidc_config(), "secret".to_string());
        let url = provider.authorize_url("csrf123", "https://gw.example.com/login");
        assert!(url.contains("response_type=code"));
        assert!(url.contains("scope=openid+profile+email") || url.contains("scope=openid%20profile%20email"));
        assert!(url.contains("state=csrf123"));
    }

    #[test]
    fn github_authorize_url_uses_fixed_github_host() {
        let provider = GithubProvider::new(
            GithubConfig { client_id: "gh-client".to_string(), client_secret_file: String::new() },
            "secret".to_string(),
            "uid".to_string(),
            "uidNumber".to_string(),
        );
        let url = provider.authorize_url("csrf", "https://gw.example.com/login");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=gh-client"));
    }
}
