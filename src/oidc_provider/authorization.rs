//! Authorization-code issuance and single-use redemption (§3, §4.3).
//!
//! Codes are opaque [`Token`]s reused from the token model: the `key`
//! indexes the `oidc:<key>` key-value record, the `secret` is returned to
//! the client as part of the `code` and compared in constant time on
//! redemption, mirroring how session tokens use the same split.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::kv::SharedKvStore;
use crate::token::Token;
use crate::{Error, Result};

/// Maximum lifetime of an authorization code (§3).
pub const CODE_TTL: Duration = Duration::from_secs(5 * 60);

/// A pending authorization code, stored under `oidc:<code.key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcAuthorization {
    /// Secret half of the code, checked in constant time on redemption.
    pub secret: String,
    /// The client this code was issued to.
    pub client_id: String,
    /// The `redirect_uri` presented at the login endpoint; redemption must
    /// present the identical value.
    pub redirect_uri: String,
    /// Key of the underlying user token the ID token's claims are read from.
    pub token_key: String,
    /// Scopes granted at authorization time.
    pub scopes: Vec<String>,
    /// Client-supplied OIDC `nonce`, if any.
    pub nonce: Option<String>,
    /// Issuance instant, used only for observability; expiry is enforced by
    /// the key-value store's TTL.
    pub created: DateTime<Utc>,
}

/// Issues and redeems [`OidcAuthorization`] codes over a [`SharedKvStore`].
pub struct AuthorizationStore {
    kv: SharedKvStore,
}

impl AuthorizationStore {
    /// Wrap a key-value store.
    #[must_use]
    pub fn new(kv: SharedKvStore) -> Self {
        Self { kv }
    }

    fn kv_key(key: &str) -> String {
        format!("oidc:{key}")
    }

    /// Mint and store a fresh authorization code, returning the bearer
    /// [`Token`] whose string form is handed to the client as `code`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyValueStore`] on a store failure.
    pub async fn issue(
        &self,
        client_id: &str,
        redirect_uri: &str,
        token_key: &str,
        scopes: Vec<String>,
        nonce: Option<String>,
    ) -> Result<Token> {
        let code = Token::new();
        let record = OidcAuthorization {
            secret: code.secret.clone(),
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            token_key: token_key.to_string(),
            scopes,
            nonce,
            created: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.kv.set(&Self::kv_key(&code.key), &bytes, Some(CODE_TTL)).await?;
        Ok(code)
    }

    /// Redeem `presented` (the full `code` string), deleting it atomically
    /// so it can never be redeemed twice.
    ///
    /// Returns `Ok(None)` for any of: malformed code, unknown key, corrupt
    /// stored blob, or secret mismatch — the token endpoint collapses all of
    /// these into the single `invalid_grant` response (§4.3, §7).
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyValueStore`] on a store failure.
    pub async fn redeem(&self, presented: &str) -> Result<Option<OidcAuthorization>> {
        let code: Token = match presented.parse() {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };
        let Some(bytes) = self.kv.take(&Self::kv_key(&code.key)).await? else {
            return Ok(None);
        };
        let Ok(record) = serde_json::from_slice::<OidcAuthorization>(&bytes) else {
            return Ok(None);
        };
        if !Token::secret_matches(&code.secret, &record.secret) {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::InMemoryKvStore;
    use std::sync::Arc;

    fn store() -> AuthorizationStore {
        AuthorizationStore::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn issue_then_redeem_roundtrips() {
        let store = store();
        let code = store
            .issue("client", "https://h/cb", "tok-key", vec!["openid".to_string()], None)
            .await
            .unwrap();
        let record = store.redeem(&code.to_string()).await.unwrap().unwrap();
        assert_eq!(record.client_id, "client");
        assert_eq!(record.token_key, "tok-key");
    }

    #[tokio::test]
    async fn redeem_is_single_use() {
        let store = store();
        let code = store.issue("client", "https://h/cb", "tok-key", vec![], None).await.unwrap();
        assert!(store.redeem(&code.to_string()).await.unwrap().is_some());
        assert!(store.redeem(&code.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redeem_rejects_malformed_code() {
        let store = store();
        assert!(store.redeem("not-a-code").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redeem_rejects_unknown_code() {
        let store = store();
        let bogus = Token::new();
        assert!(store.redeem(&bogus.to_string()).await.unwrap().is_none());
    }
}
