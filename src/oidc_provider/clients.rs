//! The OIDC Provider's client allow-list, loaded once at startup from
//! `oidc_server_secrets_file` (§4.3, §6).

use serde::Deserialize;

use crate::config::Config;
use crate::{Error, Result};

/// One entry from `oidc_server_secrets_file`: a downstream service permitted
/// to redeem authorization codes from this gateway's OIDC Provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcClient {
    /// `client_id` presented at the login and token endpoints.
    pub id: String,
    /// `client_secret` presented at the token endpoint, compared in
    /// constant time.
    pub secret: String,
    /// The scheme+host+port a `redirect_uri` must match at the login
    /// endpoint, and the exact value it must equal at the token endpoint.
    pub return_uri: String,
}

/// The set of clients this OIDC Provider will issue codes and tokens to.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Vec<OidcClient>,
}

impl ClientRegistry {
    /// Load the client list from `path`, a JSON array of `{id, secret,
    /// return_uri}` objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self> {
        let contents = Config::read_secret_file(path)?;
        let clients: Vec<OidcClient> =
            serde_json::from_str(&contents).map_err(|e| Error::Config(format!("invalid oidc_server_secrets_file: {e}")))?;
        Ok(Self { clients })
    }

    /// An empty registry, for deployments with no OIDC Provider clients
    /// configured.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a client by id.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&OidcClient> {
        self.clients.iter().find(|c| c.id == client_id)
    }

    /// Verify `client_id`/`client_secret` in constant time, returning the
    /// matched client. Used by the token endpoint (§4.3 step 3).
    #[must_use]
    pub fn authenticate(&self, client_id: &str, client_secret: &str) -> Option<&OidcClient> {
        let client = self.get(client_id)?;
        if crate::token::Token::secret_matches(client_secret, &client.secret) {
            Some(client)
        } else {
            None
        }
    }

    /// Whether `redirect_uri` shares scheme, host, and port with the
    /// client's configured `return_uri` (§4.3 login-endpoint check).
    #[must_use]
    pub fn redirect_uri_matches(client: &OidcClient, redirect_uri: &str) -> bool {
        let (Ok(configured), Ok(requested)) = (url::Url::parse(&client.return_uri), url::Url::parse(redirect_uri)) else {
            return false;
        };
        configured.scheme() == requested.scheme()
            && configured.host_str() == requested.host_str()
            && configured.port_or_known_default() == requested.port_or_known_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OidcClient {
        OidcClient {
            id: "some-id".to_string(),
            secret: "some-secret".to_string(),
            return_uri: "https://h:4444/foo".to_string(),
        }
    }

    #[test]
    fn authenticate_accepts_matching_secret() {
        let registry = ClientRegistry { clients: vec![client()] };
        assert!(registry.authenticate("some-id", "some-secret").is_some());
    }

    #[test]
    fn authenticate_rejects_wrong_secret() {
        let registry = ClientRegistry { clients: vec![client()] };
        assert!(registry.authenticate("some-id", "wrong").is_none());
    }

    #[test]
    fn authenticate_rejects_unknown_client() {
        let registry = ClientRegistry { clients: vec![client()] };
        assert!(registry.authenticate("other-id", "some-secret").is_none());
    }

    #[test]
    fn redirect_uri_matches_ignores_path_and_query() {
        let c = client();
        assert!(ClientRegistry::redirect_uri_matches(&c, "https://h:4444/foo?a=bar&b=baz"));
    }

    #[test]
    fn redirect_uri_matches_rejects_different_host() {
        let c = client();
        assert!(!ClientRegistry::redirect_uri_matches(&c, "https://evil:4444/foo"));
    }

    #[test]
    fn redirect_uri_matches_rejects_different_scheme() {
        let c = client();
        assert!(!ClientRegistry::redirect_uri_matches(&c, "http://h:4444/foo"));
    }
}
