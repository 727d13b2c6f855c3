//! Token string format, [`TokenData`], [`TokenInfo`], and history entries.

use std::{collections::HashSet, fmt, str::FromStr};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// An opaque bearer token: `gt-<key>.<secret>`.
///
/// `key` indexes persistent state; `secret` is the bearer proof. It is kept
/// alongside the rest of [`TokenData`] in the trusted key-value store (never
/// returned to a client except as part of the original `gt-<key>.<secret>`
/// string) so that a losing racer in derived-token dedup can still resolve
/// the winning token's full bearer string; comparisons against a presented
/// secret are constant-time regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// 22-character base64url encoding of 16 random bytes.
    pub key: String,
    /// 22-character base64url encoding of 16 random bytes.
    pub secret: String,
}

impl Token {
    /// Mint a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: random_component(),
            secret: random_component(),
        }
    }

    /// Constant-time check that `candidate` matches the secret stored
    /// alongside this token's [`TokenData`].
    ///
    /// The comparison is constant-time even though the stored value is the
    /// plaintext secret rather than a digest: both sides are fixed-length
    /// base64url strings, so there is nothing for a digest to buy here, and
    /// a digest would make it impossible for a losing racer in derived-token
    /// dedup (§4.1/§4.6) to recover the winning token's bearer string.
    #[must_use]
    pub fn secret_matches(candidate: &str, stored: &str) -> bool {
        candidate.as_bytes().ct_eq(stored.as_bytes()).unwrap_u8() == 1
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

fn random_component() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gt-{}.{}", self.key, self.secret)
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("gt-")
            .ok_or_else(|| Error::InvalidToken("missing gt- prefix".to_string()))?;
        let (key, secret) = rest
            .split_once('.')
            .ok_or_else(|| Error::InvalidToken("missing key/secret separator".to_string()))?;
        if key.is_empty() || secret.is_empty() {
            return Err(Error::InvalidToken("empty key or secret".to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// The kind of token, per §3 of the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Top-level token returned to a browser via cookie at end of login.
    Session,
    /// Long-lived token created manually by a user.
    User,
    /// Derived token carrying the full scopes of its parent.
    Notebook,
    /// Derived token scoped to a single named service.
    Internal,
    /// Token minted for a non-interactive service principal.
    Service,
    /// Token minted by the OIDC Provider (`access_token == id_token`).
    Oidc,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::User => "user",
            Self::Notebook => "notebook",
            Self::Internal => "internal",
            Self::Service => "service",
            Self::Oidc => "oidc",
        };
        write!(f, "{s}")
    }
}

/// The hot-path record stored under `token:<key>` in the key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    /// The key component of the token this record belongs to.
    pub key: String,
    /// The secret component, kept only in the trusted key-value store.
    pub secret: String,
    /// Owning username.
    pub username: String,
    /// Token kind.
    pub token_type: TokenType,
    /// Scopes this token carries.
    pub scopes: HashSet<String>,
    /// Creation instant.
    pub created: DateTime<Utc>,
    /// Expiry instant, if any (session/user tokens may be eternal).
    pub expires: Option<DateTime<Utc>>,
    /// Display name, if known.
    pub name: Option<String>,
    /// Email address, if known.
    pub email: Option<String>,
    /// Numeric uid, if known.
    pub uid: Option<u32>,
    /// Numeric gid, if known.
    pub gid: Option<u32>,
    /// Group memberships.
    pub groups: Vec<String>,
    /// Key of the parent token, for derived tokens.
    pub parent_key: Option<String>,
    /// Service name, for internal tokens.
    pub service: Option<String>,
}

impl TokenData {
    /// Whether this token's validity window has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|e| e <= Utc::now())
    }

    /// Remaining lifetime, or `None` if the token never expires.
    #[must_use]
    pub fn remaining_lifetime(&self) -> Option<chrono::Duration> {
        self.expires.map(|e| e - Utc::now())
    }
}

/// The relational-store row mirroring a live `TokenData` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Primary key: the token's key component.
    pub token_key: String,
    /// Owning username.
    pub username: String,
    /// Token kind.
    pub token_type: TokenType,
    /// Human-assigned name, unique per user for user tokens.
    pub token_name: Option<String>,
    /// Service name, for internal tokens.
    pub service: Option<String>,
    /// Scopes this token carries.
    pub scopes: Vec<String>,
    /// Creation instant.
    pub created: DateTime<Utc>,
    /// Last time this token was used to authenticate a request.
    pub last_used: Option<DateTime<Utc>>,
    /// Expiry instant, if any.
    pub expires: Option<DateTime<Utc>>,
    /// Key of the parent token, for derived tokens.
    pub parent_key: Option<String>,
    /// Dedup identity for derived tokens: `(parent_key, kind, [service, scopes])`.
    pub identity_key: Option<String>,
}

/// An append-only audit action against a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    /// Token was created.
    Create,
    /// Token metadata was modified.
    Edit,
    /// Token's validity window elapsed.
    Expire,
    /// Token was explicitly revoked.
    Revoke,
}

/// An append-only history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The token this entry is about.
    pub token_key: String,
    /// Owning username.
    pub username: String,
    /// What happened.
    pub action: HistoryAction,
    /// Who performed the action (may differ from `username` for admin ops).
    pub actor: String,
    /// Scopes at the time of the action.
    pub scopes: Vec<String>,
    /// Expiry at the time of the action.
    pub expires: Option<DateTime<Utc>>,
    /// Client IP address that triggered the action.
    pub ip_address: Option<String>,
    /// When the action occurred.
    pub event_time: DateTime<Utc>,
}

/// Builds the dedup identity key for a derived token, per §4.6: notebook
/// tokens omit `service`/`scopes`; internal tokens fold in the sorted scope
/// set so distinct scope subsets for the same service never collide.
#[must_use]
pub fn identity_key(parent_key: &str, token_type: TokenType, service: Option<&str>, scopes: &[String]) -> String {
    match token_type {
        TokenType::Notebook => format!("{parent_key}:notebook"),
        TokenType::Internal => {
            let mut sorted = scopes.to_vec();
            sorted.sort();
            format!(
                "{parent_key}:internal:{}:{}",
                service.unwrap_or_default(),
                sorted.join(",")
            )
        }
        other => format!("{parent_key}:{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_display_and_parse_roundtrip() {
        let token = Token::new();
        let rendered = token.to_string();
        assert!(rendered.starts_with("gt-"));
        let parsed: Token = rendered.parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        assert!("not-a-token".parse::<Token>().is_err());
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!("gt-onlykey".parse::<Token>().is_err());
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!("gt-.secret".parse::<Token>().is_err());
        assert!("gt-key.".parse::<Token>().is_err());
    }

    #[test]
    fn secret_matches_correct_secret() {
        let token = Token::new();
        assert!(Token::secret_matches(&token.secret, &token.secret));
    }

    #[test]
    fn secret_does_not_match_wrong_secret() {
        let token = Token::new();
        assert!(!Token::secret_matches("wrong-secret", &token.secret));
    }

    #[test]
    fn identity_key_notebook_omits_service_and_scopes() {
        let key = identity_key("parent1", TokenType::Notebook, Some("ignored"), &["a".into()]);
        assert_eq!(key, "parent1:notebook");
    }

    #[test]
    fn identity_key_internal_sorts_scopes() {
        let a = identity_key("p", TokenType::Internal, Some("svc"), &["b".into(), "a".into()]);
        let b = identity_key("p", TokenType::Internal, Some("svc"), &["a".into(), "b".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn identity_key_internal_distinguishes_scopes() {
        let a = identity_key("p", TokenType::Internal, Some("svc"), &["a".into()]);
        let b = identity_key("p", TokenType::Internal, Some("svc"), &["b".into()]);
        assert_ne!(a, b);
    }
}
