//! The encrypted state cookie shared by the RP login/logout flow and the
//! OIDC Provider's login endpoint (§6): `csrf`, the post-login
//! `return_url`, the active session `token`, and upstream-login scratch
//! state (`github_state`, `login_start`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::crypto::CookieCipher;

/// Name of the cookie carrying the encrypted [`SessionCookie`].
pub const COOKIE_NAME: &str = "gafaelfawr";

/// Decrypted contents of the state cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCookie {
    /// CSRF token bound to the current login attempt.
    #[serde(default)]
    pub csrf: Option<String>,
    /// Where to send the user once login completes.
    #[serde(default)]
    pub return_url: Option<String>,
    /// The bearer string of the active session token, if logged in.
    #[serde(default)]
    pub token: Option<String>,
    /// CSRF state sent to GitHub during an RP login, checked on callback.
    #[serde(default)]
    pub github_state: Option<String>,
    /// When the current login attempt started, to expire stale attempts.
    #[serde(default)]
    pub login_start: Option<DateTime<Utc>>,
}

impl SessionCookie {
    /// Decrypt and parse a cookie value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the value fails to decrypt, or
    /// [`Error::Json`] if the decrypted payload is not valid JSON.
    pub fn decode(cipher: &CookieCipher, value: &str) -> Result<Self> {
        let plaintext = cipher.decrypt(value)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Encrypt this state for the `Set-Cookie` header.
    #[must_use]
    pub fn encode(&self, cipher: &CookieCipher) -> Result<String> {
        let plaintext = serde_json::to_vec(self)?;
        Ok(cipher.encrypt(&plaintext))
    }

    /// Find and decode the gateway's cookie out of a raw `Cookie` header
    /// value, if present. Absence or a decode failure both come back as
    /// `None` — a missing or tampered cookie is simply an unauthenticated
    /// request, never itself an error.
    #[must_use]
    pub fn from_header(cipher: &CookieCipher, cookie_header: &str) -> Option<Self> {
        cookie_header.split(';').map(str::trim).find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name != COOKIE_NAME {
                return None;
            }
            Self::decode(cipher, value).ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_roundtrips() {
        let cipher = CookieCipher::new(&[3u8; 32]).unwrap();
        let state = SessionCookie { csrf: Some("c".into()), token: Some("gt-k.s".into()), ..Default::default() };
        let wire = state.encode(&cipher).unwrap();
        let decoded = SessionCookie::decode(&cipher, &wire).unwrap();
        assert_eq!(decoded.csrf.as_deref(), Some("c"));
        assert_eq!(decoded.token.as_deref(), Some("gt-k.s"));
    }

    #[test]
    fn from_header_finds_named_cookie_among_others() {
        let cipher = CookieCipher::new(&[4u8; 32]).unwrap();
        let state = SessionCookie { csrf: Some("x".into()), ..Default::default() };
        let wire = state.encode(&cipher).unwrap();
        let header = format!("other=1; {COOKIE_NAME}={wire}; third=2");
        let decoded = SessionCookie::from_header(&cipher, &header).unwrap();
        assert_eq!(decoded.csrf.as_deref(), Some("x"));
    }

    #[test]
    fn from_header_returns_none_when_absent() {
        let cipher = CookieCipher::new(&[5u8; 32]).unwrap();
        assert!(SessionCookie::from_header(&cipher, "other=1").is_none());
    }

    #[test]
    fn from_header_returns_none_on_tampered_value() {
        let cipher = CookieCipher::new(&[6u8; 32]).unwrap();
        let header = format!("{COOKIE_NAME}=not-a-valid-cookie");
        assert!(SessionCookie::from_header(&cipher, &header).is_none());
    }
}
