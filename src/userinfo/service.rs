//! Merges claim-derived, LDAP, and document-store user metadata (§4.4).
//!
//! Grounded on `original_source/services/userinfo.py`'s `UserInfoService`/
//! `OIDCUserInfoService`: LDAP wins for name/email/groups when it has an
//! answer, UID/GID come from the document store when configured, else LDAP,
//! else the token/claim value, and UID/GID lookups are coalesced behind
//! [`IdCache`]'s per-key lock so concurrent misses for the same name become
//! one document-store round trip.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::store::docstore::DocStore;
use crate::store::ldap::LdapAdapter;
use crate::token::TokenData;
use crate::userinfo::cache::IdCache;
use crate::{Error, Result};

/// Merged user metadata, ready to be folded into a session token or
/// returned from the `/auth` success headers and OIDC `userinfo` endpoint.
#[derive(Debug, Clone, Default)]
pub struct ResolvedUserInfo {
    /// Resolved username.
    pub username: String,
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
}

/// Usernames matching this pattern allocate from the bot UID/GID range
/// instead of the regular one (mirrors `BOT_USERNAME_REGEX` upstream).
fn is_bot_username(username: &str) -> bool {
    username.starts_with("bot-")
}

/// Merges LDAP, document-store, and token/claim-derived user metadata.
pub struct UserInfoService {
    ldap: Option<Arc<LdapAdapter>>,
    docstore: Option<Arc<dyn DocStore>>,
    cache: Arc<IdCache>,
    username_claim: String,
    uid_claim: String,
}

impl UserInfoService {
    /// Build a service over the configured adapters.
    #[must_use]
    pub fn new(
        ldap: Option<Arc<LdapAdapter>>,
        docstore: Option<Arc<dyn DocStore>>,
        cache: Arc<IdCache>,
        username_claim: String,
        uid_claim: String,
    ) -> Self {
        Self { ldap, docstore, cache, username_claim, uid_claim }
    }

    /// `get_user_info_from_token`: merge LDAP data on top of an already
    /// persisted [`TokenData`], the hot path used to build `/auth` response
    /// headers for every authenticated request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ldap`] or [`Error::IdAllocationExhausted`] if the
    /// configured adapters fail.
    pub async fn user_info_from_token(&self, data: &TokenData) -> Result<ResolvedUserInfo> {
        let (name, email, groups, ldap_uid) = match &self.ldap {
            Some(ldap) => match ldap.lookup_user(&data.username).await? {
                Some(info) => (
                    info.name.or_else(|| data.name.clone()),
                    info.email.or_else(|| data.email.clone()),
                    if info.groups.is_empty() { data.groups.clone() } else { info.groups },
                    info.uid,
                ),
                None => (data.name.clone(), data.email.clone(), data.groups.clone(), None),
            },
            None => (data.name.clone(), data.email.clone(), data.groups.clone(), None),
        };

        let uid = self.resolve_uid(&data.username, ldap_uid.or(data.uid)).await?;

        Ok(ResolvedUserInfo {
            username: data.username.clone(),
            name,
            email,
            uid,
            gid: data.gid,
            groups,
        })
    }

    /// `get_user_info_from_oidc_token`: resolve username, groups, and uid
    /// from upstream ID-token claims at the end of the OIDC RP login flow
    /// (§4.5), before a session token exists to read LDAP/docstore data
    /// through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingClaims`] / [`Error::InvalidTokenClaims`] if
    /// the configured `username_claim`/`uid_claim` are absent or malformed,
    /// or [`Error::NoUsernameMapping`] if an LDAP `sub` mapping is
    /// configured but the directory has no matching entry and no fallback
    /// claim is usable.
    pub async fn user_info_from_claims(&self, claims: &Map<String, Value>) -> Result<ResolvedUserInfo> {
        let username = self.resolve_username(claims).await?;
        let name = claims.get("name").and_then(Value::as_str).map(str::to_string);
        let email = claims.get("email").and_then(Value::as_str).map(str::to_string);

        let (groups, ldap_uid) = match &self.ldap {
            Some(ldap) => match ldap.lookup_user(&username).await? {
                Some(info) => (info.groups, info.uid),
                None => (Vec::new(), None),
            },
            None => (groups_from_claim(claims), None),
        };

        let uid = match self.resolve_uid(&username, ldap_uid).await? {
            Some(uid) => uid,
            None => self.uid_from_claim(claims, &username)?,
        };

        Ok(ResolvedUserInfo { username, name, email, uid: Some(uid), gid: None, groups })
    }

    async fn resolve_username(&self, claims: &Map<String, Value>) -> Result<String> {
        if let Some(ldap) = &self.ldap {
            if let Some(sub) = claims.get("sub").and_then(Value::as_str) {
                match ldap.resolve_username_by_sub(sub).await? {
                    Some(username) => return Ok(username),
                    None if ldap_mapping_is_mandatory(claims) => {
                        return Err(Error::NoUsernameMapping(sub.to_string()));
                    }
                    None => {}
                }
            }
        }
        claims
            .get(&self.username_claim)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::MissingClaims(self.username_claim.clone()))
    }

    fn uid_from_claim(&self, claims: &Map<String, Value>, username: &str) -> Result<u32> {
        let raw = claims
            .get(&self.uid_claim)
            .ok_or_else(|| Error::MissingClaims(self.uid_claim.clone()))?;
        let uid = raw
            .as_u64()
            .or_else(|| raw.as_str().and_then(|s| s.parse::<u64>().ok()))
            .ok_or_else(|| Error::InvalidTokenClaims(format!("{} claim for {username}", self.uid_claim)))?;
        u32::try_from(uid).map_err(|_| Error::InvalidTokenClaims(format!("{} out of range", self.uid_claim)))
    }

    /// Document store wins when configured (cache-coalesced per §4.4),
    /// otherwise the LDAP-supplied uid, otherwise `None` (caller falls back
    /// to the claim value).
    async fn resolve_uid(&self, username: &str, ldap_uid: Option<u32>) -> Result<Option<u32>> {
        let Some(docstore) = &self.docstore else {
            return Ok(ldap_uid);
        };
        if let Some(cached) = self.cache.get_uid(username) {
            return Ok(Some(cached));
        }
        let lock = self.cache.uid_lock(username);
        let _guard = lock.lock().await;
        if let Some(cached) = self.cache.get_uid(username) {
            return Ok(Some(cached));
        }
        let uid = docstore.allocate_uid(username, is_bot_username(username)).await?;
        self.cache.store_uid(username, uid);
        Ok(Some(uid))
    }

    /// Resolve the gid for a named group, coalesced the same way as
    /// [`resolve_uid`](Self::resolve_uid). Used by the OIDC Provider and
    /// group-to-scope mapping when a caller needs a numeric gid rather than
    /// just the group name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdAllocationExhausted`] if the gid range is full.
    pub async fn resolve_gid(&self, group: &str) -> Result<Option<u32>> {
        let Some(docstore) = &self.docstore else { return Ok(None) };
        if let Some(cached) = self.cache.get_gid(group) {
            return Ok(Some(cached));
        }
        let lock = self.cache.gid_lock(group);
        let _guard = lock.lock().await;
        if let Some(cached) = self.cache.get_gid(group) {
            return Ok(Some(cached));
        }
        let gid = docstore.allocate_gid(group, is_bot_username(group)).await?;
        self.cache.store_gid(group, gid);
        Ok(Some(gid))
    }
}

fn groups_from_claim(claims: &Map<String, Value>) -> Vec<String> {
    claims
        .get("isMemberOf")
        .and_then(Value::as_array)
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// An LDAP `sub_attribute` mapping is only mandatory when the claim set
/// offers no other usable identity claim to fall back on.
fn ldap_mapping_is_mandatory(claims: &Map<String, Value>) -> bool {
    !claims.contains_key("uid") && !claims.contains_key("preferred_username")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn user_info_from_claims_without_ldap_uses_username_claim() {
        let svc = UserInfoService::new(None, None, Arc::new(IdCache::new()), "uid".to_string(), "uidNumber".to_string());
        let claims = claims(&[
            ("uid", Value::String("alice".to_string())),
            ("uidNumber", Value::from(1234)),
            ("name", Value::String("Alice".to_string())),
        ]);
        let info = svc.user_info_from_claims(&claims).await.unwrap();
        assert_eq!(info.username, "alice");
        assert_eq!(info.uid, Some(1234));
        assert_eq!(info.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn user_info_from_claims_missing_username_claim_fails() {
        let svc = UserInfoService::new(None, None, Arc::new(IdCache::new()), "uid".to_string(), "uidNumber".to_string());
        let claims = claims(&[("uidNumber", Value::from(1234))]);
        let err = svc.user_info_from_claims(&claims).await.unwrap_err();
        assert!(matches!(err, Error::MissingClaims(_)));
    }

    #[tokio::test]
    async fn user_info_from_claims_missing_uid_claim_fails() {
        let svc = UserInfoService::new(None, None, Arc::new(IdCache::new()), "uid".to_string(), "uidNumber".to_string());
        let claims = claims(&[("uid", Value::String("alice".to_string()))]);
        let err = svc.user_info_from_claims(&claims).await.unwrap_err();
        assert!(matches!(err, Error::MissingClaims(_)));
    }

    #[tokio::test]
    async fn user_info_from_claims_reads_groups_from_is_member_of() {
        let svc = UserInfoService::new(None, None, Arc::new(IdCache::new()), "uid".to_string(), "uidNumber".to_string());
        let claims = claims(&[
            ("uid", Value::String("alice".to_string())),
            ("uidNumber", Value::from(1234)),
            (
                "isMemberOf",
                Value::Array(vec![serde_json::json!({"name": "admins"}), serde_json::json!({"name": "ops"})]),
            ),
        ]);
        let info = svc.user_info_from_claims(&claims).await.unwrap();
        assert_eq!(info.groups, vec!["admins".to_string(), "ops".to_string()]);
    }

    #[tokio::test]
    async fn user_info_from_token_without_ldap_passes_through() {
        let svc = UserInfoService::new(None, None, Arc::new(IdCache::new()), "uid".to_string(), "uidNumber".to_string());
        let data = TokenData {
            key: "k".into(),
            secret: "s".into(),
            username: "alice".into(),
            token_type: crate::token::TokenType::Session,
            scopes: Default::default(),
            created: chrono::Utc::now(),
            expires: None,
            name: Some("Alice".into()),
            email: Some("alice@example.com".into()),
            uid: Some(42),
            gid: Some(42),
            groups: vec!["admins".into()],
            parent_key: None,
            service: None,
        };
        let info = svc.user_info_from_token(&data).await.unwrap();
        assert_eq!(info.uid, Some(42));
        assert_eq!(info.groups, vec!["admins".to_string()]);
    }
}
