//! LDAP adapter: username to groups, uid, name, email lookups.
//!
//! Per spec.md's explicit Non-goal, LDAP responses are never cached here —
//! the design assumes LDAP can handle the load and requires fresh answers.
//! Connections are opened per call rather than pooled; `ldap3`'s async
//! client is cheap to establish and the teacher's own outbound-HTTP clients
//! (`key_server::oidc::JwksCache`) use a similar build-per-need-with-timeout
//! style rather than a long-lived pool.

use std::time::Duration;

use ldap3::{LdapConnAsync, Scope, SearchEntry};

use crate::config::LdapConfig;
use crate::{Error, Result};

/// A user record as resolved from the directory.
#[derive(Debug, Clone, Default)]
pub struct LdapUserInfo {
    /// Display name (`cn`), if present.
    pub name: Option<String>,
    /// Email address (`mail`), if present.
    pub email: Option<String>,
    /// Numeric uid (`uidNumber`), if present.
    pub uid: Option<u32>,
    /// Group common names the user belongs to.
    pub groups: Vec<String>,
}

/// LDAP adapter.
pub struct LdapAdapter {
    config: LdapConfig,
    bind_password: Option<String>,
}

impl LdapAdapter {
    /// Build an adapter from configuration, reading the bind password file
    /// if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the bind password file cannot be read.
    pub fn new(config: LdapConfig) -> Result<Self> {
        let bind_password = config
            .bind_password_file
            .as_deref()
            .map(crate::config::Config::read_secret_file)
            .transpose()?;
        Ok(Self { config, bind_password })
    }

    async fn connect(&self) -> Result<ldap3::Ldap> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.config.url)
            .await
            .map_err(|e| Error::Ldap(e.to_string()))?;
        ldap3::drive!(conn);

        if let Some(bind_dn) = &self.config.bind_dn {
            ldap.simple_bind(bind_dn, self.bind_password.as_deref().unwrap_or(""))
                .await
                .map_err(|e| Error::Ldap(e.to_string()))?
                .success()
                .map_err(|e| Error::Ldap(e.to_string()))?;
        }

        Ok(ldap)
    }

    /// Look up a user by username, with groups derived from `memberOf`-style
    /// reverse group search under `group_base_dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ldap`] on connection, bind, search, or timeout failure.
    pub async fn lookup_user(&self, username: &str) -> Result<Option<LdapUserInfo>> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.lookup_user_inner(username))
            .await
            .map_err(|_| Error::Ldap(format!("LDAP lookup for {username} timed out")))?
    }

    async fn lookup_user_inner(&self, username: &str) -> Result<Option<LdapUserInfo>> {
        let mut ldap = self.connect().await?;

        let filter = format!("(uid={})", ldap3::ldap_escape(username));
        let (entries, _) = ldap
            .search(
                &self.config.user_base_dn,
                Scope::Subtree,
                &filter,
                vec!["cn", "mail", "uidNumber"],
            )
            .await
            .map_err(|e| Error::Ldap(e.to_string()))?
            .success()
            .map_err(|e| Error::Ldap(e.to_string()))?;

        let Some(raw_entry) = entries.into_iter().next() else {
            return Ok(None);
        };
        let entry = SearchEntry::construct(raw_entry);

        let name = first_attr(&entry, "cn");
        let email = first_attr(&entry, "mail");
        let uid = first_attr(&entry, "uidNumber").and_then(|s| s.parse().ok());

        let group_filter = format!("(memberUid={})", ldap3::ldap_escape(username));
        let (group_entries, _) = ldap
            .search(&self.config.group_base_dn, Scope::Subtree, &group_filter, vec!["cn"])
            .await
            .map_err(|e| Error::Ldap(e.to_string()))?
            .success()
            .map_err(|e| Error::Ldap(e.to_string()))?;

        let groups = group_entries
            .into_iter()
            .filter_map(|raw| first_attr(&SearchEntry::construct(raw), "cn"))
            .collect();

        let _ = ldap.unbind().await;

        Ok(Some(LdapUserInfo {
            name,
            email,
            uid,
            groups,
        }))
    }

    /// Resolve a username from the upstream `sub` claim, per the optional
    /// `ldap.sub_attribute` mapping (§4.5). Returns `Ok(None)` both when no
    /// mapping is configured and when the directory has no matching entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ldap`] on connection, bind, search, or timeout failure.
    pub async fn resolve_username_by_sub(&self, sub: &str) -> Result<Option<String>> {
        let Some(attr) = self.config.sub_attribute.clone() else {
            return Ok(None);
        };
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.resolve_username_by_sub_inner(&attr, sub))
            .await
            .map_err(|_| Error::Ldap(format!("LDAP username lookup for {sub} timed out")))?
    }

    async fn resolve_username_by_sub_inner(&self, attr: &str, sub: &str) -> Result<Option<String>> {
        let mut ldap = self.connect().await?;
        let filter = format!("({attr}={})", ldap3::ldap_escape(sub));
        let (entries, _) = ldap
            .search(&self.config.user_base_dn, Scope::Subtree, &filter, vec!["uid"])
            .await
            .map_err(|e| Error::Ldap(e.to_string()))?
            .success()
            .map_err(|e| Error::Ldap(e.to_string()))?;

        let Some(raw_entry) = entries.into_iter().next() else {
            return Ok(None);
        };
        let username = first_attr(&SearchEntry::construct(raw_entry), "uid");
        let _ = ldap.unbind().await;
        Ok(username)
    }
}

fn first_attr(entry: &SearchEntry, name: &str) -> Option<String> {
    entry.attrs.get(name).and_then(|values| values.first().cloned())
}

/// Default per-call deadline, per §5 ("LDAP 5s default").
#[must_use]
pub fn default_timeout() -> Duration {
    Duration::from_secs(5)
}
