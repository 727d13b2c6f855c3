//! Configuration management.
//!
//! Loaded the way the teacher loads it: a YAML file merged with
//! `GAFAELFAWR_`-prefixed environment variables via [`figment`], then
//! validated. Secret *values* never live in the config tree directly —
//! only paths to files containing them (`session_secret_file`,
//! `redis_password_file`, `issuer.key_file`, provider `client_secret_file`),
//! mirroring the original Python's `*_file`-suffixed settings.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config (tilde-expanded,
    /// loaded in order, later files win). Mirrors the teacher's pattern.
    #[serde(default)]
    pub env_files: Vec<String>,

    /// HTTP server bind options.
    pub server: ServerConfig,

    /// Authentication realm reported in `WWW-Authenticate`.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// `trace` | `debug` | `info` | `warn` | `error`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// `text` or `json`; passed straight to `setup_tracing`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// File containing the 32-byte URL-safe base64 cookie encryption key.
    #[serde(default)]
    pub session_secret_file: String,

    /// Redis connection string for the key-value store.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// File containing the Redis `AUTH` password, if required.
    #[serde(default)]
    pub redis_password_file: Option<String>,

    /// Postgres connection string for the relational store and the
    /// `id_allocations` document-store substitute (see DESIGN.md).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// CIDR ranges of trusted reverse proxies, innermost-to-outermost.
    #[serde(default)]
    pub proxies: Vec<IpNet>,

    /// Redirect target after `/logout` when no `rd` was supplied.
    #[serde(default)]
    pub after_logout_url: String,

    /// Claim used to derive the username (default `uid`).
    #[serde(default = "default_username_claim")]
    pub username_claim: String,

    /// Claim used to derive the numeric uid.
    #[serde(default = "default_uid_claim")]
    pub uid_claim: String,

    /// Usernames that are administrators from first startup.
    #[serde(default)]
    pub initial_admins: Vec<String>,

    /// Scopes the deployment recognizes, name to human description.
    #[serde(default)]
    pub known_scopes: HashMap<String, String>,

    /// `scope -> [group, ...]`; inverted at load time to `group -> {scope}`.
    #[serde(default)]
    pub group_mapping: HashMap<String, Vec<String>>,

    /// OIDC Provider signing/issuance configuration.
    pub issuer: IssuerConfig,

    /// Upstream GitHub login, mutually exclusive with `oidc`.
    #[serde(default)]
    pub github: Option<GithubConfig>,

    /// Upstream OIDC login, mutually exclusive with `github`.
    #[serde(default)]
    pub oidc: Option<OidcRpConfig>,

    /// File with a JSON array of `{id, secret, return_uri}` OIDC Provider
    /// clients that may redeem authorization codes from this gateway.
    #[serde(default)]
    pub oidc_server_secrets_file: Option<String>,

    /// LDAP adapter configuration; absent means no LDAP lookups.
    #[serde(default)]
    pub ldap: Option<LdapConfig>,

    /// How long session/user tokens created via login last.
    #[serde(with = "humantime_serde", default = "default_token_lifetime")]
    pub token_lifetime: Duration,

    /// `MINIMUM_LIFETIME_FLOOR`: the slack kept below `token_lifetime`
    /// when validating `minimum_lifetime` and when minting derived tokens.
    #[serde(with = "humantime_serde", default = "default_lifetime_floor")]
    pub minimum_lifetime_floor: Duration,

    /// How long history rows are kept before the reaper deletes them.
    #[serde(with = "humantime_serde", default = "default_history_retention")]
    pub history_retention: Duration,

    /// How often the history/expired-token reaper runs.
    #[serde(with = "humantime_serde", default = "default_reaper_interval")]
    pub reaper_interval: Duration,
}

fn default_realm() -> String {
    "gafaelfawr".to_string()
}
fn default_loglevel() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_database_url() -> String {
    "postgres://gafaelfawr@127.0.0.1/gafaelfawr".to_string()
}
fn default_username_claim() -> String {
    "uid".to_string()
}
fn default_uid_claim() -> String {
    "uid".to_string()
}
fn default_token_lifetime() -> Duration {
    Duration::from_secs(28 * 24 * 3600)
}
fn default_lifetime_floor() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_history_retention() -> Duration {
    Duration::from_secs(365 * 24 * 3600)
}
fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}

const VALID_LOGLEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// HTTP server bind options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown drain timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

/// OIDC Provider signing and audience configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IssuerConfig {
    /// `iss` claim value, also the discovery document's issuer.
    pub iss: String,
    /// Stable `kid` for the signing keypair.
    pub key_id: String,
    /// Audiences this issuer signs for.
    pub aud: AudConfig,
    /// PEM file holding the RSA private key.
    pub key_file: String,
    /// ID-token signing-key validity advertised to callers (informational;
    /// the key itself does not rotate within a process).
    pub exp_minutes: u32,
}

/// Audience configuration for issued tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudConfig {
    /// Default audience for ID tokens minted via the OIDC Provider.
    pub default: String,
    /// Audience used for internally-minted service tokens.
    pub internal: String,
}

impl Default for AudConfig {
    fn default() -> Self {
        Self {
            default: String::new(),
            internal: "internal".to_string(),
        }
    }
}

/// Upstream GitHub OAuth login configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// GitHub OAuth app client id.
    pub client_id: String,
    /// File containing the GitHub OAuth app client secret.
    pub client_secret_file: String,
}

/// Upstream OIDC login configuration (RP side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcRpConfig {
    /// Upstream issuer URL (also used to build `/.well-known` endpoints
    /// when `authorize_endpoint`/`token_endpoint`/`jwks_uri` are unset).
    pub issuer: String,
    /// Upstream authorization endpoint; defaults to `{issuer}/authorize`.
    #[serde(default)]
    pub authorize_endpoint: Option<String>,
    /// Upstream token endpoint; defaults to `{issuer}/token`.
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Upstream JWKS URI; defaults to `{issuer}/.well-known/jwks.json`.
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// OAuth client id registered with the upstream provider.
    pub client_id: String,
    /// File containing the OAuth client secret.
    pub client_secret_file: String,
    /// Extra scopes requested alongside `openid`.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expected `aud` on the returned ID token; defaults to `client_id`.
    #[serde(default)]
    pub audience: Option<String>,
}

/// LDAP adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// `ldaps://host:port` connection URL.
    pub url: String,
    /// Base DN for user lookups.
    pub user_base_dn: String,
    /// Base DN for group lookups.
    pub group_base_dn: String,
    /// Bind DN for authenticated search, if the directory requires it.
    #[serde(default)]
    pub bind_dn: Option<String>,
    /// File containing the bind password.
    #[serde(default)]
    pub bind_password_file: Option<String>,
    /// Attribute searched against the upstream `sub` claim to resolve a
    /// username (§4.5). When unset, the username comes straight from
    /// `username_claim` instead.
    #[serde(default)]
    pub sub_attribute: Option<String>,
    /// Per-call timeout.
    #[serde(with = "humantime_serde", default = "default_ldap_timeout")]
    pub timeout: Duration,
}

fn default_ldap_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be
    /// parsed, or fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("GAFAELFAWR_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field invariants that `serde` alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        match (&self.github, &self.oidc) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "exactly one of `github` or `oidc` must be configured, not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::Config(
                    "exactly one of `github` or `oidc` must be configured".to_string(),
                ));
            }
            _ => {}
        }

        if self.initial_admins.is_empty() {
            return Err(Error::Config(
                "initial_admins must not be empty".to_string(),
            ));
        }

        if !VALID_LOGLEVELS.contains(&self.loglevel.as_str()) {
            return Err(Error::Config(format!(
                "unknown loglevel '{}', expected one of {VALID_LOGLEVELS:?}",
                self.loglevel
            )));
        }

        for scope in self.group_mapping.keys() {
            if !self.known_scopes.is_empty() && !self.known_scopes.contains_key(scope) {
                return Err(Error::Config(format!(
                    "group_mapping references unknown scope '{scope}'"
                )));
            }
        }

        Ok(())
    }

    /// Invert `group_mapping` (`scope -> [group]`) to `group -> {scope}`,
    /// the direction the user-info service actually looks up in.
    #[must_use]
    pub fn group_to_scopes(&self) -> HashMap<String, std::collections::HashSet<String>> {
        let mut inverted: HashMap<String, std::collections::HashSet<String>> = HashMap::new();
        for (scope, groups) in &self.group_mapping {
            for group in groups {
                inverted
                    .entry(group.clone())
                    .or_default()
                    .insert(scope.clone());
            }
        }
        inverted
    }

    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` / `${VAR:-default}` in the handful of fields that
    /// plausibly reference environment-specific values post-deploy.
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        self.redis_url = Self::expand_string(&re, &self.redis_url);
        self.database_url = Self::expand_string(&re, &self.database_url);
        self.issuer.iss = Self::expand_string(&re, &self.issuer.iss);
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Read a secret referenced by a `*_file` config field, trimming
    /// trailing whitespace the way a key or password file is usually saved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read.
    pub fn read_secret_file(path: &str) -> Result<String> {
        std::fs::read_to_string(path)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| Error::Config(format!("failed to read secret file {path}: {e}")))
    }
}

/// `humantime`-style duration (de)serialization: `"30s"`, `"5m"`, `"100ms"`.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a [`Duration`] as a human-readable string such as `"30s"`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string (`"30s"`, `"5m"`, `"100ms"`).
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> String {
        r#"
realm: "test.example.com"
initial_admins: ["admin"]
issuer:
  iss: "https://test.example.com"
  key_id: "test-key"
  key_file: "/tmp/does-not-matter.pem"
oidc:
  issuer: "https://idp.example.com"
  client_id: "client"
  client_secret_file: "/tmp/secret"
"#
        .to_string()
    }

    #[test]
    fn valid_config_passes_validation() {
        let config: Config = serde_yaml::from_str(&base_yaml()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn both_providers_set_fails() {
        let mut yaml = base_yaml();
        yaml.push_str("github:\n  client_id: g\n  client_secret_file: /tmp/g\n");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn neither_provider_set_fails() {
        let yaml = r#"
realm: "test"
initial_admins: ["admin"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be configured"));
    }

    #[test]
    fn empty_initial_admins_fails() {
        let mut config: Config = serde_yaml::from_str(&base_yaml()).unwrap();
        config.initial_admins.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initial_admins"));
    }

    #[test]
    fn unknown_loglevel_fails() {
        let mut config: Config = serde_yaml::from_str(&base_yaml()).unwrap();
        config.loglevel = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loglevel"));
    }

    #[test]
    fn unknown_scope_in_group_mapping_fails() {
        let mut config: Config = serde_yaml::from_str(&base_yaml()).unwrap();
        config.known_scopes.insert("exec:admin".to_string(), "Admin access".to_string());
        config
            .group_mapping
            .insert("exec:unknown".to_string(), vec!["group1".to_string()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown scope"));
    }

    #[test]
    fn group_mapping_inverts_to_group_to_scopes() {
        let mut config: Config = serde_yaml::from_str(&base_yaml()).unwrap();
        config
            .group_mapping
            .insert("exec:admin".to_string(), vec!["admins".to_string(), "ops".to_string()]);
        let inverted = config.group_to_scopes();
        assert!(inverted["admins"].contains("exec:admin"));
        assert!(inverted["ops"].contains("exec:admin"));
    }

    #[test]
    fn duration_roundtrip_various_units() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let w: Wrapper = serde_yaml::from_str("d: \"30s\"").unwrap();
        assert_eq!(w.d, Duration::from_secs(30));
        let w: Wrapper = serde_yaml::from_str("d: \"5m\"").unwrap();
        assert_eq!(w.d, Duration::from_secs(300));
        let w: Wrapper = serde_yaml::from_str("d: \"100ms\"").unwrap();
        assert_eq!(w.d, Duration::from_millis(100));
    }

    #[test]
    fn load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }
}
