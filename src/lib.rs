//! Gafaelfawr Gateway Library
//!
//! An authentication/authorization gateway for `nginx auth_request`-style
//! ingress: an authorization evaluator (`/auth`), a token service issuing
//! session/notebook/internal tokens, an OIDC Provider, an OIDC Relying
//! Party, and a user-info service merging LDAP/docstore/token-claim data.
//!
//! # Components
//!
//! - [`token`] — opaque bearer tokens, their key-value/relational
//!   persistence, and derived-token dedup.
//! - [`store`] — the key-value, relational, LDAP, and document-store
//!   adapters the rest of the crate is built on.
//! - [`crypto`] — the Fernet-like cookie cipher.
//! - [`config`] — configuration loading and validation.
//! - [`session`] — the encrypted state cookie shared across login flows.
//! - [`oidc_provider`] — authorization-code issuance, ID-token signing,
//!   and JWKS/discovery publication.
//! - [`oidc_rp`] — upstream login initiation, code exchange, and ID-token
//!   verification (generic OIDC or GitHub).
//! - [`authorize`] — the `/auth` evaluator backing ingress `auth_request`.
//! - [`external`] — narrow interfaces for collaborators this crate does
//!   not implement: the Kubernetes CRD controller and the alerting channel.
//! - [`http`] — router assembly, trusted-proxy handling, and the server
//!   run loop tying every other module together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authorize;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod external;
pub mod http;
pub mod oidc_provider;
pub mod oidc_rp;
pub mod session;
pub mod store;
pub mod token;
pub mod userinfo;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
