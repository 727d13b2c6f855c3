//! User-info service: merges claim-derived, LDAP, and document-store data
//! (§4.4) behind the process-local UID/GID cache.

pub mod cache;
pub mod service;

pub use cache::IdCache;
pub use service::{ResolvedUserInfo, UserInfoService};
