//! Router assembly, trusted-proxy handling, and the server run loop tying
//! every other module together (§5, §6).
//!
//! Each functional area (`/auth`, the OIDC Provider, the RP login/logout
//! flow, token management) already owns a `routes(state) -> Router` in its
//! own module; this one merges them behind shared middleware and drives
//! the bind/serve/shutdown lifecycle, the way the teacher's
//! `gateway::server`/`gateway::router` split the same concerns.

pub mod server;
pub mod trusted_proxy;

pub use server::Gateway;
