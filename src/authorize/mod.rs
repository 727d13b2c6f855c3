//! The authorization evaluator backing `GET /auth` (§4.2): the ingress
//! `auth_request` sub-request target. Scope/`satisfy` matching, credential
//! resolution across cookie/Bearer/Basic, the AJAX-aware 401-vs-403 rule,
//! and success/challenge header assembly all live in [`evaluator`], kept
//! free of `axum` types so it can be unit tested without a running server;
//! [`handler`] is the thin HTTP translation.

pub mod evaluator;
pub mod handler;

pub use evaluator::{AuthQuery, Outcome, Satisfy};
