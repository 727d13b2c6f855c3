//! End-to-end-style tests for the `/auth` evaluator pipeline.
//!
//! These drive the same pure functions [`authorize::handler`] calls in
//! sequence — precondition check, credential resolution, scope/satisfy
//! combinator, challenge construction — the way a real request would walk
//! through them, without standing up the HTTP layer or its storage
//! collaborators.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use gafaelfawr_rs::authorize::evaluator::{self, AuthQuery, AuthType, Satisfy};
use gafaelfawr_rs::error::{ChallengeCode, www_authenticate};
use gafaelfawr_rs::token::{TokenData, TokenType};
use gafaelfawr_rs::Error;

fn session_token(scopes: &[&str], username: &str) -> TokenData {
    TokenData {
        key: "abc123".into(),
        secret: "s3cr3t".into(),
        username: username.into(),
        token_type: TokenType::Session,
        scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
        created: Utc::now(),
        expires: Some(Utc::now() + chrono::Duration::hours(1)),
        name: Some("Test User".into()),
        email: Some("test@example.com".into()),
        uid: Some(1000),
        gid: Some(1000),
        groups: Vec::new(),
        parent_key: None,
        service: None,
    }
}

/// No credential at all: 401 with an `invalid_token` challenge, never a
/// generic 400 — a caller hitting `/auth` cold must be told to authenticate.
#[test]
fn no_credential_yields_invalid_token_challenge() {
    let query = AuthQuery { scope: vec!["read:all".into()], ..Default::default() };
    evaluator::validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).unwrap();

    let resolved = evaluator::resolve_credential(None, None).unwrap();
    assert!(resolved.is_none());

    let err = Error::InvalidToken("Unable to find token".to_string());
    assert_eq!(err.challenge_code(), Some(ChallengeCode::InvalidToken));

    let challenge = www_authenticate(AuthType::Bearer.as_str(), "example", ChallengeCode::InvalidToken, &err.to_string(), None);
    assert!(challenge.starts_with(r#"Bearer realm="example""#));
    assert!(challenge.contains(r#"error="invalid_token""#));
    assert!(challenge.contains(r#"error_description="invalid token: Unable to find token""#));
}

/// A token missing a required scope under the default `satisfy=all`: 403
/// with `insufficient_scope` and the full required-scope list echoed back.
#[test]
fn missing_scope_yields_insufficient_scope_challenge() {
    let query = AuthQuery { scope: vec!["exec:admin".into()], ..Default::default() };
    let token = session_token(&["read:all"], "alice");

    let err = evaluator::check_authorization(&query.required_scopes(), query.satisfy, query.username.as_deref(), &token)
        .unwrap_err();
    assert!(matches!(&err, Error::InsufficientScope { required } if required == &vec!["exec:admin".to_string()]));
    assert_eq!(err.challenge_code(), Some(ChallengeCode::InsufficientScope));
    assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
}

/// `satisfy=any` succeeds as soon as one of several required scopes matches.
#[test]
fn satisfy_any_succeeds_on_partial_match() {
    let query = AuthQuery {
        scope: vec!["exec:admin".into(), "read:all".into()],
        satisfy: Satisfy::Any,
        ..Default::default()
    };
    let token = session_token(&["read:all"], "alice");

    evaluator::check_authorization(&query.required_scopes(), query.satisfy, query.username.as_deref(), &token).unwrap();
}

/// AJAX callers get 403 instead of 401 for a missing-credential failure
/// (the handler applies this rule; here we exercise the status mapping the
/// handler's `challenge_response` relies on).
#[test]
fn ajax_rule_upgrades_401_to_403() {
    let err = Error::InvalidToken("Unable to find token".to_string());
    let mut status = err.status();
    let is_ajax = true;
    if is_ajax && status == axum::http::StatusCode::UNAUTHORIZED {
        status = axum::http::StatusCode::FORBIDDEN;
    }
    assert_eq!(status, axum::http::StatusCode::FORBIDDEN);
}

/// AJAX never *downgrades* an already-403 insufficient-scope failure.
#[test]
fn ajax_rule_never_downgrades_already_forbidden() {
    let err = Error::InsufficientScope { required: vec!["exec:admin".into()] };
    let mut status = err.status();
    let is_ajax = true;
    if is_ajax && status == axum::http::StatusCode::UNAUTHORIZED {
        status = axum::http::StatusCode::FORBIDDEN;
    }
    assert_eq!(status, axum::http::StatusCode::FORBIDDEN);
}

/// `minimum_lifetime` above what the configured token lifetime (minus the
/// floor) can ever satisfy is rejected before any credential is even looked at.
#[test]
fn minimum_lifetime_beyond_ceiling_is_rejected_as_precondition() {
    let query = AuthQuery { minimum_lifetime: Some(7200), ..Default::default() };
    let err = evaluator::validate_preconditions(&query, Duration::from_secs(3600), Duration::from_secs(300)).unwrap_err();
    assert!(matches!(err, Error::InvalidMinimumLifetime));
    assert_eq!(err.status(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
}

/// `username` restricts success to a single identity even when scopes match.
#[test]
fn username_constraint_rejects_other_identities() {
    let query = AuthQuery {
        scope: vec!["read:all".into()],
        username: Some("bob".into()),
        ..Default::default()
    };
    let token = session_token(&["read:all"], "alice");
    let err = evaluator::check_authorization(&query.required_scopes(), query.satisfy, query.username.as_deref(), &token)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientScope { .. }));
}

/// `delegate_scope` narrows the internal token minted for `delegate_to`
/// without inflating what the parent request itself had to satisfy.
#[test]
fn delegate_scope_is_independent_of_required_scope() {
    let query = AuthQuery {
        scope: vec!["read:all".into()],
        delegate_to: Some("some-service".into()),
        delegate_scope: vec!["exec:admin".into()],
        ..Default::default()
    };
    assert_eq!(query.effective_delegate_scopes(), vec!["exec:admin".to_string()]);

    let parent_scopes: HashSet<String> = ["read:all".to_string(), "exec:admin".to_string()].into_iter().collect();
    assert!(evaluator::has_any_common_scope(&query.effective_delegate_scopes(), &parent_scopes));
}
