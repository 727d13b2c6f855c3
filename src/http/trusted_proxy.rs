//! Trusted-proxy `X-Forwarded-For` resolution (§6).
//!
//! Runs before every other layer so that everything downstream — the
//! cookie/credential resolution in [`crate::authorize::handler`], the
//! `ip_address` recorded on history entries, and `/login`'s redirect-uri
//! construction — sees a single, already-trustworthy client IP rather than
//! a raw, attacker-influenced header.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};
use ipnet::IpNet;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Rewrites the inbound `X-Forwarded-For` header to the single resolved
/// client IP (§6): right-trimmed while entries fall inside a configured
/// proxy CIDR, stopping at the first non-matching entry or when one entry
/// remains. Downstream code that reads `x-forwarded-for` as "the client IP"
/// (history logging, `/login`'s redirect-uri builder) then sees exactly
/// that value, never the untrusted chain a client could have forged.
pub async fn middleware(
    State(proxies): State<Arc<Vec<IpNet>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let forwarded = request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let resolved = resolve_client_ip(forwarded.as_deref(), peer.ip(), &proxies);

    if let Ok(value) = HeaderValue::from_str(&resolved.to_string()) {
        request.headers_mut().insert(header::HeaderName::from_static(FORWARDED_FOR), value);
    }

    next.run(request).await
}

/// Pure resolution logic, kept separate from the middleware plumbing so it
/// is unit-testable without standing up a router.
///
/// If `proxies` is empty, the direct peer address is used unconditionally
/// (§6: "If `proxies` is empty, the direct peer address is used"). Otherwise
/// the `X-Forwarded-For` chain — `client, proxy1, proxy2, ...`, rightmost
/// closest to us — is trimmed from the right while the rightmost remaining
/// entry parses as an IP inside any configured CIDR, until either a
/// non-matching entry is reached or a single entry remains; that entry is
/// the resolved client IP.
#[must_use]
pub fn resolve_client_ip(forwarded_for: Option<&str>, peer: IpAddr, proxies: &[IpNet]) -> IpAddr {
    if proxies.is_empty() {
        return peer;
    }
    let Some(value) = forwarded_for else {
        return peer;
    };

    let mut entries: Vec<&str> = value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if entries.is_empty() {
        return peer;
    }

    while entries.len() > 1 {
        let Some(last) = entries.last() else { break };
        match last.parse::<IpAddr>() {
            Ok(ip) if proxies.iter().any(|cidr| cidr.contains(&ip)) => {
                entries.pop();
            }
            _ => break,
        }
    }

    entries.last().and_then(|s| s.parse().ok()).unwrap_or(peer)
}
