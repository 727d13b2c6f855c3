//! `Alerter`: the operational-failure notification seam (spec.md §9), in
//! place of the original's Slack webhook. Deliberately synchronous and
//! fire-and-forget — a failure to alert must never fail the request that
//! triggered it, so there is no `Result` to propagate.

use tracing::error;

/// Notify an operator of a condition that needs attention (UID/GID
/// exhaustion, a reaper sweep that keeps failing, and similar).
///
/// One method by design, mirroring the teacher's narrow single-purpose
/// traits at integration seams (e.g. `KvStore`, `RelationalStore`): a real
/// deployment implements this against whatever channel it already has
/// (Slack webhook, PagerDuty, email) without the core needing to know.
pub trait Alerter: Send + Sync {
    /// Send `title`/`body` to wherever this deployment's operators look.
    fn alert(&self, title: &str, body: &str);
}

/// Discards every alert. The default for tests and for deployments that
/// have not wired anything up yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAlerter;

impl Alerter for NullAlerter {
    fn alert(&self, _title: &str, _body: &str) {}
}

/// Logs alerts at `error` level via `tracing`, so they at least reach
/// whatever log aggregation the deployment already has even with no
/// external channel configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlerter;

impl Alerter for LoggingAlerter {
    fn alert(&self, title: &str, body: &str) {
        error!(alert.title = %title, alert.body = %body, "operational alert");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_alerter_does_not_panic() {
        NullAlerter.alert("title", "body");
    }

    #[test]
    fn logging_alerter_does_not_panic() {
        LoggingAlerter.alert("title", "body");
    }
}
