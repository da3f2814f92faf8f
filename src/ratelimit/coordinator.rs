//! The shared rate limit coordinator.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::backend::AdmissionControl;
use super::clock::{Clock, MonotonicClock};
use super::headers::{ObservedLimits, ViolationKind};
use super::scope::Scope;
use super::share::LimitingShare;
use super::tracker::{Admission, QuotaTracker, ScopeSnapshot};
use crate::error::Result;

/// Decides, for every outgoing request from any endpoint handler, whether it
/// may go now or how long it must wait.
///
/// One coordinator is shared (behind an `Arc`) by every handler using the
/// same credential. It performs no I/O and never blocks: callers wait out a
/// returned [`Admission::Wait`] however suits their runtime.
pub struct RateLimitCoordinator {
    tracker: QuotaTracker,
}

impl RateLimitCoordinator {
    /// Create a coordinator on the process monotonic clock.
    pub fn new(share: LimitingShare) -> Self {
        Self::with_clock(share, Arc::new(MonotonicClock))
    }

    /// Create a coordinator on a custom clock.
    pub fn with_clock(share: LimitingShare, clock: Arc<dyn Clock>) -> Self {
        Self {
            tracker: QuotaTracker::new(share, clock),
        }
    }

    /// Ask to send one request to `endpoint`.
    ///
    /// On [`Admission::Granted`] the request has been counted against both the
    /// application and endpoint scopes and must be attempted. On
    /// [`Admission::Wait`] nothing was counted; retry after the wait.
    pub fn acquire(&self, endpoint: &str) -> Admission {
        self.tracker.try_admit(endpoint)
    }

    /// Feed a completed response back into the accounting.
    ///
    /// Limits present in `observed` replace the known limits of the
    /// application and endpoint scopes; missing or malformed headers leave
    /// them untouched. When `limit_violated` is set, the violated scope(s)
    /// are forced into a cooldown of `retry_after`, or of the scope's
    /// narrowest window when the server gave no `Retry-After`.
    pub fn report_response(
        &self,
        endpoint: &str,
        observed: &ObservedLimits,
        limit_violated: bool,
        retry_after: Option<Duration>,
    ) {
        let endpoint_scope = Scope::endpoint(endpoint);

        if let Some(limits) = &observed.application {
            self.tracker.record_limits(&Scope::Application, limits);
        }
        if let Some(limits) = &observed.endpoint {
            self.tracker.record_limits(&endpoint_scope, limits);
        }
        if let Some(counts) = &observed.application_counts {
            self.tracker.record_counts(&Scope::Application, counts);
        }
        if let Some(counts) = &observed.endpoint_counts {
            self.tracker.record_counts(&endpoint_scope, counts);
        }

        if !limit_violated {
            return;
        }

        // An unattributed violation penalizes both scopes.
        let violated = match observed.violation {
            Some(ViolationKind::Application) => vec![Scope::Application],
            Some(ViolationKind::Method) | Some(ViolationKind::Service) => vec![endpoint_scope],
            None => vec![Scope::Application, endpoint_scope],
        };

        warn!(
            endpoint = endpoint,
            kind = ?observed.violation,
            retry_after = ?retry_after,
            "Server reported a rate limit violation"
        );

        for scope in &violated {
            let cooldown = match retry_after {
                Some(wait) => wait,
                None => {
                    let fallback = self.tracker.default_cooldown(scope);
                    debug!(
                        scope = %scope,
                        cooldown = ?fallback,
                        "No Retry-After given, using narrowest window"
                    );
                    fallback
                }
            };
            self.tracker.penalize(scope, cooldown);
        }
    }

    /// Report a response using the violation and `Retry-After` carried in
    /// the parsed headers. `status` is the HTTP status; 429 is a violation.
    pub fn report_observed(&self, endpoint: &str, status: u16, observed: &ObservedLimits) {
        self.report_response(endpoint, observed, status == 429, observed.retry_after);
    }

    /// Change the fraction of the application quota this process may use.
    ///
    /// Takes effect on the next [`acquire`](Self::acquire). Values outside
    /// (0, 1] are rejected.
    pub fn set_limiting_share(&self, fraction: f64) -> Result<()> {
        let share = LimitingShare::new(fraction)?;
        self.tracker.set_share(share);
        info!(share = fraction, "Limiting share updated");
        Ok(())
    }

    /// The current limiting share.
    pub fn limiting_share(&self) -> LimitingShare {
        self.tracker.share()
    }

    /// How long a request to `endpoint` would wait right now.
    pub fn time_until_available(&self, endpoint: &str) -> Duration {
        self.tracker.time_until_available(&Scope::endpoint(endpoint))
    }

    /// Snapshot of one scope.
    pub fn scope_state(&self, scope: &Scope) -> Option<ScopeSnapshot> {
        self.tracker.scope_snapshot(scope)
    }

    /// Snapshot of every known scope.
    pub fn snapshot(&self) -> Vec<ScopeSnapshot> {
        self.tracker.snapshot()
    }

    /// The underlying tracker.
    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }
}

impl Default for RateLimitCoordinator {
    fn default() -> Self {
        Self::new(LimitingShare::FULL)
    }
}

impl AdmissionControl for RateLimitCoordinator {
    fn acquire(&self, endpoint: &str) -> Admission {
        RateLimitCoordinator::acquire(self, endpoint)
    }

    fn report_response(
        &self,
        endpoint: &str,
        observed: &ObservedLimits,
        limit_violated: bool,
        retry_after: Option<Duration>,
    ) {
        RateLimitCoordinator::report_response(self, endpoint, observed, limit_violated, retry_after)
    }
}
