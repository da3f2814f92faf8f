//! Per-scope quota accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::headers::{ObservedCount, MAX_RETRY_AFTER};
use super::scope::Scope;
use super::share::LimitingShare;
use super::window::{LimitSpec, UsageWindow};

/// Cooldown used for a violation on a scope with no known windows.
pub const FALLBACK_COOLDOWN: Duration = Duration::from_secs(1);

/// Where a scope sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStatus {
    /// No limit has been observed yet
    Unconstrained,
    /// Under capacity in every window
    Available,
    /// At capacity in at least one window
    Saturated,
    /// Cooling down after a server-reported violation
    Penalized,
}

/// Read-only view of one window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    /// Advertised maximum
    pub max_requests: u64,
    /// Maximum after the limiting share
    pub capacity: u64,
    /// Requests counted in the current window
    pub count: u64,
    /// Window length in seconds
    pub window_secs: f64,
    /// Time until a request fits, in seconds
    pub wait_secs: f64,
}

/// Read-only view of one scope.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeSnapshot {
    pub scope: Scope,
    pub status: ScopeStatus,
    pub windows: Vec<WindowSnapshot>,
    /// Remaining forced cooldown, in seconds
    pub penalty_secs: f64,
}

/// Limits, windows and cooldown for one scope.
#[derive(Debug, Default)]
struct ScopeState {
    windows: Vec<UsageWindow>,
    penalty_until: Option<Instant>,
}

impl ScopeState {
    fn wait(&mut self, share: Option<LimitingShare>, now: Instant) -> Duration {
        let penalty = self.penalty_remaining(now);
        self.windows
            .iter_mut()
            .map(|window| {
                let capacity = capacity(window.spec(), share);
                window.wait(capacity, now)
            })
            .fold(penalty, Duration::max)
    }

    fn penalty_remaining(&mut self, now: Instant) -> Duration {
        match self.penalty_until {
            Some(until) if until > now => until - now,
            Some(_) => {
                self.penalty_until = None;
                Duration::ZERO
            }
            None => Duration::ZERO,
        }
    }

    fn record(&mut self, now: Instant) {
        for window in &mut self.windows {
            window.record(now);
        }
    }

    /// Returns whether anything changed.
    fn replace_limits(&mut self, specs: &[LimitSpec]) -> bool {
        let mut next: Vec<UsageWindow> = Vec::with_capacity(specs.len());
        let mut changed = specs.len() != self.windows.len();

        for spec in specs {
            if next.iter().any(|w| w.length() == spec.window) {
                continue;
            }
            let position = self.windows.iter().position(|w| w.length() == spec.window);
            let window = match position.map(|idx| self.windows.swap_remove(idx)) {
                Some(mut window) => {
                    if window.spec().max_requests != spec.max_requests {
                        window.set_max_requests(spec.max_requests);
                        changed = true;
                    }
                    window
                }
                None => {
                    changed = true;
                    UsageWindow::new(*spec)
                }
            };
            next.push(window);
        }

        next.sort_by_key(UsageWindow::length);
        self.windows = next;
        changed
    }

    fn reconcile(&mut self, counts: &[ObservedCount], now: Instant) {
        for observed in counts {
            if let Some(window) = self.windows.iter_mut().find(|w| w.length() == observed.window) {
                window.reconcile(observed.count, now);
            }
        }
    }

    fn penalize(&mut self, until: Instant) {
        self.penalty_until = Some(match self.penalty_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    fn snapshot(&mut self, scope: Scope, share: Option<LimitingShare>, now: Instant) -> ScopeSnapshot {
        let penalty = self.penalty_remaining(now);
        let windows: Vec<WindowSnapshot> = self
            .windows
            .iter_mut()
            .map(|window| {
                let spec = window.spec();
                let capacity = capacity(spec, share);
                WindowSnapshot {
                    max_requests: spec.max_requests,
                    capacity,
                    count: window.count(now),
                    window_secs: spec.window.as_secs_f64(),
                    wait_secs: window.wait(capacity, now).as_secs_f64(),
                }
            })
            .collect();

        let status = if !penalty.is_zero() {
            ScopeStatus::Penalized
        } else if windows.is_empty() {
            ScopeStatus::Unconstrained
        } else if windows.iter().any(|w| w.wait_secs > 0.0) {
            ScopeStatus::Saturated
        } else {
            ScopeStatus::Available
        };

        ScopeSnapshot {
            scope,
            status,
            windows,
            penalty_secs: penalty.as_secs_f64(),
        }
    }
}

/// Effective capacity: the share only scales application limits.
fn capacity(spec: LimitSpec, share: Option<LimitingShare>) -> u64 {
    match share {
        Some(share) => share.apply(spec.max_requests),
        None => spec.max_requests,
    }
}

/// The result of an atomic admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the request may be sent now
    Granted,
    /// No slot was taken; try again after this long
    Wait(Duration),
}

impl Admission {
    /// Whether a slot was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// The required wait, zero when granted.
    pub fn wait(&self) -> Duration {
        match self {
            Admission::Granted => Duration::ZERO,
            Admission::Wait(wait) => *wait,
        }
    }
}

/// Tracks limits and usage for the application scope and every endpoint
/// scope seen so far.
///
/// Each scope has its own lock. When both the application and an endpoint
/// record are needed, the application record is always locked first.
pub struct QuotaTracker {
    application: Mutex<ScopeState>,
    endpoints: DashMap<String, Arc<Mutex<ScopeState>>>,
    share: RwLock<LimitingShare>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    /// Create an empty tracker.
    pub fn new(share: LimitingShare, clock: Arc<dyn Clock>) -> Self {
        Self {
            application: Mutex::new(ScopeState::default()),
            endpoints: DashMap::new(),
            share: RwLock::new(share),
            clock,
        }
    }

    /// The share applied to application limits.
    pub fn share(&self) -> LimitingShare {
        *self.share.read()
    }

    /// Replace the share used by later capacity checks.
    pub fn set_share(&self, share: LimitingShare) {
        *self.share.write() = share;
    }

    /// Replace the limits for a scope.
    ///
    /// Windows whose length is unchanged keep their counts; windows no longer
    /// advertised are dropped. An empty list carries no information and is
    /// ignored.
    pub fn record_limits(&self, scope: &Scope, specs: &[LimitSpec]) {
        if specs.is_empty() {
            return;
        }
        let changed = match scope {
            Scope::Application => self.application.lock().replace_limits(specs),
            Scope::Endpoint(name) => self.endpoint_state(name).lock().replace_limits(specs),
        };
        if changed {
            debug!(
                scope = %scope,
                limits = %format_specs(specs),
                "Rate limits updated"
            );
        }
    }

    /// Raise local counts to server-reported counts.
    ///
    /// Application counts are skipped under a partial share, since the
    /// server total includes other instances' usage.
    pub fn record_counts(&self, scope: &Scope, counts: &[ObservedCount]) {
        let now = self.clock.now();
        match scope {
            Scope::Application => {
                if self.share().is_full() {
                    self.application.lock().reconcile(counts, now);
                }
            }
            Scope::Endpoint(name) => {
                self.with_existing(name, |state| state.reconcile(counts, now));
            }
        }
    }

    /// Count one attempted request against a scope.
    pub fn record_usage(&self, scope: &Scope) {
        let now = self.clock.now();
        match scope {
            Scope::Application => self.application.lock().record(now),
            Scope::Endpoint(name) => self.endpoint_state(name).lock().record(now),
        }
    }

    /// How long until a request in `scope` would be admitted.
    ///
    /// For an endpoint scope this is the larger of the endpoint wait and the
    /// application wait. Scopes with no recorded limits never wait.
    pub fn time_until_available(&self, scope: &Scope) -> Duration {
        let now = self.clock.now();
        let share = self.share();
        let application = self.application.lock().wait(Some(share), now);
        match scope {
            Scope::Application => application,
            Scope::Endpoint(name) => {
                let endpoint = self
                    .with_existing(name, |state| state.wait(None, now))
                    .unwrap_or(Duration::ZERO);
                application.max(endpoint)
            }
        }
    }

    /// Force a cooldown of at least `retry_after` on a scope, capped at
    /// [`MAX_RETRY_AFTER`].
    pub fn penalize(&self, scope: &Scope, retry_after: Duration) {
        let retry_after = retry_after.min(MAX_RETRY_AFTER);
        let now = self.clock.now();
        let Some(until) = now.checked_add(retry_after) else {
            warn!(scope = %scope, retry_after = ?retry_after, "Cooldown end is not representable");
            return;
        };
        match scope {
            Scope::Application => self.application.lock().penalize(until),
            Scope::Endpoint(name) => self.endpoint_state(name).lock().penalize(until),
        }
        warn!(
            scope = %scope,
            retry_after = ?retry_after,
            "Scope penalized after limit violation"
        );
    }

    /// The cooldown to apply when a violation comes without `Retry-After`:
    /// the narrowest known window of the scope.
    pub fn default_cooldown(&self, scope: &Scope) -> Duration {
        let narrowest = match scope {
            Scope::Application => self.application.lock().windows.first().map(UsageWindow::length),
            Scope::Endpoint(name) => self
                .with_existing(name, |state| state.windows.first().map(UsageWindow::length))
                .flatten(),
        };
        narrowest.unwrap_or(FALLBACK_COOLDOWN)
    }

    /// Atomically check the application and endpoint scopes and, if both
    /// have room, count the request against both.
    pub fn try_admit(&self, endpoint: &str) -> Admission {
        let state = self.endpoint_state(endpoint);
        let share = self.share();

        let mut application = self.application.lock();
        let mut endpoint_state = state.lock();
        let now = self.clock.now();

        let wait = application
            .wait(Some(share), now)
            .max(endpoint_state.wait(None, now));

        if wait.is_zero() {
            application.record(now);
            endpoint_state.record(now);
            trace!(endpoint = endpoint, "Admission granted");
            Admission::Granted
        } else {
            trace!(endpoint = endpoint, wait = ?wait, "Admission deferred");
            Admission::Wait(wait)
        }
    }

    /// Snapshot of a single scope, `None` for an endpoint never seen.
    pub fn scope_snapshot(&self, scope: &Scope) -> Option<ScopeSnapshot> {
        let now = self.clock.now();
        let share = self.share();
        match scope {
            Scope::Application => Some(self.application.lock().snapshot(scope.clone(), Some(share), now)),
            Scope::Endpoint(name) => {
                self.with_existing(name, |state| state.snapshot(scope.clone(), None, now))
            }
        }
    }

    /// Snapshot of every scope, application first, endpoints by name.
    pub fn snapshot(&self) -> Vec<ScopeSnapshot> {
        let mut names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        names.sort();

        std::iter::once(Scope::Application)
            .chain(names.into_iter().map(Scope::Endpoint))
            .filter_map(|scope| self.scope_snapshot(&scope))
            .collect()
    }

    /// Number of endpoint scopes seen so far.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn endpoint_state(&self, name: &str) -> Arc<Mutex<ScopeState>> {
        if let Some(state) = self.endpoints.get(name) {
            return Arc::clone(&state);
        }
        Arc::clone(&self.endpoints.entry(name.to_string()).or_default())
    }

    /// Run `f` against an endpoint's state without creating it.
    fn with_existing<R>(&self, name: &str, f: impl FnOnce(&mut ScopeState) -> R) -> Option<R> {
        let state = self.endpoints.get(name).map(|state| Arc::clone(&state))?;
        let mut guard = state.lock();
        Some(f(&mut guard))
    }
}

fn format_specs(specs: &[LimitSpec]) -> String {
    specs
        .iter()
        .map(LimitSpec::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
