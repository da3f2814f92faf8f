//! Limits and the usage windows that enforce them.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Longest window a limit may span. Longer advertised windows are rejected.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// One advertised limit: at most `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Maximum requests allowed in the window
    pub max_requests: u64,
    /// Length of the window
    pub window: Duration,
}

impl LimitSpec {
    /// Create a limit. Returns `None` for a zero count, a zero-length window
    /// or a window longer than [`MAX_WINDOW`].
    pub fn new(max_requests: u64, window: Duration) -> Option<Self> {
        if max_requests == 0 || window.is_zero() || window > MAX_WINDOW {
            return None;
        }
        Some(Self {
            max_requests,
            window,
        })
    }

    /// Create a limit from a whole number of seconds.
    pub fn per_seconds(max_requests: u64, window_secs: u64) -> Option<Self> {
        Self::new(max_requests, Duration::from_secs(window_secs))
    }
}

impl std::fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.max_requests, self.window.as_secs())
    }
}

/// A fixed window counting requests against one limit.
///
/// The window opens on the first request recorded in it and closes
/// `spec.window` later. Expiry is checked lazily.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    spec: LimitSpec,
    count: u64,
    started: Option<Instant>,
}

impl UsageWindow {
    /// Create an empty window for a limit.
    pub fn new(spec: LimitSpec) -> Self {
        Self {
            spec,
            count: 0,
            started: None,
        }
    }

    /// The limit this window enforces.
    pub fn spec(&self) -> LimitSpec {
        self.spec
    }

    /// Length of the window.
    pub fn length(&self) -> Duration {
        self.spec.window
    }

    /// Requests recorded in the current window.
    pub fn count(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.count
    }

    /// Replace the advertised maximum, keeping the current count.
    pub fn set_max_requests(&mut self, max_requests: u64) {
        self.spec.max_requests = max_requests;
    }

    /// Record one request, opening the window if it is inactive.
    pub fn record(&mut self, now: Instant) {
        self.expire(now);
        if self.started.is_none() {
            self.started = Some(now);
        }
        self.count += 1;
    }

    /// Raise the local count to a server-reported count.
    ///
    /// Local counts are never lowered: the server value may predate
    /// requests this process has already been granted.
    pub fn reconcile(&mut self, server_count: u64, now: Instant) {
        self.expire(now);
        if server_count > self.count {
            if self.started.is_none() {
                self.started = Some(now);
            }
            self.count = server_count;
        }
    }

    /// Time until a request fits under `capacity`, zero if it fits now.
    pub fn wait(&mut self, capacity: u64, now: Instant) -> Duration {
        self.expire(now);
        if self.count < capacity {
            return Duration::ZERO;
        }
        match self.started {
            Some(started) => started
                .checked_add(self.spec.window)
                .map_or(self.spec.window, |end| end.saturating_duration_since(now)),
            // Only reachable with a zero capacity, which `LimitSpec` rules out.
            None => self.spec.window,
        }
    }

    fn expire(&mut self, now: Instant) {
        if let Some(started) = self.started {
            if now.saturating_duration_since(started) >= self.spec.window {
                self.count = 0;
                self.started = None;
            }
        }
    }
}
