//! Rate limit accounting and admission control.

mod backend;
mod clock;
mod coordinator;
pub mod headers;
mod scope;
mod share;
mod tracker;
mod window;
pub mod wait;

pub use backend::AdmissionControl;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use coordinator::RateLimitCoordinator;
pub use headers::{ObservedCount, ObservedLimits, ViolationKind, MAX_RETRY_AFTER};
pub use scope::Scope;
pub use share::LimitingShare;
pub use tracker::{
    Admission, QuotaTracker, ScopeSnapshot, ScopeStatus, WindowSnapshot, FALLBACK_COOLDOWN,
};
pub use window::{LimitSpec, UsageWindow, MAX_WINDOW};

