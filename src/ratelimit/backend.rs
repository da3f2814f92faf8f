//! Admission control trait for abstracting the coordinator from handlers.

use std::time::Duration;

use super::headers::ObservedLimits;
use super::tracker::Admission;

/// The two calls an endpoint handler makes around every request.
///
/// Implemented by [`RateLimitCoordinator`](super::RateLimitCoordinator);
/// handlers depend on this trait so they can be exercised against fakes.
pub trait AdmissionControl: Send + Sync {
    /// Ask for a slot to send one request to `endpoint`.
    fn acquire(&self, endpoint: &str) -> Admission;

    /// Report the rate limit metadata of a completed response.
    fn report_response(
        &self,
        endpoint: &str,
        observed: &ObservedLimits,
        limit_violated: bool,
        retry_after: Option<Duration>,
    );
}
