//! Limiting share applied to the application-wide budget.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RiftgateError};

/// Absorbs float error in products such as `100 * 0.29`.
const ROUNDING_SLACK: f64 = 1e-9;

/// The fraction of a globally advertised application quota that this
/// process may consume.
///
/// Always in (0, 1]. Invalid values are rejected rather than clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct LimitingShare(f64);

impl LimitingShare {
    /// The whole quota.
    pub const FULL: LimitingShare = LimitingShare(1.0);

    /// Validate and wrap a share.
    pub fn new(fraction: f64) -> Result<Self> {
        if fraction.is_finite() && fraction > 0.0 && fraction <= 1.0 {
            Ok(Self(fraction))
        } else {
            Err(RiftgateError::InvalidLimitingShare(fraction))
        }
    }

    /// The raw fraction.
    pub fn get(&self) -> f64 {
        self.0
    }

    /// Whether this share is the whole quota.
    pub fn is_full(&self) -> bool {
        self.0 >= 1.0
    }

    /// Scale an advertised maximum: rounded down, at least 1, never above
    /// the advertised value.
    pub fn apply(&self, max_requests: u64) -> u64 {
        let scaled = ((max_requests as f64) * self.0 + ROUNDING_SLACK).floor() as u64;
        scaled.clamp(1, max_requests.max(1))
    }
}

impl Default for LimitingShare {
    fn default() -> Self {
        Self::FULL
    }
}

impl TryFrom<f64> for LimitingShare {
    type Error = RiftgateError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<LimitingShare> for f64 {
    fn from(share: LimitingShare) -> Self {
        share.0
    }
}
