//! Parsing of server-advertised rate limit headers.
//!
//! Responses carry two hierarchical counters, one for the application and
//! one for the endpoint ("method"), each as comma-separated `count:window`
//! pairs, e.g. `X-App-Rate-Limit: 20:1,100:120`.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use super::window::{LimitSpec, MAX_WINDOW};

/// Longest cooldown honoured from a `Retry-After` header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Application limits.
pub const APP_RATE_LIMIT: &str = "x-app-rate-limit";
/// Application usage counts.
pub const APP_RATE_LIMIT_COUNT: &str = "x-app-rate-limit-count";
/// Endpoint limits.
pub const METHOD_RATE_LIMIT: &str = "x-method-rate-limit";
/// Endpoint usage counts.
pub const METHOD_RATE_LIMIT_COUNT: &str = "x-method-rate-limit-count";
/// Seconds to wait after a violation.
pub const RETRY_AFTER: &str = "retry-after";
/// Which limit a violation hit.
pub const RATE_LIMIT_TYPE: &str = "x-rate-limit-type";

/// A usage count reported by the server for one window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObservedCount {
    /// Requests the server has counted in the window
    pub count: u64,
    /// Length of the window the count belongs to
    pub window: Duration,
}

/// Which limit the server says was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The application-wide limit
    Application,
    /// The endpoint's own limit
    Method,
    /// The backing service's limit, attributed to the endpoint
    Service,
}

impl ViolationKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "application" => Some(ViolationKind::Application),
            "method" => Some(ViolationKind::Method),
            "service" => Some(ViolationKind::Service),
            _ => None,
        }
    }
}

/// Everything a response says about rate limits.
///
/// `None` in any field means "no new information".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservedLimits {
    /// Application limits
    pub application: Option<Vec<LimitSpec>>,
    /// Endpoint limits
    pub endpoint: Option<Vec<LimitSpec>>,
    /// Application usage counts
    pub application_counts: Option<Vec<ObservedCount>>,
    /// Endpoint usage counts
    pub endpoint_counts: Option<Vec<ObservedCount>>,
    /// Server-advised wait after a violation
    pub retry_after: Option<Duration>,
    /// Which limit was violated, if the server said
    pub violation: Option<ViolationKind>,
}

impl ObservedLimits {
    /// Build from any set of header name/value pairs. Names are matched
    /// case-insensitively.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut observed = ObservedLimits::default();

        for (name, value) in headers {
            match name.to_ascii_lowercase().as_str() {
                APP_RATE_LIMIT => observed.application = parse_limits(name, value),
                METHOD_RATE_LIMIT => observed.endpoint = parse_limits(name, value),
                APP_RATE_LIMIT_COUNT => observed.application_counts = parse_counts(name, value),
                METHOD_RATE_LIMIT_COUNT => observed.endpoint_counts = parse_counts(name, value),
                RETRY_AFTER => observed.retry_after = parse_retry_after(value),
                RATE_LIMIT_TYPE => observed.violation = ViolationKind::parse(value),
                _ => {}
            }
        }

        observed
    }

    /// Whether the response carried nothing rate-limit related.
    pub fn is_empty(&self) -> bool {
        *self == ObservedLimits::default()
    }
}

/// Parse `count:window` pairs into limits.
///
/// Any malformed pair discards the whole header.
pub fn parse_limits(name: &str, value: &str) -> Option<Vec<LimitSpec>> {
    let pairs = parse_pairs(name, value)?;
    let mut limits = Vec::with_capacity(pairs.len());
    for (count, window) in pairs {
        match LimitSpec::per_seconds(count, window) {
            Some(spec) => limits.push(spec),
            None => {
                warn!(
                    header = name,
                    value = value,
                    "Ignoring rate limit header with a zero or out-of-range limit"
                );
                return None;
            }
        }
    }
    Some(limits)
}

/// Parse `count:window` pairs into usage counts.
pub fn parse_counts(name: &str, value: &str) -> Option<Vec<ObservedCount>> {
    let pairs = parse_pairs(name, value)?;
    let mut counts = Vec::with_capacity(pairs.len());
    for (count, window) in pairs {
        let window = Duration::from_secs(window);
        if window.is_zero() || window > MAX_WINDOW {
            warn!(
                header = name,
                value = value,
                "Ignoring rate limit count with a zero or out-of-range window"
            );
            return None;
        }
        counts.push(ObservedCount { count, window });
    }
    Some(counts)
}

/// Parse a `Retry-After` value given in seconds, capped at
/// [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }
    match value.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Some(
            Duration::try_from_secs_f64(secs)
                .map_or(MAX_RETRY_AFTER, |wait| wait.min(MAX_RETRY_AFTER)),
        ),
        _ => {
            warn!(value = value, "Ignoring unparseable Retry-After header");
            None
        }
    }
}

fn parse_pairs(name: &str, value: &str) -> Option<Vec<(u64, u64)>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let mut pairs = Vec::new();
    for pair in value.split(',') {
        let parsed = pair.trim().split_once(':').and_then(|(count, window)| {
            Some((count.trim().parse::<u64>().ok()?, window.trim().parse::<u64>().ok()?))
        });
        match parsed {
            Some(pair) => pairs.push(pair),
            None => {
                warn!(header = name, value = value, "Ignoring malformed rate limit header");
                return None;
            }
        }
    }
    Some(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limits() {
        let limits = parse_limits(APP_RATE_LIMIT, "20:1,100:120").unwrap();
        assert_eq!(
            limits,
            vec![
                LimitSpec::per_seconds(20, 1).unwrap(),
                LimitSpec::per_seconds(100, 120).unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_limits_tolerates_whitespace() {
        let limits = parse_limits(APP_RATE_LIMIT, " 20 : 1 , 100:120 ").unwrap();
        assert_eq!(limits.len(), 2);
    }

    #[test]
    fn test_malformed_header_is_no_information() {
        assert!(parse_limits(APP_RATE_LIMIT, "").is_none());
        assert!(parse_limits(APP_RATE_LIMIT, "20:1,abc").is_none());
        assert!(parse_limits(APP_RATE_LIMIT, "20:1,100").is_none());
        assert!(parse_limits(APP_RATE_LIMIT, "-5:1").is_none());
        assert!(parse_limits(APP_RATE_LIMIT, "0:10").is_none());
    }

    #[test]
    fn test_parse_counts() {
        let counts = parse_counts(APP_RATE_LIMIT_COUNT, "1:1,0:120").unwrap();
        assert_eq!(counts[0].count, 1);
        assert_eq!(counts[1].count, 0);
        assert_eq!(counts[1].window, Duration::from_secs(120));
        assert!(parse_counts(APP_RATE_LIMIT_COUNT, "1:0").is_none());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn test_huge_retry_after_is_capped() {
        assert_eq!(parse_retry_after("18446744073709551615"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("1e300"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("inf"), None);

        let observed = ObservedLimits::from_headers([("Retry-After", "1e300")]);
        assert_eq!(observed.retry_after, Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_oversized_window_is_no_information() {
        assert!(parse_limits(METHOD_RATE_LIMIT, "1:18446744073709551615").is_none());
        assert!(parse_limits(METHOD_RATE_LIMIT, "10:10,1:86401").is_none());
        assert!(parse_counts(METHOD_RATE_LIMIT_COUNT, "1:18446744073709551615").is_none());

        let observed = ObservedLimits::from_headers([("X-Method-Rate-Limit", "1:18446744073709551615")]);
        assert!(observed.is_empty());
    }

    #[test]
    fn test_from_headers() {
        let headers = [
            ("X-App-Rate-Limit", "20:1,100:120"),
            ("X-App-Rate-Limit-Count", "3:1,40:120"),
            ("X-Method-Rate-Limit", "2000:60"),
            ("X-Method-Rate-Limit-Count", "5:60"),
            ("Retry-After", "7"),
            ("X-Rate-Limit-Type", "method"),
            ("Content-Type", "application/json"),
        ];

        let observed = ObservedLimits::from_headers(headers);

        assert_eq!(observed.application.as_ref().unwrap().len(), 2);
        assert_eq!(
            observed.endpoint,
            Some(vec![LimitSpec::per_seconds(2000, 60).unwrap()])
        );
        assert_eq!(observed.application_counts.as_ref().unwrap()[1].count, 40);
        assert_eq!(observed.endpoint_counts.as_ref().unwrap()[0].count, 5);
        assert_eq!(observed.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(observed.violation, Some(ViolationKind::Method));
    }

    #[test]
    fn test_from_headers_without_limits() {
        let observed = ObservedLimits::from_headers([("Content-Type", "application/json")]);
        assert!(observed.is_empty());
    }

    #[test]
    fn test_unknown_violation_type() {
        let observed = ObservedLimits::from_headers([("X-Rate-Limit-Type", "galaxy")]);
        assert_eq!(observed.violation, None);
    }
}
