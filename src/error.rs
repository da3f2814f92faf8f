//! Error types for Riftgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Riftgate operations.
///
/// Waiting for rate-limit capacity is flow control and never shows up here.
#[derive(Error, Debug)]
pub enum RiftgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiting share outside (0, 1]
    #[error("Invalid limiting share {0}: must be in (0, 1]")]
    InvalidLimitingShare(f64),

    /// A caller-side deadline expired before a slot was granted
    #[error("Gave up waiting for admission to {scope} after {waited:?}")]
    AdmissionTimeout { scope: String, waited: Duration },

    /// The transport failed before a response was received
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote API answered 404
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The remote API answered with a status the handler does not retry
    #[error("Unexpected status {status} from {path}")]
    Status { status: u16, path: String },

    /// Every permitted attempt was used up
    #[error("Request to {path} failed after {attempts} attempts (last status {status})")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        status: u16,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Riftgate operations.
pub type Result<T> = std::result::Result<T, RiftgateError>;
