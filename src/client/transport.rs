//! The HTTP transport seam.
//!
//! Connection pooling, TLS and socket-level retries belong to whatever
//! implements [`Transport`]; handlers only see requests and responses.

use async_trait::async_trait;
use thiserror::Error;

/// A request ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Path and query, relative to the platform host
    pub path: String,
    /// Headers to send, including the credential
    pub headers: Vec<(String, String)>,
}

impl OutboundRequest {
    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response as received from the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Create a response with a status and no headers or body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Header pairs as string slices.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Failure before any response arrived (connect error, timeout, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends requests on behalf of every endpoint handler.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return the raw response.
    async fn send(&self, request: &OutboundRequest) -> Result<RawResponse, TransportError>;
}
