//! Rate limit scopes.

use serde::{Deserialize, Serialize};

/// A rate limit domain.
///
/// The application scope covers every request made with one credential.
/// Endpoint scopes cover a single endpoint category and are always checked
/// together with the application scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Scope {
    /// The whole credential
    Application,
    /// One endpoint category, identified by name
    Endpoint(String),
}

impl Scope {
    /// Create an endpoint scope.
    pub fn endpoint(name: impl Into<String>) -> Self {
        Scope::Endpoint(name.into())
    }

    /// Whether this is the application scope.
    pub fn is_application(&self) -> bool {
        matches!(self, Scope::Application)
    }

    /// The endpoint name, if this is an endpoint scope.
    pub fn endpoint_name(&self) -> Option<&str> {
        match self {
            Scope::Application => None,
            Scope::Endpoint(name) => Some(name),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Application => write!(f, "application"),
            Scope::Endpoint(name) => write!(f, "endpoint:{}", name),
        }
    }
}
