//! The API credential shared by every endpoint handler.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{Result, RiftgateError};

/// Header carrying the API key on every request.
pub const API_KEY_HEADER: &str = "X-Riot-Token";

/// Single source of truth for the API key.
///
/// Handlers hold a clone and read [`current`](Self::current) each time they
/// build a request, so rotating the key is one swap no matter how many
/// handlers exist. Requests built before a rotation keep the key they read.
#[derive(Clone)]
pub struct CredentialStore {
    key: Arc<RwLock<Arc<str>>>,
}

impl CredentialStore {
    /// Create a store holding `key`.
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            key: Arc::new(RwLock::new(validate(key.as_ref())?)),
        })
    }

    /// The key to put on the next request.
    pub fn current(&self) -> Arc<str> {
        self.key.read().clone()
    }

    /// Replace the key for every handler sharing this store.
    pub fn rotate(&self, key: impl AsRef<str>) -> Result<()> {
        let key = validate(key.as_ref())?;
        *self.key.write() = key;
        info!("API key rotated");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").field("key", &"<redacted>").finish()
    }
}

fn validate(key: &str) -> Result<Arc<str>> {
    let key = key.trim();
    if key.is_empty() {
        return Err(RiftgateError::Config("API key must not be empty".to_string()));
    }
    Ok(Arc::from(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_is_visible_to_clones() {
        let store = CredentialStore::new("RGAPI-old").unwrap();
        let handler_view = store.clone();

        store.rotate("RGAPI-new").unwrap();

        assert_eq!(&*handler_view.current(), "RGAPI-new");
    }

    #[test]
    fn test_previously_read_key_is_unchanged() {
        let store = CredentialStore::new("RGAPI-old").unwrap();
        let in_flight = store.current();

        store.rotate("RGAPI-new").unwrap();

        assert_eq!(&*in_flight, "RGAPI-old");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(CredentialStore::new("  ").is_err());

        let store = CredentialStore::new("RGAPI-key").unwrap();
        assert!(store.rotate("").is_err());
        assert_eq!(&*store.current(), "RGAPI-key");
    }

    #[test]
    fn test_debug_redacts_key() {
        let store = CredentialStore::new("RGAPI-secret").unwrap();
        assert!(!format!("{:?}", store).contains("secret"));
    }
}
