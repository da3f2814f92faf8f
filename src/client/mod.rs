//! Handler-side glue: one coordinator, one credential, many handlers.

mod endpoint;
mod retry;
mod transport;

pub use endpoint::{EndpointHandler, Service};
pub use retry::BackoffPolicy;
pub use transport::{OutboundRequest, RawResponse, Transport, TransportError};

use std::sync::Arc;

use tracing::info;

use crate::config::{ClientConfig, HandlerConfig};
use crate::credentials::CredentialStore;
use crate::error::{Result, RiftgateError};
use crate::ratelimit::RateLimitCoordinator;

/// A client for every service, sharing one rate limit budget and one
/// credential.
pub struct ApiClient {
    coordinator: Arc<RateLimitCoordinator>,
    credentials: CredentialStore,
    transport: Arc<dyn Transport>,
    handlers: HandlerConfig,
}

impl ApiClient {
    /// Build a client from configuration. The API key is required.
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| RiftgateError::Config("api_key is required".to_string()))?;

        let coordinator = Arc::new(RateLimitCoordinator::new(config.share()?));
        info!(
            limiting_share = config.limiting_share,
            services = Service::ALL.len(),
            "API client initialized"
        );

        Ok(Self {
            coordinator,
            credentials: CredentialStore::new(api_key)?,
            transport,
            handlers: config.handlers.clone(),
        })
    }

    /// A handler for one service, gated by the shared coordinator.
    pub fn handler(&self, service: Service) -> EndpointHandler {
        EndpointHandler::new(
            service,
            self.coordinator.clone(),
            self.credentials.clone(),
            self.transport.clone(),
            &self.handlers,
        )
    }

    /// One handler per service.
    pub fn handlers(&self) -> Vec<EndpointHandler> {
        Service::ALL.iter().map(|&service| self.handler(service)).collect()
    }

    /// Rotate the API key for every handler, including ones already built.
    pub fn set_api_key(&self, key: &str) -> Result<()> {
        self.credentials.rotate(key)
    }

    /// Change this process's share of the application quota.
    pub fn set_limiting_share(&self, fraction: f64) -> Result<()> {
        self.coordinator.set_limiting_share(fraction)
    }

    /// The shared coordinator.
    pub fn coordinator(&self) -> &Arc<RateLimitCoordinator> {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::credentials::API_KEY_HEADER;
    use crate::ratelimit::{Scope, ScopeStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays canned responses and remembers what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::result::Result<RawResponse, TransportError>>>,
        sent: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<std::result::Result<RawResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<OutboundRequest> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: &OutboundRequest,
        ) -> std::result::Result<RawResponse, TransportError> {
            self.sent.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(RawResponse::new(200)))
        }
    }

    fn config() -> ClientConfig {
        let fast = BackoffConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            backoff_factor: 1.0,
            max_backoff_ms: 1000,
            jitter: false,
        };
        ClientConfig {
            api_key: Some("RGAPI-first".to_string()),
            limiting_share: 1.0,
            handlers: HandlerConfig {
                rate_limited: fast.clone(),
                server_error: fast,
                admission_timeout_secs: Some(5),
            },
        }
    }

    fn ok_with_limits() -> RawResponse {
        RawResponse::new(200)
            .with_header("X-App-Rate-Limit", "20:1,100:120")
            .with_header("X-App-Rate-Limit-Count", "1:1,1:120")
            .with_header("X-Method-Rate-Limit", "50:10")
            .with_header("X-Method-Rate-Limit-Count", "1:10")
            .with_body("{}")
    }

    #[test]
    fn test_api_key_required() {
        let mut config = config();
        config.api_key = None;
        let result = ApiClient::new(&config, ScriptedTransport::with(vec![]));
        assert!(matches!(result, Err(RiftgateError::Config(_))));
    }

    #[test]
    fn test_invalid_share_rejected() {
        let mut config = config();
        config.limiting_share = 2.0;
        let result = ApiClient::new(&config, ScriptedTransport::with(vec![]));
        assert!(matches!(result, Err(RiftgateError::InvalidLimitingShare(_))));
    }

    #[test]
    fn test_one_handler_per_service() {
        let client = ApiClient::new(&config(), ScriptedTransport::with(vec![])).unwrap();
        let handlers = client.handlers();
        assert_eq!(handlers.len(), Service::ALL.len());
        assert_eq!(handlers[6].service(), Service::Match);
        assert_eq!(handlers[6].scope_name("by-id"), "match:by-id");
    }

    #[tokio::test]
    async fn test_success_records_limits() {
        let transport = ScriptedTransport::with(vec![Ok(ok_with_limits())]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();

        let body = client
            .handler(Service::Summoner)
            .get("by-name", "/summoner/v4/summoners/by-name/x")
            .await
            .unwrap();

        assert_eq!(body, b"{}".to_vec());
        let app = client.coordinator().scope_state(&Scope::Application).unwrap();
        assert_eq!(app.windows.len(), 2);
        assert_eq!(app.status, ScopeStatus::Available);
        let method = client
            .coordinator()
            .scope_state(&Scope::endpoint("summoner:by-name"))
            .unwrap();
        assert_eq!(method.windows[0].max_requests, 50);
    }

    #[tokio::test]
    async fn test_rate_limited_response_is_retried() {
        let limited = RawResponse::new(429)
            .with_header("Retry-After", "0")
            .with_header("X-Rate-Limit-Type", "method");
        let transport = ScriptedTransport::with(vec![Ok(limited), Ok(ok_with_limits())]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();

        let result = client.handler(Service::Match).get("by-id", "/match/1").await;

        assert!(result.is_ok());
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_until_exhausted() {
        let limited = || Ok(RawResponse::new(429).with_header("Retry-After", "0"));
        let transport = ScriptedTransport::with(vec![limited(), limited(), limited()]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();

        let result = client.handler(Service::Match).get("by-id", "/match/1").await;

        assert!(matches!(
            result,
            Err(RiftgateError::RetriesExhausted { attempts: 3, status: 429, .. })
        ));
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_server_error_retried_with_backoff() {
        let transport = ScriptedTransport::with(vec![
            Ok(RawResponse::new(503)),
            Ok(RawResponse::new(500)),
            Ok(RawResponse::new(200).with_body("ok")),
        ]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();

        let body = client.handler(Service::Status).get("shard", "/status").await.unwrap();

        assert_eq!(body, b"ok".to_vec());
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_not_found_and_other_statuses() {
        let transport = ScriptedTransport::with(vec![
            Ok(RawResponse::new(404)),
            Ok(RawResponse::new(403)),
        ]);
        let client = ApiClient::new(&config(), transport).unwrap();
        let handler = client.handler(Service::Leagues);

        assert!(matches!(
            handler.get("by-id", "/leagues/1").await,
            Err(RiftgateError::NotFound(_))
        ));
        assert!(matches!(
            handler.get("by-id", "/leagues/1").await,
            Err(RiftgateError::Status { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_not_reported() {
        let transport =
            ScriptedTransport::with(vec![Err(TransportError("connection reset".to_string()))]);
        let client = ApiClient::new(&config(), transport).unwrap();

        let result = client.handler(Service::Spectator).get("active", "/spectator/1").await;

        assert!(matches!(result, Err(RiftgateError::Transport(_))));
        let app = client.coordinator().scope_state(&Scope::Application).unwrap();
        assert_eq!(app.status, ScopeStatus::Unconstrained);
    }

    #[tokio::test]
    async fn test_key_rotation_reaches_existing_handlers() {
        let transport = ScriptedTransport::with(vec![]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();
        let handler = client.handler(Service::Champion);

        handler.get("rotations", "/champion").await.unwrap();
        client.set_api_key("RGAPI-second").unwrap();
        handler.get("rotations", "/champion").await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].header(API_KEY_HEADER), Some("RGAPI-first"));
        assert_eq!(sent[1].header(API_KEY_HEADER), Some("RGAPI-second"));
    }

    #[tokio::test]
    async fn test_handlers_share_one_budget() {
        let limited = RawResponse::new(200)
            .with_header("X-App-Rate-Limit", "1:60")
            .with_header("X-App-Rate-Limit-Count", "1:60");
        let transport = ScriptedTransport::with(vec![Ok(limited)]);
        let mut config = config();
        config.handlers.admission_timeout_secs = Some(0);
        let client = ApiClient::new(&config, transport).unwrap();

        client.handler(Service::Summoner).get("by-name", "/a").await.unwrap();
        let result = client.handler(Service::Match).get("by-id", "/b").await;

        assert!(matches!(result, Err(RiftgateError::AdmissionTimeout { .. })));
    }

    #[test]
    fn test_set_limiting_share_validates() {
        let client = ApiClient::new(&config(), ScriptedTransport::with(vec![])).unwrap();
        assert!(client.set_limiting_share(0.5).is_ok());
        assert!(client.set_limiting_share(-1.0).is_err());
        assert_eq!(client.coordinator().limiting_share().get(), 0.5);
    }

    #[tokio::test]
    async fn test_wait_for_cooldown_before_retry() {
        let limited = RawResponse::new(429)
            .with_header("Retry-After", "1")
            .with_header("X-Rate-Limit-Type", "application");
        let transport = ScriptedTransport::with(vec![Ok(limited)]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();

        let started = std::time::Instant::now();
        client.handler(Service::Match).get("by-id", "/match/1").await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_without_retry_after_waits_narrowest_window() {
        let limited = RawResponse::new(429)
            .with_header("X-Method-Rate-Limit", "100:2,1000:600")
            .with_header("X-Rate-Limit-Type", "method");
        let transport = ScriptedTransport::with(vec![Ok(limited)]);
        let client = ApiClient::new(&config(), transport.clone()).unwrap();

        let started = std::time::Instant::now();
        client.handler(Service::Match).get("by-id", "/match/1").await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1900));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(transport.sent().len(), 2);
    }
}
