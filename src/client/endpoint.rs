//! Endpoint handlers gated by the shared coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::retry::BackoffPolicy;
use super::transport::{OutboundRequest, Transport};
use crate::config::HandlerConfig;
use crate::credentials::{CredentialStore, API_KEY_HEADER};
use crate::error::{Result, RiftgateError};
use crate::ratelimit::wait::acquire_async;
use crate::ratelimit::{AdmissionControl, ObservedLimits};

/// The API surface areas served by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Champion,
    StaticData,
    Summoner,
    ChampionMastery,
    RunePage,
    MasteryPage,
    Match,
    Spectator,
    Status,
    Leagues,
}

impl Service {
    /// Every service, in a stable order.
    pub const ALL: [Service; 10] = [
        Service::Champion,
        Service::StaticData,
        Service::Summoner,
        Service::ChampionMastery,
        Service::RunePage,
        Service::MasteryPage,
        Service::Match,
        Service::Spectator,
        Service::Status,
        Service::Leagues,
    ];

    /// Short name used as the prefix of endpoint scopes.
    pub fn name(&self) -> &'static str {
        match self {
            Service::Champion => "champion",
            Service::StaticData => "static-data",
            Service::Summoner => "summoner",
            Service::ChampionMastery => "champion-mastery",
            Service::RunePage => "rune-page",
            Service::MasteryPage => "mastery-page",
            Service::Match => "match",
            Service::Spectator => "spectator",
            Service::Status => "status",
            Service::Leagues => "leagues",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sends requests for one service, asking the coordinator before each one
/// and reporting every response back to it.
#[derive(Clone)]
pub struct EndpointHandler {
    service: Service,
    control: Arc<dyn AdmissionControl>,
    credentials: CredentialStore,
    transport: Arc<dyn Transport>,
    rate_limited: BackoffPolicy,
    server_error: BackoffPolicy,
    admission_timeout: Option<Duration>,
}

impl EndpointHandler {
    /// Create a handler.
    pub fn new(
        service: Service,
        control: Arc<dyn AdmissionControl>,
        credentials: CredentialStore,
        transport: Arc<dyn Transport>,
        config: &HandlerConfig,
    ) -> Self {
        Self {
            service,
            control,
            credentials,
            transport,
            rate_limited: BackoffPolicy::from(&config.rate_limited),
            server_error: BackoffPolicy::from(&config.server_error),
            admission_timeout: config.admission_timeout(),
        }
    }

    /// The service this handler serves.
    pub fn service(&self) -> Service {
        self.service
    }

    /// The endpoint scope name for one of this service's methods.
    pub fn scope_name(&self, method: &str) -> String {
        format!("{}:{}", self.service.name(), method)
    }

    /// GET `path`, rate limited under the `method` endpoint scope.
    ///
    /// Transport failures are returned as-is and never reported to the
    /// coordinator. 429 responses are retried once the coordinator's
    /// cooldown clears, with no extra delay; 500 and 503 are retried with
    /// backoff.
    #[instrument(skip(self), fields(service = %self.service))]
    pub async fn get(&self, method: &str, path: &str) -> Result<Vec<u8>> {
        let endpoint = self.scope_name(method);
        let mut rate_limited_attempts = 0;
        let mut server_error_attempts = 0;

        loop {
            acquire_async(self.control.as_ref(), &endpoint, self.admission_timeout).await?;

            let request = OutboundRequest {
                path: path.to_string(),
                headers: vec![(
                    API_KEY_HEADER.to_string(),
                    self.credentials.current().to_string(),
                )],
            };

            let response = self.transport.send(&request).await.map_err(|e| {
                warn!(endpoint = %endpoint, error = %e, "Transport failure");
                RiftgateError::Transport(e.to_string())
            })?;

            let observed = ObservedLimits::from_headers(response.header_pairs());
            let limit_violated = response.status == 429;
            self.control
                .report_response(&endpoint, &observed, limit_violated, observed.retry_after);

            match response.status {
                200..=299 => {
                    debug!(endpoint = %endpoint, status = response.status, "Request succeeded");
                    return Ok(response.body);
                }
                429 => {
                    rate_limited_attempts += 1;
                    if rate_limited_attempts >= self.rate_limited.max_attempts() {
                        return Err(RiftgateError::RetriesExhausted {
                            path: path.to_string(),
                            attempts: rate_limited_attempts,
                            status: response.status,
                        });
                    }
                    // The coordinator's cooldown gates the next admission.
                    debug!(
                        endpoint = %endpoint,
                        attempt = rate_limited_attempts,
                        "Rate limited, retrying after cooldown"
                    );
                }
                500 | 503 => {
                    server_error_attempts += 1;
                    match self.server_error.delay_for(server_error_attempts) {
                        Some(delay) => {
                            debug!(
                                endpoint = %endpoint,
                                status = response.status,
                                delay = ?delay,
                                "Retrying after server error"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(RiftgateError::RetriesExhausted {
                                path: path.to_string(),
                                attempts: server_error_attempts,
                                status: response.status,
                            })
                        }
                    }
                }
                404 => return Err(RiftgateError::NotFound(path.to_string())),
                status => {
                    return Err(RiftgateError::Status {
                        status,
                        path: path.to_string(),
                    })
                }
            }
        }
    }
}

impl std::fmt::Debug for EndpointHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandler")
            .field("service", &self.service)
            .field("admission_timeout", &self.admission_timeout)
            .finish()
    }
}
