use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use riftgate::client::{ApiClient, OutboundRequest, RawResponse, Transport, TransportError};
use riftgate::config::ClientConfig;
use riftgate::ratelimit::headers::parse_limits;
use riftgate::ratelimit::{LimitSpec, UsageWindow};

/// Drive a burst of requests through the shared coordinator against an
/// in-process API that enforces the given limits.
#[derive(Debug, Parser)]
#[command(name = "riftgate", version, about)]
struct Args {
    /// YAML configuration file (RIFTGATE__* variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured limiting share
    #[arg(long)]
    share: Option<f64>,

    /// Total requests to send
    #[arg(long, default_value_t = 60)]
    requests: usize,

    /// Requests in flight at once
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Application limits the simulated API enforces
    #[arg(long, default_value = "20:1,100:120")]
    app_limit: String,

    /// Per-endpoint limits the simulated API enforces
    #[arg(long, default_value = "10:1")]
    method_limit: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Riftgate simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(share) = args.share {
        config.limiting_share = share;
    }
    if config.api_key.is_none() {
        config.api_key = Some("RGAPI-simulated".to_string());
    }
    config.validate()?;
    info!(limiting_share = config.limiting_share, "Configuration loaded");

    let app_limits = parse_limits("--app-limit", &args.app_limit)
        .with_context(|| format!("invalid --app-limit {:?}", args.app_limit))?;
    let method_limits = parse_limits("--method-limit", &args.method_limit)
        .with_context(|| format!("invalid --method-limit {:?}", args.method_limit))?;

    let api = Arc::new(SimulatedApi::new(app_limits, method_limits));
    let client = ApiClient::new(&config, api.clone())?;

    tokio::select! {
        summary = run(&client, args.requests, args.concurrency.max(1)) => {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                rejected_by_server = api.rejected(),
                elapsed = ?summary.elapsed,
                "Simulation finished"
            );
        }
        _ = shutdown_signal() => {}
    }

    println!("{}", serde_json::to_string_pretty(&client.coordinator().snapshot())?);
    Ok(())
}

struct Summary {
    succeeded: usize,
    failed: usize,
    elapsed: Duration,
}

async fn run(client: &ApiClient, requests: usize, concurrency: usize) -> Summary {
    let handlers = client.handlers();
    let started = Instant::now();

    let results: Vec<bool> = stream::iter(0..requests)
        .map(|i| {
            let handler = handlers[i % handlers.len()].clone();
            async move {
                let path = format!("/{}/{}", handler.service(), i);
                match handler.get("get", &path).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(path = %path, error = %e, "Request failed");
                        false
                    }
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let succeeded = results.iter().filter(|ok| **ok).count();
    Summary {
        succeeded,
        failed: results.len() - succeeded,
        elapsed: started.elapsed(),
    }
}

/// An upstream API that counts requests in fixed windows and answers with
/// rate limit headers, or 429 once a limit is hit.
struct SimulatedApi {
    app_limits: Vec<LimitSpec>,
    method_limits: Vec<LimitSpec>,
    state: Mutex<SimulatedState>,
}

#[derive(Default)]
struct SimulatedState {
    application: Vec<UsageWindow>,
    methods: HashMap<String, Vec<UsageWindow>>,
    rejected: u64,
}

impl SimulatedApi {
    fn new(app_limits: Vec<LimitSpec>, method_limits: Vec<LimitSpec>) -> Self {
        let state = SimulatedState {
            application: app_limits.iter().copied().map(UsageWindow::new).collect(),
            ..Default::default()
        };
        Self {
            app_limits,
            method_limits,
            state: Mutex::new(state),
        }
    }

    fn rejected(&self) -> u64 {
        self.state.lock().rejected
    }
}

fn saturated(windows: &mut [UsageWindow], now: Instant) -> Duration {
    windows
        .iter_mut()
        .map(|w| {
            let max = w.spec().max_requests;
            w.wait(max, now)
        })
        .max()
        .unwrap_or(Duration::ZERO)
}

fn format_counts(windows: &mut [UsageWindow], now: Instant) -> String {
    windows
        .iter_mut()
        .map(|w| format!("{}:{}", w.count(now), w.length().as_secs()))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_limits(limits: &[LimitSpec]) -> String {
    limits.iter().map(LimitSpec::to_string).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl Transport for SimulatedApi {
    async fn send(&self, request: &OutboundRequest) -> Result<RawResponse, TransportError> {
        let method = request
            .path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let now = Instant::now();
        let mut state = self.state.lock();
        let SimulatedState {
            application,
            methods,
            rejected,
        } = &mut *state;
        let method_windows = methods
            .entry(method)
            .or_insert_with(|| self.method_limits.iter().copied().map(UsageWindow::new).collect());

        let app_wait = saturated(application, now);
        let method_wait = saturated(method_windows, now);

        let mut response = if app_wait.is_zero() && method_wait.is_zero() {
            application.iter_mut().for_each(|w| w.record(now));
            method_windows.iter_mut().for_each(|w| w.record(now));
            RawResponse::new(200).with_body("{}")
        } else {
            *rejected += 1;
            let (kind, wait) = if app_wait >= method_wait {
                ("application", app_wait)
            } else {
                ("method", method_wait)
            };
            RawResponse::new(429)
                .with_header("Retry-After", wait.as_secs_f64().ceil().to_string())
                .with_header("X-Rate-Limit-Type", kind)
        };

        response = response
            .with_header("X-App-Rate-Limit", format_limits(&self.app_limits))
            .with_header("X-App-Rate-Limit-Count", format_counts(application, now))
            .with_header("X-Method-Rate-Limit", format_limits(&self.method_limits))
            .with_header("X-Method-Rate-Limit-Count", format_counts(method_windows, now));

        Ok(response)
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
