//! LBaaS Control Plane
//!
//! Runs the REST API, the resync dispatcher, the drift detector and the
//! enforcement-agent sync loop against in-memory stores, with health and
//! Prometheus endpoints on separate ports.

use anyhow::Context;
use clap::Parser;
use prometheus::{IntGauge, IntGaugeVec};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lbaas_control_plane::reconcile::{
    renderer_from_settings, DispatcherStatsSnapshot, DriftStatsSnapshot, SyncStatsSnapshot,
};
use lbaas_control_plane::{
    ApiServer, ApiServerConfig, ControlPlaneConfig, DriftDetector, Error, LbaasService,
    LoadBalancerSyncer, MemoryInfrastructure, Repositories, ResyncDispatcher, Result,
    StatusAggregator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LBaaS Control Plane - desired-state store and HAProxy reconciliation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "LBAAS_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Owning service for load balancers created without one
    #[arg(long, env = "DEFAULT_OWNER")]
    default_owner: Option<String>,

    /// Resync worker count
    #[arg(long, env = "RESYNC_WORKERS")]
    workers: Option<usize>,

    /// Resync queue capacity
    #[arg(long, env = "RESYNC_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Config renderer endpoint (dry-run when unset)
    #[arg(long, env = "RENDERER_URL")]
    renderer_url: Option<String>,

    /// Allow cross-origin API requests
    #[arg(long, env = "API_CORS")]
    cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the configuration file, then apply command-line overrides
    fn load_config(&self) -> Result<ControlPlaneConfig> {
        let mut config = match &self.config {
            Some(path) => ControlPlaneConfig::from_file(path)?,
            None => ControlPlaneConfig::default(),
        };

        if let Some(addr) = &self.api_addr {
            config.api_addr = addr.clone();
        }
        if let Some(addr) = &self.health_addr {
            config.health_addr = addr.clone();
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = addr.clone();
        }
        if let Some(owner) = &self.default_owner {
            config.default_owner = owner.clone();
            if !config.services.contains(owner) {
                config.services.push(owner.clone());
            }
        }
        if let Some(workers) = self.workers {
            config.dispatcher.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.dispatcher.queue_capacity = capacity;
        }
        if let Some(url) = &self.renderer_url {
            config.sync.renderer_url = Some(url.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.load_config().context("loading configuration")?;

    info!("Starting LBaaS Control Plane");
    info!("  Version: {}", lbaas_control_plane::VERSION);
    info!("  REST API: {}", config.api_addr);
    info!("  Default owner: {}", config.default_owner);
    info!(
        "  Renderer: {}",
        config.sync.renderer_url.as_deref().unwrap_or("dry-run")
    );

    // Stores and infrastructure
    let repos = Repositories::in_memory();
    let infra = MemoryInfrastructure::new();
    spawn_event_logger(&repos);

    // Resync dispatcher
    let dispatcher = ResyncDispatcher::new(
        config.dispatcher.clone(),
        repos.clone(),
        StatusAggregator::new(repos.clone()),
    );
    let workers = dispatcher.start();

    // Background loops
    let drift = DriftDetector::new(config.drift.clone(), repos.clone(), infra.clone());
    tokio::spawn(drift.clone().run());

    let renderer = renderer_from_settings(&config.sync).context("building config renderer")?;
    let syncer = LoadBalancerSyncer::new(config.sync.clone(), repos.clone(), infra.clone(), renderer);
    tokio::spawn(syncer.clone().run());

    // Start health server
    let health_addr = config.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics = ControlPlaneMetrics::register().context("registering metrics")?;
    {
        let dispatcher = dispatcher.clone();
        let drift = drift.clone();
        let syncer = syncer.clone();
        let repos = repos.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let loadbalancers = repos
                    .loadbalancers
                    .count(&|_: &lbaas_control_plane::LoadBalancer| true)
                    .await
                    .unwrap_or_default();
                metrics.observe(
                    &dispatcher.stats(),
                    &drift.stats(),
                    &syncer.stats(),
                    loadbalancers,
                );
            }
        });
    }
    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: config
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        cors_enabled: args.cors,
    };
    let service = LbaasService::new(&config, repos.clone(), infra.clone(), dispatcher.clone());
    let api_server = Arc::new(ApiServer::new(api_config, service));

    let server = api_server.clone();
    let api_task = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = api_task => {
            match result {
                Ok(Ok(())) => info!("API server stopped"),
                Ok(Err(e)) => error!("API server error: {}", e),
                Err(e) => error!("API server task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            api_server.shutdown();
        }
    }

    dispatcher.shutdown();
    for worker in workers {
        let _ = worker.await;
    }

    let stats = dispatcher.stats();
    info!(
        "Control plane shutdown complete ({} tasks processed, {} dropped)",
        stats.processed, stats.dropped
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info", "reqwest=warn"] {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Log every store mutation at debug level
fn spawn_event_logger(repos: &Repositories) {
    let mut events = repos.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!("Store event: {} {} {}", event.kind(), event.id(), event.action()),
                Err(RecvError::Lagged(skipped)) => warn!("Store event logger lagged, {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics
// =============================================================================

/// Gauges mirroring the reconciliation statistics
struct ControlPlaneMetrics {
    loadbalancers: IntGauge,
    dispatcher_tasks: IntGaugeVec,
    drift_events: IntGaugeVec,
    sync_events: IntGaugeVec,
}

impl ControlPlaneMetrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            loadbalancers: prometheus::register_int_gauge!(
                "lbaas_loadbalancers_total",
                "Number of load balancers in the store"
            )?,
            dispatcher_tasks: prometheus::register_int_gauge_vec!(
                "lbaas_dispatcher_tasks",
                "Resync tasks by outcome",
                &["outcome"]
            )?,
            drift_events: prometheus::register_int_gauge_vec!(
                "lbaas_drift_events",
                "Drift detector corrections and skips",
                &["event"]
            )?,
            sync_events: prometheus::register_int_gauge_vec!(
                "lbaas_sync_events",
                "Enforcement sync outcomes",
                &["outcome"]
            )?,
        })
    }

    fn observe(
        &self,
        dispatcher: &DispatcherStatsSnapshot,
        drift: &DriftStatsSnapshot,
        sync: &SyncStatsSnapshot,
        loadbalancers: usize,
    ) {
        self.loadbalancers.set(loadbalancers as i64);

        for (outcome, value) in [
            ("enqueued", dispatcher.enqueued),
            ("deferred", dispatcher.deferred),
            ("dropped", dispatcher.dropped),
            ("processed", dispatcher.processed),
            ("failed", dispatcher.failed),
            ("loadbalancers_touched", dispatcher.loadbalancers_touched),
        ] {
            self.dispatcher_tasks.with_label_values(&[outcome]).set(value as i64);
        }
        for (event, value) in [
            ("cycles", drift.cycles),
            ("vips_corrected", drift.vips_corrected),
            ("statuses_updated", drift.statuses_updated),
            ("skipped", drift.skipped),
        ] {
            self.drift_events.with_label_values(&[event]).set(value as i64);
        }
        for (outcome, value) in [
            ("cycles", sync.cycles),
            ("rendered", sync.rendered),
            ("not_ready", sync.not_ready),
            ("failed", sync.failed),
        ] {
            self.sync_events.with_label_values(&[outcome]).set(value as i64);
        }
    }
}

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
