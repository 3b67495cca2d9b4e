//! Pool Fleet Operator
//!
//! Runs the PoolCluster reconciler, the PoolInstance deletion controller and
//! the validation webhook, either against a Kubernetes cluster or, with
//! `--standalone`, against an in-memory fleet loaded from a YAML file.

use anyhow::Context as _;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pool_fleet_operator::controlplane::api::run_webhook_server;
use pool_fleet_operator::controlplane::{
    run_kube, run_standalone, CommandPoolEngine, DetachedPoolEngine,
};
use pool_fleet_operator::topology::ManagerTemplate;
use pool_fleet_operator::{
    Context, FleetSnapshot, InstanceController, KubeStore, MemoryStore, Metrics, PoolEngine,
    Reconciler, ReconcilerConfig, RetryPolicy, Stores, ValidationGate, WebhookServerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pool Fleet Operator - keeps per-node storage pools in line with PoolClusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace holding PoolClusters, instances and block devices
    #[arg(long, env = "NAMESPACE", default_value = "openebs")]
    namespace: String,

    /// Periodic resync of every PoolCluster, in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "30")]
    resync_interval_secs: u64,

    /// Reconcile workers in standalone mode
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Host name of this process; only instances on this host are destroyed.
    /// Unset handles every instance.
    #[arg(long, env = "OPERATOR_INSTANCE")]
    instance_identity: Option<String>,

    /// Volume-manager binary used to destroy pools. Unset skips the
    /// physical destroy.
    #[arg(long, env = "POOL_BINARY")]
    pool_binary: Option<PathBuf>,

    /// Image of the per-instance runtime manager
    #[arg(long, env = "POOL_MANAGER_IMAGE", default_value = "billyronks/pool-manager:latest")]
    manager_image: String,

    /// Validation webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    webhook_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Fleet snapshot seeding the in-memory store in standalone mode
    #[arg(long, env = "FLEET_FILE", requires = "standalone")]
    fleet_file: Option<PathBuf>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Pool Fleet Operator");
    info!("  Version: {}", pool_fleet_operator::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Webhook: {}", args.webhook_addr);
    info!("  Standalone mode: {}", args.standalone);

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .context("invalid health server address")?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("invalid metrics server address")?;
    let webhook = WebhookServerConfig {
        addr: args
            .webhook_addr
            .parse()
            .context("invalid webhook address")?,
    };

    let token = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));
    let metrics = Metrics::new()?;

    tokio::spawn({
        let token = token.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            token.cancel();
        }
    });

    tokio::spawn({
        let ready = ready.clone();
        let token = token.clone();
        async move {
            if let Err(e) = run_health_server(health_addr, ready, token).await {
                error!("Health server error: {}", e);
            }
        }
    });

    tokio::spawn({
        let metrics = metrics.clone();
        let token = token.clone();
        async move {
            if let Err(e) = run_metrics_server(metrics_addr, metrics, token).await {
                error!("Metrics server error: {}", e);
            }
        }
    });

    let (stores, client) = if args.standalone {
        let store = match &args.fleet_file {
            Some(path) => FleetSnapshot::load(path)?.into_store(&args.namespace),
            None => {
                warn!("No fleet file given, starting with an empty fleet");
                MemoryStore::new()
            }
        };
        (Stores::from_shared(store), None)
    } else {
        let client = kube::Client::try_default()
            .await
            .context("cannot build Kubernetes client")?;
        let store = KubeStore::new(client.clone(), pool_fleet_operator::NAME);
        (Stores::from_shared(store), Some(client))
    };

    let config = ReconcilerConfig {
        resync_interval: Duration::from_secs(args.resync_interval_secs.max(1)),
        retry: RetryPolicy::default(),
        manager: ManagerTemplate {
            image: args.manager_image.clone(),
        },
        ..Default::default()
    };
    let engine: Arc<dyn PoolEngine> = match &args.pool_binary {
        Some(binary) => Arc::new(CommandPoolEngine::new(binary)),
        None => {
            warn!("No pool binary configured, instances are released without destroying pools");
            Arc::new(DetachedPoolEngine)
        }
    };
    let instances = InstanceController::new(
        stores.instances.clone(),
        stores.events.clone(),
        engine,
        args.instance_identity.clone(),
    );
    let gate = Arc::new(ValidationGate::new(stores.clone(), config.retry));
    let reconciler = Reconciler::new(stores, config);
    let ctx = Context::new(reconciler, instances, metrics.clone());

    let webhook_handle = tokio::spawn(run_webhook_server(
        webhook,
        gate,
        metrics,
        token.clone(),
    ));

    ready.store(true, Ordering::SeqCst);

    match client {
        Some(client) => run_kube(client, &args.namespace, ctx, token.clone()).await,
        None => run_standalone(ctx, &args.namespace, args.workers, token.clone()).await?,
    }

    // Controllers only stop on cancellation; make sure the servers follow
    token.cancel();
    match webhook_handle.await {
        Ok(Err(e)) => error!("Webhook server error: {}", e),
        Err(e) => error!("Webhook server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr).context("cannot bind health server")?;
    info!("Health server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("health server failed")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    token: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr).context("cannot bind metrics server")?;
    info!("Metrics server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("metrics server failed")?;

    Ok(())
}
