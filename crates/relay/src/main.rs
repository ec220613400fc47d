mod auth;
mod calls;
mod cleanup;
mod config;
mod db;
mod error;
mod gateway;
mod merge;
mod mesh;
mod metrics;
mod presence;
mod protocol;
mod rooms;
mod signaling;
mod store;
mod timer;
mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::{bail, Context};
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::{Parser, Subcommand};
use huddle_common::types::CallStatus;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::{jwt::JwtAccessTokenService, IdentityBinder},
    cleanup::spawn_cleanup_scheduler,
    config::{LogFormat, RelayConfig},
    db::{
        pool::{check_pool_health, create_pg_pool, PoolConfig},
        run_migrations,
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    gateway::{spawn_core, CoreHandle},
    metrics::RelayMetrics,
    store::Stores,
};

#[derive(Parser)]
#[command(name = "huddle-relay", about = "Real-time coordination relay for chat, calls and whiteboards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (the default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::from_env();
    init_tracing(&config);
    for warning in &config.warnings {
        warn!("{warning}");
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(&config).await,
    }
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set HUDDLE_RELAY_JWT_SECRET outside local development");
    }
    let jwt_service =
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?;
    let stores = open_stores(&config).await?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let binder = Arc::new(IdentityBinder::new(jwt_service, stores.users.clone()));
    let (core, core_task) = spawn_core(config.core.clone(), stores);
    let cleanup_task = spawn_cleanup_scheduler(core.clone(), config.core.cleanup_interval);
    let app = build_router(binder, core.clone(), relay_metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    cleanup_task.abort();
    core.shutdown();
    if let Err(join_error) = core_task.await {
        error!(?join_error, "realtime core task failed");
    }
    info!("relay stopped");
    Ok(())
}

async fn migrate(config: &RelayConfig) -> anyhow::Result<()> {
    let Some(database_url) = config.database_url.as_deref() else {
        bail!("HUDDLE_RELAY_DATABASE_URL must be set to run migrations");
    };
    let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
    run_migrations(&pool).await?;
    info!("relay migrations applied");
    Ok(())
}

/// PostgreSQL when configured, otherwise in-memory stores. Call records left
/// ringing or ongoing by a previous process are purged: their sessions died
/// with it.
async fn open_stores(config: &RelayConfig) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("HUDDLE_RELAY_DATABASE_URL not set; state is kept in memory only");
        return Ok(Stores::in_memory());
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
    check_pool_health(&pool).await?;
    run_migrations(&pool).await?;

    let stores = Stores::postgres(pool);
    let purged = stores
        .calls
        .delete_many(&CallStatus::LIVE)
        .await
        .context("failed to purge stale call records")?;
    if purged > 0 {
        info!(purged, "purged call records left live by a previous run");
    }
    Ok(stores)
}

fn build_router(binder: Arc<IdentityBinder>, core: CoreHandle, relay_metrics: Arc<RelayMetrics>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .with_state(relay_metrics)
            .merge(ws::router(binder, core)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_text(State(relay_metrics): State<Arc<RelayMetrics>>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        relay_metrics.render_prometheus(),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
