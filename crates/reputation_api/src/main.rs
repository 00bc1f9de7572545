//! IP Deliverability Reputation API Server
//!
//! Ingests SMTP delivery-failure webhooks, maintains per-IP reputation
//! state through a background aggregation worker, probes DNS blocklists,
//! and drives the reserved-IP lifecycle against the upstream block API.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use reputation_core::aggregator::Aggregator;
use reputation_core::dnsbl::{BlocklistProber, DnsblProber};
use reputation_core::provisioner::Provisioner;
use reputation_core::store::{
    EventStore, InventoryStore, PgEventStore, PgInventoryStore, PgReputationStore, ReputationStore,
};
use reputation_core::upstream::BlockApiClient;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod api_handler;
mod config;
mod routes;
#[cfg(test)]
mod test_support;

use config::AppConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub reputation: Arc<dyn ReputationStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub prober: Arc<dyn BlocklistProber>,
    pub aggregator: Arc<Aggregator>,
    pub provisioner: Arc<Provisioner>,
    pub config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    init_tracing(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "starting IP reputation service"
    );

    // Database pool and migrations
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    info!("database connected and migrations applied");

    let events: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
    let reputation: Arc<dyn ReputationStore> = Arc::new(PgReputationStore::new(pool.clone()));
    let inventory: Arc<dyn InventoryStore> = Arc::new(PgInventoryStore::new(pool.clone()));

    let prober: Arc<dyn BlocklistProber> = Arc::new(DnsblProber::new(&config.dnsbl));

    let upstream = Arc::new(BlockApiClient::new(
        config.upstream.api_url.clone(),
        config.upstream.token.clone(),
    )?);
    let provisioner = Arc::new(Provisioner::new(
        upstream,
        Arc::clone(&prober),
        Arc::clone(&inventory),
        config.provisioner.clone(),
    ));

    // Background aggregation worker
    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&events),
        Arc::clone(&reputation),
        Arc::clone(&prober),
        config.reputation.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Arc::clone(&aggregator).spawn(
        Duration::from_secs(config.aggregation.interval_minutes * 60),
        shutdown_rx,
    );

    let state = AppState {
        events,
        reputation,
        inventory,
        prober,
        aggregator,
        provisioner,
        config: Arc::new(config.clone()),
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "server listening");
    info!("webhook endpoint: POST /webhook/delivery-failure");
    info!("health check:     GET /health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the aggregator after the last request has drained; it finishes
    // the IP in flight before exiting.
    let _ = shutdown_tx.send(true);
    let _ = worker.await;

    info!("server shut down gracefully");
    Ok(())
}

/// Assemble the router with tracing, CORS and compression layers.
fn create_router(state: AppState) -> Router {
    routes::build_routes(Arc::new(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                ])
                .allow_headers(tower_http::cors::Any),
        )
        .layer(CompressionLayer::new())
}

/// Initialize tracing and logging
fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_level.clone().into());

    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
