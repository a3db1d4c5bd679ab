use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod config;
mod crypto;
mod error;
mod fanout;
mod ledger;
mod providers;
mod routing;
mod schema;
mod store;
mod telemetry;

pub use config::Config;
pub use error::{AppError, GatewayError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_gateway=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("MGW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/model-gateway/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        providers = config.providers.len(),
        "model-gateway starting"
    );

    // BYOK master cipher — optional; without it only server keys are used.
    let cipher = match std::env::var(&config.gateway.byok_key_env) {
        Ok(value) => Some(
            crypto::KeyCipher::from_base64(&value)
                .with_context(|| format!("invalid {} master key", config.gateway.byok_key_env))?,
        ),
        Err(_) => {
            warn!(
                env = %config.gateway.byok_key_env,
                "BYOK master key not set — user-provided keys are disabled"
            );
            None
        }
    };

    let store = Arc::new(store::memory::MemoryStore::new());
    let cost = Arc::new(telemetry::CostTable::new(
        &config.pricing,
        config.routing.default_output_tokens,
    ));
    let latency = Arc::new(telemetry::LatencyTracker::new(config.routing.latency_window));
    let ledger = ledger::RequestLedger::start(store.clone(), config.gateway.ledger_capacity);

    let registered: Vec<_> = config.providers.iter().map(providers::build_provider).collect();
    for provider in &registered {
        info!(provider = provider.name(), keyed = provider.has_server_key(), "registered provider");
    }

    let router = routing::RouterBuilder::new(
        cost,
        latency,
        store.clone(),
        store.clone(),
        store.clone(),
        ledger,
    )
    .providers(registered)
    .cipher(cipher)
    .balanced_weights(
        config.routing.balanced_cost_weight,
        config.routing.balanced_latency_weight,
    )
    .stream_timeout(Duration::from_secs(config.routing.stream_timeout_secs))
    .build();

    // Seed the settings store with the configured default strategy.
    router
        .set_default_strategy(config.routing.default_strategy, "startup")
        .await
        .context("seeding default strategy")?;

    let config = Arc::new(config);
    let state = Arc::new(api::AppState::new(router, Arc::clone(&config), store));

    // Bind client API (caller-facing)
    let client_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.client_port).parse()?;

    // Bind admin API
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.admin_port).parse()?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    // Attach request tracing middleware to both servers
    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::admin_auth::admin_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `model-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("MGW_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
