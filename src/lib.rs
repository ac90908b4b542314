pub mod audit;
pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod hotreload;
pub mod metrics;
pub mod observability;
pub mod proxy;
pub mod rate_limit;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{gateway_handler, GatewayState};
use crate::hotreload::RouteReloader;
use crate::metrics::{metrics_handler, MetricsService};
use crate::observability::request_id_middleware;
use axum::{
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub use crate::observability::{init_tracing, shutdown_telemetry};

/// Build the HTTP application
///
/// `/health` and `/metrics` are served directly; every other path goes
/// through the gateway pipeline.
pub fn build_app(state: GatewayState, metrics: Option<MetricsService>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .fallback(gateway_handler)
        .with_state(state);

    if let Some(metrics) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(metrics),
        );
    }

    app.layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());

    error!(panic = %detail, "Request handler panicked");
    GatewayError::Internal(detail).into_response()
}

/// Initialize the gateway server
///
/// `config_path` enables route hot reload when the config asks for it.
pub async fn init_gateway(config: GatewayConfig, config_path: Option<PathBuf>) -> Result<()> {
    config.validate()?;

    info!("Starting API Gateway");

    let metrics = match MetricsService::new() {
        Ok(service) => Some(service),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let state = GatewayState::from_config(&config).await?;

    if config.hot_reload.enabled {
        match (&state.static_source, config_path) {
            (Some(source), Some(path)) => RouteReloader::new(
                path,
                source.clone(),
                state.directory.clone(),
                config.hot_reload.debounce_ms,
            )
            .start()?,
            _ => warn!("Hot reload requested but routes do not come from a config file"),
        }
    }

    let app = build_app(state, metrics);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!(address = %addr, "Gateway ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
