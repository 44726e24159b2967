use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use dragnet_core::config::{QueueConfig, rate_limit_from_env, stall_after_from_env};
use dragnet_db::{Database, DatabaseConfig};
use dragnet_server::routes;
use dragnet_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dragnet=info".parse()?))
        .with_target(false)
        .init();

    let admin_token = std::env::var("DRAGNET_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty());
    if admin_token.is_none() {
        tracing::warn!("DRAGNET_ADMIN_TOKEN not set, /v1 endpoints are disabled");
    }
    let port = std::env::var("DRAGNET_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let queue = QueueConfig::from_env()?;
    let state = Arc::new(
        AppState::new(db, queue, rate_limit_from_env()?, admin_token)
            .with_stall_after(stall_after_from_env()?),
    );

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
