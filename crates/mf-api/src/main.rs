mod auth;
mod config;
mod dto;
mod error;
mod routes;
mod state;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Backends without credentials are skipped; none at all is fatal.
    let providers = match mf_infra::build_providers().await {
        Ok(providers) => providers,
        Err(e) => {
            tracing::error!(error = %e, "no cloud backend could be configured");
            std::process::exit(1);
        }
    };
    tracing::info!(providers = ?providers.available(), "cloud backends ready");

    let listen_addr = config.listen_addr;
    let app = api_router(AppState { providers, config }).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .expect("failed to bind listener");
    tracing::info!(addr = %listen_addr, "mcfleet control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

/// Resolves on Ctrl-C. In-flight lifecycle calls run to completion.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received, draining requests");
}
