pub mod error;
pub mod models;
pub mod modules;
pub mod utils;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use models::AppConfig;
use modules::api_server::{self, AppState};
use modules::rate_limit::{self, RateLimiter};
use modules::sessions::SessionRegistry;
use modules::whatsapp::{browser::BrowserClientFactory, ClientFactory};
use utils::truncate::mask_secret;

/// Run the gateway with browser-backed clients until SIGINT/SIGTERM.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let factory: Arc<dyn ClientFactory> = Arc::new(BrowserClientFactory::new(
        config.session_path.clone(),
        config.browser.clone(),
    ));
    run_with(config, factory).await
}

pub async fn run_with(config: AppConfig, factory: Arc<dyn ClientFactory>) -> anyhow::Result<()> {
    for warning in modules::config::startup_warnings(&config) {
        warn!("{}", warning);
    }

    let sessions = Arc::new(SessionRegistry::new(
        factory,
        config.max_sessions,
        config.session_path.clone(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(config.anti_ban.clone()));
    let window_reset = rate_limit::spawn_window_reset(rate_limiter.clone());

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;

    info!(
        "🚀 WhatsApp API server starting ({} environment, API key {})",
        config.environment,
        mask_secret(&config.api_key)
    );
    let state = AppState::new(config, sessions.clone(), rate_limiter);
    let served = api_server::serve(state, listener, shutdown_signal()).await;

    info!("Shutting down, closing all sessions");
    window_reset.abort();
    sessions.shutdown().await;

    served.context("API server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
