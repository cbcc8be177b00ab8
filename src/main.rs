//! Taskoo web - serves the taskoo core module over HTTP

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskoo_web::{
    api::{self, AppState},
    bridge::Bridge,
    config::Config,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskoo_web=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting taskoo web host...");

    // Load configuration
    let config_path = Config::default_path();
    let config = Config::load_with_env(&config_path)?;
    tracing::info!("Configuration loaded from {}", config_path.display());

    // Load the guest module; the host is useless without it
    let bridge = Bridge::initialize(&config.guest).map_err(|e| {
        tracing::error!("Failed to initialize guest module: {}", e);
        e
    })?;
    tracing::info!(
        "Guest module loaded: {} (config dir {})",
        config.guest.module_path.display(),
        config.guest.resolved_app_config_dir().display()
    );

    // Build router
    let state = AppState::new(bridge);
    let app = api::build_router(state, &config.server.cors_origin)?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
