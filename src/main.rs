//! Main entry point for DALL-E Studio

use dalle_studio::{
    api,
    config::{LogFormat, Settings},
    AppState,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Settings decide the log format, so report problems while loading them
    // through a plain default subscriber. A path on the command line wins
    // over the env var.
    let settings = tracing::subscriber::with_default(fmt::Subscriber::builder().finish(), || {
        match std::env::args().nth(1) {
            Some(path) => Settings::load_from_path(path),
            None => Settings::load(),
        }
    })?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match settings.logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }

    info!("Starting DALL-E Studio");
    info!(
        save_dir = %settings.save_dir.display(),
        rpm = settings.connection.rpm,
        "Loaded configuration: server={}:{}",
        settings.server.host,
        settings.server.port
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app_state = Arc::new(AppState::new(settings));

    // Connect right away if the settings file already has credentials
    if let Some(client_config) = app_state.settings.client_config() {
        let rpm = app_state.settings.connection.rpm;
        match app_state.connect(client_config, rpm) {
            Ok(session) => info!(session_id = %session.id(), rpm, "Client created"),
            Err(e) => warn!(error = %e, "Stored connection settings are unusable"),
        }
    }

    // Build the router
    let app = api::create_router(app_state.clone());

    info!("Server listening on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if app_state.close_session() {
        info!("Client closed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
