//! Main Entrypoint for the Callbridge Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the agent negotiator and connector.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and draining live sessions on shutdown.

use anyhow::Context;
use callbridge_api::{
    config::Config,
    registry::SessionRegistry,
    router::create_router,
    state::AppState,
    ws::{
        agent::TungsteniteConnector,
        session::{RelaySettings, SessionContext},
    },
};
use callbridge_core::VapiNegotiator;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal, then drains the session registry.
async fn shutdown_signal(registry: Arc<SessionRegistry>, grace: Duration) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Closing live sessions...");
    let report = registry.shutdown(grace).await;
    info!(
        drained = report.drained,
        forced = report.forced,
        "All sessions released. Shutting down server..."
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing relay state...");

    // --- 3. Initialize Shared Services ---
    let negotiator = VapiNegotiator::new(
        config.vapi_base_url.clone(),
        config.vapi_api_key.clone(),
        config.negotiation_timeout,
    )
    .context("Failed to build the Vapi client")?;

    let registry = Arc::new(SessionRegistry::new(config.max_sessions));
    let app_state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        session_context: SessionContext {
            negotiator: Arc::new(negotiator),
            connector: Arc::new(TungsteniteConnector),
            settings: Arc::new(RelaySettings::from_config(&config)),
        },
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        call_format = %config.call_format.wire_name(),
        agent_format = %config.agent_format.wire_name(),
        framing = ?config.call_framing,
        max_sessions = config.max_sessions,
        bind_address = %config.bind_address,
        "Relay configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry, config.shutdown_grace))
    .await?;

    info!("Server has shut down.");
    Ok(())
}
