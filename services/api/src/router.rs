//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the relay: the call-leg
//! WebSocket endpoint and the read-only operational endpoints.

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
///
/// Telephony providers connect to either `/` or `/ws`. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so sessions know
/// their peer address.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .with_state(app_state)
}
