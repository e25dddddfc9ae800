//! Axum Handlers for the HTTP API
//!
//! Read-only operational endpoints served next to the WebSocket listener.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    models::{ErrorResponse, HealthResponse},
    registry::SessionInfo,
    state::AppState,
};

pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

/// Liveness plus the current session count.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.registry.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        active_sessions: state.registry.len(),
        max_sessions: state.registry.max_sessions(),
    })
}

/// List all live relay sessions, oldest first.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.snapshot())
}

/// Get one live relay session by its ID.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, ApiError> {
    state
        .registry
        .info(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CallFraming, Config},
        registry::SessionRegistry,
        ws::{
            agent::MockAgentConnector,
            session::{RelaySettings, SessionContext, SessionState},
        },
    };
    use async_trait::async_trait;
    use callbridge_core::{AgentEndpoint, AgentNegotiator, AudioFormat, CallMetadata, RelayError};
    use std::time::Duration;
    use tracing::Level;

    struct UnusedNegotiator;

    #[async_trait]
    impl AgentNegotiator for UnusedNegotiator {
        async fn negotiate(&self, _call: &CallMetadata) -> Result<AgentEndpoint, RelayError> {
            Err(RelayError::NegotiationFailed("unused".to_string()))
        }
    }

    fn app_state() -> Arc<AppState> {
        let config = Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            vapi_api_key: "key".to_string(),
            vapi_assistant_id: "asst".to_string(),
            vapi_base_url: "http://127.0.0.1:1".to_string(),
            call_format: AudioFormat::TELEPHONY,
            agent_format: AudioFormat::AGENT_DEFAULT,
            call_framing: CallFraming::Binary,
            convert_call_audio: false,
            negotiation_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            close_grace: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            max_sessions: 3,
            log_level: Level::INFO,
        };
        let session_context = SessionContext {
            negotiator: Arc::new(UnusedNegotiator),
            connector: Arc::new(MockAgentConnector::new()),
            settings: Arc::new(RelaySettings::from_config(&config)),
        };
        Arc::new(AppState {
            registry: Arc::new(SessionRegistry::new(config.max_sessions)),
            config: Arc::new(config),
            session_context,
        })
    }

    #[tokio::test]
    async fn test_health_reports_session_count() {
        let state = app_state();
        let _ticket = state.registry.open(None).unwrap();

        let Json(body) = health(State(state.clone())).await;
        assert_eq!(
            body,
            HealthResponse {
                status: "ok",
                active_sessions: 1,
                max_sessions: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_get_session_found_and_missing() {
        let state = app_state();
        let ticket = state.registry.open(None).unwrap();
        ticket.state.send_replace(SessionState::NegotiatingAgent);

        let Json(info) = get_session(State(state.clone()), Path(ticket.id))
            .await
            .ok()
            .unwrap();
        assert_eq!(info.state, SessionState::NegotiatingAgent);

        let missing = get_session(State(state.clone()), Path(Uuid::new_v4())).await;
        let response = missing.err().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let Json(all) = list_sessions(State(state)).await;
        assert_eq!(all.len(), 1);
    }
}
