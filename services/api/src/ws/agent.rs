//! Opens the agent leg for a negotiated endpoint.

use super::leg::Leg;
use async_trait::async_trait;
use callbridge_core::{AgentEndpoint, LegKind, RelayError};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue},
};
use tracing::info;

/// Establishes the WebSocket connection to the voice-AI provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Completes the agent-leg handshake. Any failure is reported as
    /// [`RelayError::LegHandshakeFailed`].
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Leg, RelayError>;
}

/// Connects with tokio-tungstenite, adding a bearer token when the endpoint
/// carries a credential.
#[derive(Clone, Debug, Default)]
pub struct TungsteniteConnector;

fn handshake_error(err: impl std::fmt::Display) -> RelayError {
    RelayError::LegHandshakeFailed {
        leg: LegKind::Agent,
        reason: err.to_string(),
    }
}

#[async_trait]
impl AgentConnector for TungsteniteConnector {
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Leg, RelayError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(handshake_error)?;
        if let Some(credential) = &endpoint.credential {
            let value: HeaderValue = format!("Bearer {}", credential)
                .parse()
                .map_err(handshake_error)?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, response) = connect_async(request).await.map_err(handshake_error)?;
        info!(status = %response.status(), "Connected to agent WebSocket.");
        Ok(Leg::from_tungstenite(LegKind::Agent, ws_stream))
    }
}
