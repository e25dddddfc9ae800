//! Control-plane negotiation of the agent leg.
//!
//! Before any audio flows, each session asks the voice-AI provider for a
//! WebSocket target. The exchange is a single HTTP round trip and carries no
//! state between calls.

use crate::{
    audio::AudioFormat,
    error::RelayError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_VAPI_BASE_URL: &str = "https://api.vapi.ai";
const VAPI_TRANSPORT_PROVIDER: &str = "vapi.websocket";

/// What the session knows about the call when it asks for an agent.
#[derive(Clone, Debug)]
pub struct CallMetadata {
    pub session_id: Uuid,
    pub assistant_id: String,
    /// The format the agent leg should speak.
    pub audio_format: AudioFormat,
}

/// Where and how to open the agent leg.
#[derive(Clone)]
pub struct AgentEndpoint {
    pub url: String,
    /// Sent as a bearer token on the agent-leg handshake when present.
    pub credential: Option<String>,
    pub audio_format: AudioFormat,
}

impl std::fmt::Debug for AgentEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEndpoint")
            .field("url", &self.url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("audio_format", &self.audio_format)
            .finish()
    }
}

/// Obtains an agent-leg target for one call.
#[async_trait]
pub trait AgentNegotiator: Send + Sync {
    /// Performs one request/response exchange with the provider.
    ///
    /// Never returns an endpoint with an empty URL; that case is reported as
    /// [`RelayError::NegotiationFailed`].
    async fn negotiate(&self, call: &CallMetadata) -> Result<AgentEndpoint, RelayError>;
}

// --- Vapi wire types ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateCallRequest<'a> {
    assistant: AssistantRef<'a>,
    transport: TransportRequest,
}

#[derive(Serialize, Debug)]
struct AssistantRef<'a> {
    id: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TransportRequest {
    provider: &'static str,
    audio_format: TransportAudioFormat,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TransportAudioFormat {
    format: String,
    container: &'static str,
    sample_rate: u32,
}

#[derive(Deserialize, Debug)]
struct CreateCallResponse {
    transport: Option<TransportResponse>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TransportResponse {
    websocket_call_url: Option<String>,
}

/// Negotiates agent legs with Vapi's `POST /call` resource.
pub struct VapiNegotiator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl VapiNegotiator {
    /// Creates a negotiator for the Vapi control API.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The API root, e.g. [`DEFAULT_VAPI_BASE_URL`].
    /// * `api_key` - Bearer credential for both the control call and the agent leg.
    /// * `timeout` - Upper bound on the whole HTTP exchange.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::NegotiationUnreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn request_body<'a>(call: &'a CallMetadata) -> CreateCallRequest<'a> {
        CreateCallRequest {
            assistant: AssistantRef {
                id: &call.assistant_id,
            },
            transport: TransportRequest {
                provider: VAPI_TRANSPORT_PROVIDER,
                audio_format: TransportAudioFormat {
                    format: call.audio_format.wire_name(),
                    container: "raw",
                    sample_rate: call.audio_format.sample_rate,
                },
            },
        }
    }
}

#[async_trait]
impl AgentNegotiator for VapiNegotiator {
    async fn negotiate(&self, call: &CallMetadata) -> Result<AgentEndpoint, RelayError> {
        let url = format!("{}/call", self.base_url);
        debug!(session_id = %call.session_id, %url, "Requesting agent endpoint");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(call))
            .send()
            .await
            .map_err(|e| RelayError::NegotiationUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(session_id = %call.session_id, %status, %body, "Vapi rejected call creation");
            return Err(RelayError::NegotiationFailed(format!(
                "control endpoint returned {}",
                status
            )));
        }

        let parsed: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| RelayError::NegotiationFailed(format!("malformed response: {}", e)))?;

        let ws_url = parsed
            .transport
            .and_then(|t| t.websocket_call_url)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                RelayError::NegotiationFailed("response carried no websocketCallUrl".to_string())
            })?;

        Ok(AgentEndpoint {
            url: ws_url,
            credential: Some(self.api_key.clone()),
            audio_format: call.audio_format,
        })
    }
}
