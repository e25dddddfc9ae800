//! Response bodies for the HTTP endpoints.

use serde::Serialize;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub max_sessions: usize,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
