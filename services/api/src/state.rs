//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the configuration,
//! the session registry, and the collaborators every relay session needs.

use crate::{config::Config, registry::SessionRegistry, ws::session::SessionContext};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub session_context: SessionContext,
}
