//! WebSocket Relay
//!
//! This module contains the real-time side of the relay, split into:
//!
//! - `leg`: a transport-neutral wrapper over one WebSocket connection.
//! - `protocol`: close codes and the JSON shapes seen on each leg.
//! - `agent`: opening the outbound agent leg.
//! - `session`: the per-call state machine that bridges the two legs.

pub mod agent;
pub mod leg;
pub mod protocol;
pub mod session;

use crate::{registry::SessionRegistry, state::AppState};
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use callbridge_core::LegKind;
use leg::{CloseReason, Leg};
use protocol::CLOSE_TRY_AGAIN_LATER;
use session::{RelaySession, SessionContext, SessionId};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

/// Axum handler that accepts a call leg on `/` or `/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: Arc<AppState>) {
    info!(%peer, "Telephony WebSocket connected");
    let call = Leg::from_axum(LegKind::Call, socket);
    on_connect(&state.registry, call, Some(peer), state.session_context.clone()).await;
}

/// Registers a new call leg and starts its session.
///
/// When the registry refuses the session the call leg is closed with
/// `1013 Try Again Later` and no session is created.
pub async fn on_connect(
    registry: &Arc<SessionRegistry>,
    mut call: Leg,
    peer: Option<SocketAddr>,
    ctx: SessionContext,
) -> Option<SessionId> {
    let Some(ticket) = registry.open(peer) else {
        let reason = if registry.is_shutting_down() {
            "server shutting down"
        } else {
            "relay at capacity"
        };
        call.close(CloseReason::new(CLOSE_TRY_AGAIN_LATER, reason)).await;
        return None;
    };

    let id = ticket.id;
    registry.spawn(RelaySession::new(ticket, call, ctx));
    Some(id)
}
