//! The per-call relay state machine.
//!
//! A session owns the call leg from the moment it is accepted, negotiates and
//! opens the agent leg, relays frames in both directions, and tears both legs
//! down together. Every event from either leg, the pending negotiation, and
//! the shutdown token is consumed by one `select!` loop on one task, so
//! transitions never interleave.

use super::{
    agent::AgentConnector,
    leg::{CloseReason, Frame, Leg, LegEvent},
    protocol::{
        AgentControl, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, call_audio_frame,
    },
};
use crate::{
    config::{CallFraming, Config},
    registry::SessionTicket,
};
use bytes::Bytes;
use callbridge_core::{
    AgentNegotiator, AudioFormat, AudioFrame, CallMetadata, LegKind, RelayError,
};
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// Close code reported when a peer went away without a close frame.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    NegotiatingAgent,
    Bridging,
    Closing,
    Closed,
}

/// Per-listener settings shared by every session.
#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub assistant_id: String,
    pub call_format: AudioFormat,
    /// The format requested during negotiation.
    pub agent_format: AudioFormat,
    pub call_framing: CallFraming,
    pub convert_call_audio: bool,
    pub negotiation_timeout: Duration,
    pub handshake_timeout: Duration,
    pub close_grace: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            assistant_id: config.vapi_assistant_id.clone(),
            call_format: config.call_format,
            agent_format: config.agent_format,
            call_framing: config.call_framing,
            convert_call_audio: config.convert_call_audio,
            negotiation_timeout: config.negotiation_timeout,
            handshake_timeout: config.handshake_timeout,
            close_grace: config.close_grace,
        }
    }
}

/// The collaborators a session is constructed with.
#[derive(Clone)]
pub struct SessionContext {
    pub negotiator: Arc<dyn AgentNegotiator>,
    pub connector: Arc<dyn AgentConnector>,
    pub settings: Arc<RelaySettings>,
}

/// Why a session left its active states.
#[derive(Debug)]
pub enum CloseCause {
    /// The agent sent an explicit end-of-conversation control event.
    EndOfConversation,
    /// The process is shutting down.
    Shutdown,
    Error(RelayError),
}

impl CloseCause {
    /// The close request sent to `leg` during teardown.
    fn close_reason_for(&self, leg: LegKind) -> CloseReason {
        match self {
            CloseCause::EndOfConversation => CloseReason::new(CLOSE_NORMAL, "conversation ended"),
            CloseCause::Shutdown => CloseReason::new(CLOSE_GOING_AWAY, "server shutting down"),
            CloseCause::Error(err) if err.is_negotiation() => {
                CloseReason::new(CLOSE_INTERNAL_ERROR, "agent unavailable")
            }
            CloseCause::Error(err) => {
                let from_peer = err.leg().map(LegKind::peer) == Some(leg);
                match err {
                    RelayError::LegHandshakeFailed { .. } => {
                        CloseReason::new(CLOSE_INTERNAL_ERROR, "agent connection failed")
                    }
                    RelayError::LegClosed { .. } if from_peer => {
                        CloseReason::new(CLOSE_NORMAL, "peer leg closed")
                    }
                    RelayError::LegTransport { .. } if from_peer => {
                        CloseReason::new(CLOSE_INTERNAL_ERROR, "peer leg failed")
                    }
                    _ => CloseReason::new(CLOSE_INTERNAL_ERROR, "relay error"),
                }
            }
        }
    }
}

/// Per-session frame counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_to_agent: u64,
    pub frames_to_call: u64,
    pub frames_dropped: u64,
    pub conversion_failures: u64,
    pub control_events: u64,
}

/// The diagnostic record a finished session leaves behind.
#[derive(Debug)]
pub struct SessionSummary {
    pub id: SessionId,
    pub cause: CloseCause,
    pub stats: RelayStats,
    /// Whether the session ever reached `Bridging`.
    pub bridged: bool,
    /// False when the close grace period elapsed before both legs closed.
    pub graceful: bool,
}

pub struct RelaySession {
    id: SessionId,
    call: Leg,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    ctx: SessionContext,
    stats: RelayStats,
}

fn leg_closed(leg: LegKind, reason: Option<CloseReason>) -> RelayError {
    let reason = reason.unwrap_or_else(|| CloseReason::new(CLOSE_NO_STATUS, ""));
    RelayError::LegClosed {
        leg,
        code: reason.code,
        reason: reason.reason,
    }
}

impl RelaySession {
    pub fn new(ticket: SessionTicket, call: Leg, ctx: SessionContext) -> Self {
        Self {
            id: ticket.id,
            call,
            state: ticket.state,
            cancel: ticket.cancel,
            ctx,
            stats: RelayStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drives the session from `Connecting` to `Closed`.
    pub async fn run(mut self) -> SessionSummary {
        info!("Call leg accepted. Negotiating agent leg...");
        let (agent, cause, bridged) = match self.establish().await {
            Ok((mut agent, agent_format)) => {
                self.transition(SessionState::Bridging);
                let cause = self.bridge(&mut agent, agent_format).await;
                (Some(agent), cause, true)
            }
            Err(cause) => (None, cause, false),
        };
        self.teardown(agent, cause, bridged).await
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "Session state changed");
        }
    }

    /// Negotiates the agent endpoint and completes the agent handshake.
    async fn establish(&mut self) -> Result<(Leg, AudioFormat), CloseCause> {
        self.transition(SessionState::NegotiatingAgent);
        let settings = Arc::clone(&self.ctx.settings);

        let metadata = CallMetadata {
            session_id: self.id,
            assistant_id: settings.assistant_id.clone(),
            audio_format: settings.agent_format,
        };
        let negotiator = Arc::clone(&self.ctx.negotiator);
        let negotiation_timeout = settings.negotiation_timeout;
        let negotiation = async move {
            tokio::time::timeout(negotiation_timeout, negotiator.negotiate(&metadata))
                .await
                .unwrap_or_else(|_| {
                    Err(RelayError::NegotiationUnreachable(format!(
                        "no response within {:?}",
                        negotiation_timeout
                    )))
                })
        };
        let endpoint = self.await_while_call_open(negotiation).await?;
        info!(url = %endpoint.url, format = ?endpoint.audio_format, "Agent endpoint negotiated");

        let agent_format = endpoint.audio_format;
        let connector = Arc::clone(&self.ctx.connector);
        let handshake_timeout = settings.handshake_timeout;
        let handshake = async move {
            tokio::time::timeout(handshake_timeout, connector.connect(&endpoint))
                .await
                .unwrap_or_else(|_| {
                    Err(RelayError::LegHandshakeFailed {
                        leg: LegKind::Agent,
                        reason: format!("no handshake within {:?}", handshake_timeout),
                    })
                })
        };
        let agent = self.await_while_call_open(handshake).await?;
        Ok((agent, agent_format))
    }

    /// Awaits `pending` while still reacting to the call leg and shutdown.
    ///
    /// If the call leg goes away first, `pending` is dropped unfinished, so a
    /// late negotiation result can never open an agent leg.
    async fn await_while_call_open<T>(
        &mut self,
        pending: impl Future<Output = Result<T, RelayError>>,
    ) -> Result<T, CloseCause> {
        tokio::pin!(pending);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CloseCause::Shutdown),
                event = self.call.next_event() => match event {
                    LegEvent::Binary(_) | LegEvent::Text(_) => {
                        self.stats.frames_dropped += 1;
                        debug!("Dropping call-leg frame received before the agent leg is ready");
                    }
                    LegEvent::Closed(reason) => {
                        return Err(CloseCause::Error(leg_closed(LegKind::Call, reason)));
                    }
                    LegEvent::Failed(err) => return Err(CloseCause::Error(err)),
                },
                result = &mut pending => return result.map_err(CloseCause::Error),
            }
        }
    }

    /// The steady state: relays until something ends the conversation.
    async fn bridge(&mut self, agent: &mut Leg, agent_format: AudioFormat) -> CloseCause {
        info!("Bridging call leg and agent leg.");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return CloseCause::Shutdown,
                event = self.call.next_event() => match event {
                    LegEvent::Binary(data) => {
                        if let Err(err) = self.forward_to_agent(agent, data, agent_format).await {
                            return CloseCause::Error(err);
                        }
                    }
                    LegEvent::Text(text) => {
                        match agent.send(Frame::Text(text)).await {
                            Ok(true) => self.stats.frames_to_agent += 1,
                            Ok(false) => self.stats.frames_dropped += 1,
                            Err(err) => return CloseCause::Error(err),
                        }
                    }
                    LegEvent::Closed(reason) => {
                        return CloseCause::Error(leg_closed(LegKind::Call, reason));
                    }
                    LegEvent::Failed(err) => return CloseCause::Error(err),
                },
                event = agent.next_event() => match event {
                    LegEvent::Binary(data) => {
                        if let Err(err) = self.forward_to_call(data, agent_format).await {
                            return CloseCause::Error(err);
                        }
                    }
                    LegEvent::Text(text) => {
                        if self.handle_control(&text) {
                            return CloseCause::EndOfConversation;
                        }
                    }
                    LegEvent::Closed(reason) => {
                        return CloseCause::Error(leg_closed(LegKind::Agent, reason));
                    }
                    LegEvent::Failed(err) => return CloseCause::Error(err),
                },
            }
        }
    }

    async fn forward_to_agent(
        &mut self,
        agent: &mut Leg,
        data: Bytes,
        agent_format: AudioFormat,
    ) -> Result<(), RelayError> {
        let settings = Arc::clone(&self.ctx.settings);
        let len = data.len();
        let payload = if settings.convert_call_audio {
            match AudioFrame::new(data, settings.call_format).convert_to(&agent_format) {
                Ok(frame) => frame.data,
                Err(err) => {
                    self.stats.conversion_failures += 1;
                    warn!(error = %err, len, "Dropping call-leg frame that failed conversion");
                    return Ok(());
                }
            }
        } else {
            data
        };

        if agent.send(Frame::Binary(payload)).await? {
            self.stats.frames_to_agent += 1;
            trace!("Call → Agent");
        } else {
            self.stats.frames_dropped += 1;
        }
        Ok(())
    }

    async fn forward_to_call(
        &mut self,
        data: Bytes,
        agent_format: AudioFormat,
    ) -> Result<(), RelayError> {
        if !self.call.is_open() {
            self.stats.frames_dropped += 1;
            return Ok(());
        }
        let settings = Arc::clone(&self.ctx.settings);
        let len = data.len();
        let audio = match AudioFrame::new(data, agent_format).convert_to(&settings.call_format) {
            Ok(audio) => audio,
            Err(err) => {
                self.stats.conversion_failures += 1;
                warn!(error = %err, len, "Dropping agent-leg frame that failed conversion");
                return Ok(());
            }
        };
        let frame = match call_audio_frame(audio, settings.call_framing) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.frames_dropped += 1;
                warn!(error = %err, "Dropping agent-leg frame that could not be framed");
                return Ok(());
            }
        };

        if self.call.send(frame).await? {
            self.stats.frames_to_call += 1;
            trace!("Agent → Call (converted)");
        } else {
            self.stats.frames_dropped += 1;
        }
        Ok(())
    }

    /// Returns true when the control event ends the conversation.
    fn handle_control(&mut self, text: &str) -> bool {
        let Some(control) = AgentControl::parse(text) else {
            debug!("Ignoring non-control text message from agent");
            return false;
        };
        self.stats.control_events += 1;
        if control.is_end_of_conversation() {
            info!(event = %control.kind, "Agent signalled end of conversation");
            true
        } else {
            debug!(event = %control.kind, "Agent event");
            false
        }
    }

    /// Closes both legs exactly once and waits, bounded, for them to finish.
    async fn teardown(
        mut self,
        mut agent: Option<Leg>,
        cause: CloseCause,
        bridged: bool,
    ) -> SessionSummary {
        self.transition(SessionState::Closing);
        match &cause {
            CloseCause::EndOfConversation => info!("Conversation ended by agent"),
            CloseCause::Shutdown => info!("Session cancelled by shutdown"),
            CloseCause::Error(err @ RelayError::LegClosed { .. }) => info!(reason = %err, "Leg closed"),
            CloseCause::Error(err) => error!(error = %err, "Session failed"),
        }

        self.call.close(cause.close_reason_for(LegKind::Call)).await;
        if let Some(agent) = agent.as_mut() {
            agent.close(cause.close_reason_for(LegKind::Agent)).await;
        }

        let grace = self.ctx.settings.close_grace;
        let call = &mut self.call;
        let graceful = tokio::time::timeout(grace, async {
            match agent.as_mut() {
                Some(agent) => {
                    tokio::join!(call.drain(), agent.drain());
                }
                None => call.drain().await,
            }
        })
        .await
        .is_ok();
        if !graceful {
            warn!(?grace, "Close grace period elapsed; finalizing session");
        }

        self.transition(SessionState::Closed);
        info!(stats = ?self.stats, "Session closed");
        SessionSummary {
            id: self.id,
            cause,
            stats: self.stats,
            bridged,
            graceful,
        }
    }
}
