//! Live session bookkeeping.
//!
//! The registry admits call legs up to a fixed capacity, tracks every session
//! it spawned, and drives shutdown: cancel everything, wait for the sessions
//! to close on their own, then abort whatever outlives the grace period.

use crate::ws::session::{RelaySession, SessionId, SessionState, SessionSummary};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Notify, watch},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

struct SessionEntry {
    peer: Option<SocketAddr>,
    started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    abort: Option<AbortHandle>,
}

impl SessionEntry {
    fn info(&self, id: SessionId) -> SessionInfo {
        SessionInfo {
            id,
            peer: self.peer.map(|peer| peer.to_string()),
            state: *self.state.borrow(),
            started_at: self.started_at,
        }
    }
}

/// What a freshly admitted session needs from the registry.
pub struct SessionTicket {
    pub id: SessionId,
    pub cancel: CancellationToken,
    pub state: watch::Sender<SessionState>,
}

/// A point-in-time view of one live session.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Option<String>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Sessions that closed on their own within the grace period.
    pub drained: usize,
    /// Sessions that had to be aborted.
    pub forced: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    reserved: AtomicUsize,
    max_sessions: usize,
    shutdown: CancellationToken,
    emptied: Notify,
}

/// Removes the session from the registry however its task ends.
struct Deregister {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions,
            shutdown: CancellationToken::new(),
            emptied: Notify::new(),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_sessions).then_some(current + 1)
            })
            .is_ok()
    }

    /// Admits a new session, or returns `None` when the registry is full or
    /// shutting down.
    pub fn open(&self, peer: Option<SocketAddr>) -> Option<SessionTicket> {
        if self.is_shutting_down() {
            warn!(?peer, "Rejecting call leg: relay is shutting down");
            return None;
        }
        if !self.try_reserve() {
            warn!(?peer, max_sessions = self.max_sessions, "Rejecting call leg: relay at capacity");
            return None;
        }

        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        self.sessions.insert(
            id,
            SessionEntry {
                peer,
                started_at: Utc::now(),
                state: state_rx,
                abort: None,
            },
        );
        Some(SessionTicket {
            id,
            cancel: self.shutdown.child_token(),
            state: state_tx,
        })
    }

    /// Runs an admitted session on its own task.
    pub fn spawn(self: &Arc<Self>, session: RelaySession) -> JoinHandle<SessionSummary> {
        let id = session.id();
        let peer = self
            .sessions
            .get(&id)
            .and_then(|entry| entry.peer)
            .map(|peer| peer.to_string())
            .unwrap_or_default();
        let guard = Deregister {
            registry: Arc::clone(self),
            id,
        };
        let span = info_span!("relay_session", session_id = %id, %peer);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                session.run().await
            }
            .instrument(span),
        );
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.abort = Some(handle.abort_handle());
        }
        handle
    }

    /// Forgets a session and releases its capacity. Removing an unknown or
    /// already removed id is a no-op.
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            self.emptied.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The current view of one live session.
    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|entry| entry.info(*entry.key()))
    }

    /// Subscribes to a session's state transitions.
    pub fn watch(&self, id: &SessionId) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(id).map(|entry| entry.state.clone())
    }

    /// Lists live sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.info(*entry.key()))
            .collect();
        sessions.sort_by_key(|info| info.started_at);
        sessions
    }

    async fn wait_until_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }

    /// Cancels every session, waits up to `grace` for them to close, then
    /// aborts the rest. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shutdown.cancel();
        let pending = self.len();
        info!(pending, ?grace, "Shutting down relay sessions");

        if tokio::time::timeout(grace, self.wait_until_empty())
            .await
            .is_ok()
        {
            return ShutdownReport {
                drained: pending,
                forced: 0,
            };
        }

        let stuck: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut forced = 0;
        for id in stuck {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                forced += 1;
            }
        }
        self.emptied.notify_waiters();
        warn!(forced, "Aborted sessions that outlived the shutdown grace period");
        ShutdownReport {
            drained: pending.saturating_sub(forced),
            forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CallFraming,
        ws::{
            agent::MockAgentConnector,
            leg::testing::leg_pair,
            session::{RelaySettings, SessionContext},
        },
    };
    use async_trait::async_trait;
    use callbridge_core::{
        AgentEndpoint, AgentNegotiator, AudioFormat, CallMetadata, LegKind, RelayError,
    };

    struct PendingNegotiator;

    #[async_trait]
    impl AgentNegotiator for PendingNegotiator {
        async fn negotiate(&self, _call: &CallMetadata) -> Result<AgentEndpoint, RelayError> {
            std::future::pending().await
        }
    }

    fn context(close_grace: Duration) -> SessionContext {
        let mut connector = MockAgentConnector::new();
        connector.expect_connect().never();
        SessionContext {
            negotiator: Arc::new(PendingNegotiator),
            connector: Arc::new(connector),
            settings: Arc::new(RelaySettings {
                assistant_id: "asst".to_string(),
                call_format: AudioFormat::TELEPHONY,
                agent_format: AudioFormat::AGENT_DEFAULT,
                call_framing: CallFraming::Binary,
                convert_call_audio: false,
                negotiation_timeout: Duration::from_secs(60),
                handshake_timeout: Duration::from_secs(60),
                close_grace,
            }),
        }
    }

    #[test]
    fn test_capacity_is_enforced_and_released() {
        let registry = SessionRegistry::new(2);
        let first = registry.open(None).unwrap();
        let _second = registry.open(None).unwrap();
        assert!(registry.open(None).is_none());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&first.id));
        assert!(!registry.remove(&first.id));
        assert!(registry.open(None).is_some());
        assert!(registry.open(None).is_none());
    }

    #[test]
    fn test_snapshot_reports_peer_and_state() {
        let registry = SessionRegistry::new(4);
        let peer: SocketAddr = "10.0.0.7:5060".parse().unwrap();
        let ticket = registry.open(Some(peer)).unwrap();
        ticket.state.send_replace(SessionState::Bridging);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, ticket.id);
        assert_eq!(snapshot[0].peer.as_deref(), Some("10.0.0.7:5060"));
        assert_eq!(snapshot[0].state, SessionState::Bridging);
        assert_eq!(registry.info(&ticket.id).as_ref(), snapshot.first());
        assert!(registry.info(&Uuid::new_v4()).is_none());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json[0]["state"], "bridging");
    }

    #[tokio::test]
    async fn test_open_after_shutdown_is_rejected() {
        let registry = SessionRegistry::new(4);
        let report = registry.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report, ShutdownReport::default());
        assert!(registry.is_shutting_down());
        assert!(registry.open(None).is_none());

        // A second shutdown is harmless.
        let report = registry.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_tickets_are_cancelled_by_shutdown() {
        let registry = SessionRegistry::new(4);
        let ticket = registry.open(None).unwrap();
        assert!(!ticket.cancel.is_cancelled());

        registry.remove(&ticket.id);
        registry.shutdown(Duration::from_millis(10)).await;
        assert!(ticket.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_drains_cooperative_sessions() {
        let registry = Arc::new(SessionRegistry::new(4));
        let mut remotes = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let ticket = registry.open(None).unwrap();
            let (leg, remote) = leg_pair(LegKind::Call);
            handles.push(registry.spawn(RelaySession::new(
                ticket,
                leg,
                context(Duration::from_millis(100)),
            )));
            remotes.push(remote);
        }

        let report = registry.shutdown(Duration::from_secs(2)).await;
        assert_eq!(report, ShutdownReport { drained: 2, forced: 0 });
        assert!(registry.is_empty());
        for handle in handles {
            assert!(handle.await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_sessions_past_grace() {
        let registry = Arc::new(SessionRegistry::new(4));
        let ticket = registry.open(None).unwrap();
        let (leg, _remote) = leg_pair(LegKind::Call);
        // The session waits far longer for its call leg than shutdown allows.
        let handle = registry.spawn(RelaySession::new(
            ticket,
            leg,
            context(Duration::from_secs(30)),
        ));

        let report = registry.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report, ShutdownReport { drained: 0, forced: 1 });
        assert!(registry.is_empty());
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(registry.open(None).is_none());
    }
}
