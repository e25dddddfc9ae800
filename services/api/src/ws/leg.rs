//! A transport-neutral handle on one side of a relay session.
//!
//! Both the inbound axum socket and the outbound tungstenite socket are
//! adapted into the same [`Leg`] shape so the session state machine never
//! sees a concrete WebSocket type.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use bytes::Bytes;
use callbridge_core::{LegKind, RelayError};
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::protocol::{
        CloseFrame as WsCloseFrame, Message as WsMessage, frame::coding::CloseCode,
    },
};
use tracing::{debug, trace};

/// A close code plus a human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One message on a leg, in either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Close(Option<CloseReason>),
}

/// What the session observes when it reads from a leg.
#[derive(Debug)]
pub enum LegEvent {
    Binary(Bytes),
    Text(String),
    /// The peer closed the connection, or the stream ended.
    Closed(Option<CloseReason>),
    Failed(RelayError),
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RelayError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, RelayError>> + Send>>;

/// One exclusively owned connection of a session.
pub struct Leg {
    kind: LegKind,
    sink: FrameSink,
    stream: FrameStream,
    close_sent: bool,
    peer_closed: bool,
}

impl Leg {
    pub fn new(kind: LegKind, sink: FrameSink, stream: FrameStream) -> Self {
        Self {
            kind,
            sink,
            stream,
            close_sent: false,
            peer_closed: false,
        }
    }

    /// Adapts an accepted axum WebSocket.
    pub fn from_axum(kind: LegKind, socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();
        let sink = tx
            .with(|frame: Frame| future::ready(Ok::<_, axum::Error>(frame_to_axum(frame))))
            .sink_map_err(move |e| transport_error(kind, e));
        let stream = rx.filter_map(move |msg| {
            future::ready(match msg {
                Ok(AxumMessage::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(AxumMessage::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(AxumMessage::Close(close)) => Some(Ok(Frame::Close(
                    close.map(|c| CloseReason::new(c.code, c.reason.as_str())),
                ))),
                Ok(AxumMessage::Ping(_)) | Ok(AxumMessage::Pong(_)) => None,
                Err(e) => Some(Err(transport_error(kind, e))),
            })
        });
        Self::new(kind, Box::pin(sink), Box::pin(stream))
    }

    /// Adapts an outbound tungstenite WebSocket.
    pub fn from_tungstenite<S>(kind: LegKind, socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = socket.split();
        let sink = tx
            .with(|frame: Frame| {
                future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                    frame_to_tungstenite(frame),
                ))
            })
            .sink_map_err(move |e| transport_error(kind, e));
        let stream = rx.filter_map(move |msg| {
            future::ready(match msg {
                Ok(WsMessage::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(WsMessage::Close(close)) => Some(Ok(Frame::Close(
                    close.map(|c| CloseReason::new(u16::from(c.code), c.reason.as_str())),
                ))),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => None,
                Err(e) => Some(Err(transport_error(kind, e))),
            })
        });
        Self::new(kind, Box::pin(sink), Box::pin(stream))
    }

    /// True until either side has started closing the connection.
    pub fn is_open(&self) -> bool {
        !self.close_sent && !self.peer_closed
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Reads the next event. After the peer has closed this always yields
    /// `Closed(None)` without touching the transport.
    pub async fn next_event(&mut self) -> LegEvent {
        if self.peer_closed {
            return LegEvent::Closed(None);
        }
        match self.stream.next().await {
            Some(Ok(Frame::Binary(data))) => LegEvent::Binary(data),
            Some(Ok(Frame::Text(text))) => LegEvent::Text(text),
            Some(Ok(Frame::Close(reason))) => {
                self.peer_closed = true;
                LegEvent::Closed(reason)
            }
            Some(Err(e)) => {
                self.peer_closed = true;
                LegEvent::Failed(e)
            }
            None => {
                self.peer_closed = true;
                LegEvent::Closed(None)
            }
        }
    }

    /// Sends a data frame. Returns `Ok(false)` when the leg is no longer
    /// open and the frame was dropped.
    pub async fn send(&mut self, frame: Frame) -> Result<bool, RelayError> {
        if !self.is_open() {
            trace!(leg = %self.kind, "Dropping frame for closed leg");
            return Ok(false);
        }
        self.sink.send(frame).await?;
        Ok(true)
    }

    /// Asks the peer to close. Idempotent: returns `true` only for the call
    /// that actually issued the close request.
    pub async fn close(&mut self, reason: CloseReason) -> bool {
        if self.close_sent {
            return false;
        }
        self.close_sent = true;
        if !self.peer_closed {
            if let Err(e) = self.sink.send(Frame::Close(Some(reason))).await {
                debug!(leg = %self.kind, error = %e, "Close frame could not be delivered");
            }
        }
        let _ = self.sink.close().await;
        !self.peer_closed
    }

    /// Consumes and discards incoming frames until the peer reports closed.
    pub async fn drain(&mut self) {
        while !self.peer_closed {
            match self.next_event().await {
                LegEvent::Binary(_) | LegEvent::Text(_) => {
                    trace!(leg = %self.kind, "Ignoring frame received while closing");
                }
                LegEvent::Closed(_) | LegEvent::Failed(_) => {}
            }
        }
    }
}

fn transport_error(kind: LegKind, err: impl std::fmt::Display) -> RelayError {
    RelayError::LegTransport {
        leg: kind,
        reason: err.to_string(),
    }
}

fn frame_to_axum(frame: Frame) -> AxumMessage {
    match frame {
        Frame::Binary(data) => AxumMessage::Binary(data),
        Frame::Text(text) => AxumMessage::Text(text.into()),
        Frame::Close(reason) => AxumMessage::Close(reason.map(|r| AxumCloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

fn frame_to_tungstenite(frame: Frame) -> WsMessage {
    match frame {
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Close(reason) => WsMessage::Close(reason.map(|r| WsCloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

/// In-memory legs for exercising sessions without sockets.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::channel::mpsc;

    /// The far end of an in-memory leg, as seen by a test.
    pub(crate) struct RemoteEnd {
        pub tx: mpsc::UnboundedSender<Result<Frame, RelayError>>,
        pub rx: mpsc::UnboundedReceiver<Frame>,
    }

    impl RemoteEnd {
        pub fn send(&self, frame: Frame) {
            let _ = self.tx.unbounded_send(Ok(frame));
        }

        pub fn fail(&self, err: RelayError) {
            let _ = self.tx.unbounded_send(Err(err));
        }

        /// Everything the session has written so far, ending once the
        /// session has closed its sink.
        pub async fn collect(self) -> Vec<Frame> {
            self.rx.collect().await
        }
    }

    pub(crate) fn leg_pair(kind: LegKind) -> (Leg, RemoteEnd) {
        let (to_remote, from_session) = mpsc::unbounded::<Frame>();
        let (to_session, from_remote) = mpsc::unbounded::<Result<Frame, RelayError>>();
        let sink = to_remote.sink_map_err(move |e| transport_error(kind, e));
        let leg = Leg::new(kind, Box::pin(sink), Box::pin(from_remote));
        (
            leg,
            RemoteEnd {
                tx: to_session,
                rx: from_session,
            },
        )
    }
}
