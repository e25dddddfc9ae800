//! Error taxonomy shared by the converter, the negotiator, and the relay.

use crate::audio::Encoding;
use std::fmt;

/// Identifies which side of a relay session an error or event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKind {
    /// The telephony-side connection carrying the caller's audio.
    Call,
    /// The voice-AI provider connection.
    Agent,
}

impl LegKind {
    /// The leg on the other side of the session.
    pub fn peer(self) -> Self {
        match self {
            LegKind::Call => LegKind::Agent,
            LegKind::Agent => LegKind::Call,
        }
    }
}

impl fmt::Display for LegKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegKind::Call => f.write_str("call"),
            LegKind::Agent => f.write_str("agent"),
        }
    }
}

/// Failures of the audio frame converter. Always scoped to a single frame.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("buffer of {len} bytes is not a multiple of the {width}-byte sample width")]
    MisalignedBuffer { len: usize, width: usize },
    #[error("unsupported audio format: {bit_depth}-bit {encoding:?} at {sample_rate} Hz")]
    UnsupportedFormat {
        sample_rate: u32,
        bit_depth: u16,
        encoding: Encoding,
    },
    #[error("base64 audio payload could not be decoded: {0}")]
    InvalidBase64(String),
}

impl From<base64::DecodeError> for ConversionError {
    fn from(err: base64::DecodeError) -> Self {
        ConversionError::InvalidBase64(err.to_string())
    }
}

/// Everything that can end, or degrade, a relay session.
///
/// All variants are session-local: they drive a single session to teardown
/// and are surfaced as diagnostics only.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The provider answered, but without a usable agent endpoint.
    #[error("agent negotiation failed: {0}")]
    NegotiationFailed(String),
    /// The provider's control endpoint could not be reached.
    #[error("agent negotiation endpoint unreachable: {0}")]
    NegotiationUnreachable(String),
    #[error("{leg} leg handshake failed: {reason}")]
    LegHandshakeFailed { leg: LegKind, reason: String },
    /// The leg was closed by its peer, normally or abnormally.
    #[error("{leg} leg closed (code {code}): {reason}")]
    LegClosed {
        leg: LegKind,
        code: u16,
        reason: String,
    },
    #[error("{leg} leg transport error: {reason}")]
    LegTransport { leg: LegKind, reason: String },
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl RelayError {
    /// The leg this error originated on, if it is leg-scoped.
    pub fn leg(&self) -> Option<LegKind> {
        match self {
            RelayError::LegHandshakeFailed { leg, .. }
            | RelayError::LegClosed { leg, .. }
            | RelayError::LegTransport { leg, .. } => Some(*leg),
            _ => None,
        }
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            RelayError::NegotiationFailed(_) | RelayError::NegotiationUnreachable(_)
        )
    }
}
