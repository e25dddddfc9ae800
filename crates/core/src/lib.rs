//! Session-independent building blocks of the call relay: PCM conversion,
//! the error taxonomy, and agent-leg negotiation.

pub mod audio;
pub mod error;
pub mod negotiator;

pub use audio::{AudioFormat, AudioFrame, Encoding, Endianness, convert};
pub use error::{ConversionError, LegKind, RelayError};
pub use negotiator::{AgentEndpoint, AgentNegotiator, CallMetadata, VapiNegotiator};
