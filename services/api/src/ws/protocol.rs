//! Message shapes exchanged with the call leg and the agent leg.

use super::leg::Frame;
use crate::config::CallFraming;
use callbridge_core::{AudioFrame, audio::encode_base64};
use serde::{Deserialize, Serialize};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Control events from the provider that end the conversation.
const END_OF_CONVERSATION_TYPES: &[&str] = &["end", "end-of-call-report"];

/// The TeleCMI/PIOPIY `playStream` action, sent to the call leg as text.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PlayStream {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: PlayStreamData,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayStreamData {
    pub audio_data_type: String,
    pub sample_rate: u32,
    pub audio_data: String,
}

impl PlayStream {
    pub fn raw(pcm: &[u8], sample_rate: u32) -> Self {
        Self {
            kind: "streamAudio".to_string(),
            data: PlayStreamData {
                audio_data_type: "raw".to_string(),
                sample_rate,
                audio_data: encode_base64(pcm),
            },
        }
    }
}

/// Wraps converted audio for delivery on the call leg.
pub fn call_audio_frame(
    audio: AudioFrame,
    framing: CallFraming,
) -> Result<Frame, serde_json::Error> {
    match framing {
        CallFraming::Binary => Ok(Frame::Binary(audio.data)),
        CallFraming::PlayStream => {
            let action = PlayStream::raw(&audio.data, audio.format.sample_rate);
            Ok(Frame::Text(serde_json::to_string(&action)?))
        }
    }
}

/// The discriminated envelope of a text message from the agent leg.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AgentControl {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

impl AgentControl {
    /// Parses a text frame. Anything without a string `type` is not a
    /// control event.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn is_end_of_conversation(&self) -> bool {
        END_OF_CONVERSATION_TYPES.contains(&self.kind.as_str())
            || (self.kind == "status-update"
                && self.status.as_ref().and_then(|s| s.as_str()) == Some("ended"))
    }
}
