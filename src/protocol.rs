//! JSON message shapes exchanged with the conversational endpoint.
//!
//! The endpoint accepts text frames only; PCM16 audio rides base64 inside
//! an `audio` payload with a MIME-style rate tag.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::pcm::{CAPTURE_SAMPLE_RATE, CHANNELS, WireChunk};

/// Rate tag for outbound microphone audio.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

// ======================== Outbound ========================

#[derive(Serialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_samples: usize,
}

/// Setup message opening the session; the server answers with its own
/// `hello` once negotiation succeeds.
#[derive(Serialize)]
pub struct HelloMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub version: u8,
    pub transport: String,
    pub model: String,
    pub voice: String,
    pub audio_params: AudioParams,
}

impl HelloMessage {
    pub fn new(config: &Config) -> Self {
        Self {
            msg_type: "hello".to_string(),
            version: 1,
            transport: "websocket".to_string(),
            model: config.model.to_string(),
            voice: config.voice.to_string(),
            audio_params: AudioParams {
                format: "pcm16".to_string(),
                sample_rate: CAPTURE_SAMPLE_RATE,
                channels: CHANNELS as u8,
                frame_samples: config.frame_samples,
            },
        }
    }
}

#[derive(Serialize)]
pub struct AudioPayload {
    pub data: String,
    pub mime_type: String,
}

/// One microphone chunk on its way to the endpoint.
#[derive(Serialize)]
pub struct AudioMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub audio: AudioPayload,
}

impl AudioMessage {
    pub fn new(chunk: WireChunk) -> Self {
        Self {
            msg_type: "audio".to_string(),
            audio: AudioPayload {
                data: chunk.into_base64(),
                mime_type: CAPTURE_MIME_TYPE.to_string(),
            },
        }
    }
}

// ======================== Inbound ========================

#[derive(Deserialize, Debug, Clone)]
pub struct InboundAudio {
    pub data: String,
    pub mime_type: Option<String>,
}

/// Loose envelope for everything the server sends; the `type` tag decides
/// which optional fields matter.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub audio: Option<InboundAudio>,
    pub role: Option<String>,
    pub text: Option<String>,
    pub reason: Option<String>,
    pub detail: Option<String>,
}
