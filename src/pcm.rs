//! PCM16 codec: float sample frames <-> base64-encoded 16-bit wire chunks.
//!
//! The endpoint only accepts JSON text framing, so raw PCM16 bytes ride
//! inside messages as standard base64.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

/// Sample rate the endpoint expects for microphone audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the audio the endpoint streams back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// All audio in this client is mono.
pub const CHANNELS: u32 = 1;

/// A contiguous block of mono float samples at a fixed sample rate.
///
/// Samples are nominally in [-1.0, 1.0]; the encoder clamps anything
/// outside. An empty frame is valid and a no-op everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds: sample count over sample rate.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Transport-safe encoding of one frame's PCM16 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk(String);

impl WireChunk {
    /// Wrap a payload received off the wire. Validity is only checked on
    /// decode; malformed input is a hard `DecodeError`, never silence.
    pub fn from_base64(data: String) -> Self {
        Self(data)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_base64(self) -> String {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM16 payload has odd byte length {0}")]
    OddLength(usize),
}

/// Quantize float samples to little-endian PCM16 and base64-encode them.
///
/// Each sample is clamped into [-1.0, 1.0]. Negative samples scale by
/// 32768 and non-negative ones by 32767, using the full signed 16-bit
/// range on both sides without overflow. Pure and infallible.
pub fn encode(frame: &AudioFrame) -> WireChunk {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        bytes.extend_from_slice(&f32_to_pcm16(sample).to_le_bytes());
    }
    WireChunk(BASE64.encode(bytes))
}

/// Clamp and quantize one float sample to signed 16-bit.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 { (s * 32768.0) as i16 } else { (s * 32767.0) as i16 }
}

/// Decode a wire chunk back into float samples at `sample_rate`.
///
/// Fails if the payload is not valid base64 or is not a whole number of
/// 16-bit samples.
pub fn decode(chunk: &WireChunk, sample_rate: u32) -> Result<AudioFrame, DecodeError> {
    let bytes = BASE64.decode(chunk.as_str())?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    Ok(AudioFrame::new(samples, sample_rate))
}

/// Inverse scaling of `encode`: negative integers divide by 32768, the
/// rest by 32767.
pub fn pcm16_to_f32(value: i16) -> f32 {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}
