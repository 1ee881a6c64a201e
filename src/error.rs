//! Session-level error taxonomy.
//!
//! Per-frame problems (one bad chunk, one dropped send) are absorbed where
//! they happen and never surface here; these variants are the failures a
//! caller actually sees.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// The microphone or output device could not be acquired. Fatal to
    /// session start: a session must not proceed silently with no audio.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Network, authentication, or protocol negotiation failure while
    /// opening the transport. Fatal to the session attempt.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// `start` was called on a controller that is not fresh `Idle`.
    /// Starting is explicitly rejected rather than silently ignored;
    /// terminal controllers need a brand-new instance. Mid-session
    /// transport failure is not an error value: it surfaces once as a
    /// terminal transport event instead.
    #[error("session already started")]
    AlreadyStarted,
}
