//! Session controller: exclusive owner of capture, playback, and transport
//! for one voice session.
//!
//! All lifecycle state lives here and is only mutated on the single control
//! path that consumes the capture and transport channels; the producer
//! threads never touch it. A controller drives exactly one session: after
//! `Closed` or `Failed` it is spent and the caller builds a new one.

use tokio::sync::{mpsc, watch};

use crate::capture::{CaptureHandle, CapturePipeline};
use crate::config::Config;
use crate::error::VoiceError;
use crate::pcm::{self, AudioFrame, PLAYBACK_SAMPLE_RATE};
use crate::playback::PlaybackScheduler;
use crate::state_machine::SessionState;
use crate::transport::{Transport, TransportEvent};

/// The only UI-facing state besides transcript lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub connected: bool,
}

/// One chat line for the caller to render.
#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub role: String,
    pub text: String,
}

pub struct SessionController {
    config: Config,
    state: SessionState,
    status_tx: watch::Sender<SessionStatus>,
    transcript_tx: mpsc::Sender<TranscriptLine>,
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackScheduler>,
    transport: Option<Transport>,
}

impl SessionController {
    pub fn new(
        config: Config,
        transcript_tx: mpsc::Sender<TranscriptLine>,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let (status_tx, status_rx) = watch::channel(SessionStatus { connected: false });
        (
            Self {
                config,
                state: SessionState::Idle,
                status_tx,
                transcript_tx,
                capture: None,
                playback: None,
                transport: None,
            },
            status_rx,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start the session: acquire both audio devices, then connect.
    ///
    /// Returns the capture-frame and transport-event receivers the caller's
    /// control loop feeds back into `handle_capture_frame` and
    /// `handle_transport_event`. Calling `start` on anything but a fresh
    /// `Idle` controller is rejected with `AlreadyStarted`; there is never
    /// a silently created second session.
    pub async fn start(
        &mut self,
    ) -> Result<(mpsc::Receiver<AudioFrame>, mpsc::Receiver<TransportEvent>), VoiceError> {
        if self.state != SessionState::Idle {
            return Err(VoiceError::AlreadyStarted);
        }
        self.transition(SessionState::Connecting);

        // Devices first: never spend a network round trip on a session
        // with no audio I/O available.
        let playback = match PlaybackScheduler::open(&self.config) {
            Ok(playback) => playback,
            Err(e) => {
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };

        let (frame_tx, frame_rx) = mpsc::channel(self.config.channel_capacity);
        let capture = match CapturePipeline::start(&self.config, frame_tx) {
            Ok(capture) => capture,
            Err(e) => {
                drop(playback);
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };

        match Transport::connect(&self.config).await {
            Ok((transport, event_rx)) => {
                self.capture = Some(capture);
                self.playback = Some(playback);
                self.transport = Some(transport);
                self.transition(SessionState::Open);
                let _ = self.status_tx.send(SessionStatus { connected: true });
                Ok((frame_rx, event_rx))
            }
            Err(e) => {
                // Release the devices before reporting the failed start.
                drop(capture);
                drop(playback);
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// One captured frame: encode and hand to the transport. Send problems
    /// are absorbed there; a lost frame never ends the session.
    pub fn handle_capture_frame(&mut self, frame: AudioFrame) {
        if self.state != SessionState::Open {
            return;
        }
        if let Some(transport) = &self.transport {
            transport.send(pcm::encode(&frame));
        }
    }

    /// One inbound transport event. Returns true once the session is over
    /// and the control loop should stop.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> bool {
        if self.state != SessionState::Open {
            return self.state.is_terminal();
        }
        match event {
            TransportEvent::Audio(chunk) => {
                match pcm::decode(&chunk, PLAYBACK_SAMPLE_RATE) {
                    Ok(frame) => {
                        if let Some(playback) = &mut self.playback {
                            playback.enqueue(&frame);
                        }
                    }
                    // One malformed chunk is dropped; the session goes on.
                    Err(e) => log::warn!("Dropping undecodable audio chunk: {}", e),
                }
                false
            }
            TransportEvent::Interrupted => {
                log::info!("User speech detected, truncating queued playback");
                if let Some(playback) = &mut self.playback {
                    playback.interrupt();
                }
                false
            }
            TransportEvent::Transcript { role, text } => {
                if self
                    .transcript_tx
                    .send(TranscriptLine { role, text })
                    .await
                    .is_err()
                {
                    log::warn!("Transcript consumer gone");
                }
                false
            }
            TransportEvent::Closed(reason) => {
                self.shutdown(&reason).await;
                true
            }
            TransportEvent::Error(detail) => {
                log::error!("Transport failed: {}", detail);
                self.shutdown(&detail).await;
                true
            }
        }
    }

    /// Tear the session down: stop capture, close the transport, release
    /// the output device — each step best-effort so a failure in one never
    /// blocks the others. Idempotent; a no-op before start and after
    /// `Closed`/`Failed`.
    pub async fn shutdown(&mut self, reason: &str) {
        if !matches!(self.state, SessionState::Connecting | SessionState::Open) {
            return;
        }
        log::info!("Session closing: {}", reason);
        self.transition(SessionState::Closing);

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(mut playback) = self.playback.take() {
            playback.teardown();
        }

        self.transition(SessionState::Closed);
        let _ = self.status_tx.send(SessionStatus { connected: false });
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!("Session state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
