//! Microphone capture pipeline: ALSA device -> fixed-size float frames.
//!
//! Capture runs on a dedicated OS thread (not a tokio task) so device I/O
//! never contends with the async network side. Frames leave in strict
//! arrival order over a bounded channel; when the consumer falls behind a
//! frame is dropped rather than blocking the device loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tokio::sync::mpsc;

use crate::alsa_device;
use crate::config::Config;
use crate::error::VoiceError;
use crate::pcm::{AudioFrame, CAPTURE_SAMPLE_RATE, pcm16_to_f32};

/// Accumulates capture samples and cuts them into fixed-size frames.
///
/// ALSA period sizes rarely match the wire frame size, so samples are
/// buffered across period boundaries.
pub struct FrameChunker {
    frame_samples: usize,
    buf: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize) -> Self {
        Self { frame_samples, buf: Vec::with_capacity(frame_samples * 2) }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.buf.extend_from_slice(samples);
    }

    /// Take the next complete frame, if one has accumulated.
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.buf.len() < self.frame_samples {
            return None;
        }
        let rest = self.buf.split_off(self.frame_samples);
        Some(std::mem::replace(&mut self.buf, rest))
    }
}

/// Handle to a running capture thread.
///
/// Dropping the handle stops capture; `stop` may also be called any number
/// of times explicitly. After `stop` returns no more frames are delivered.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct CapturePipeline;

impl CapturePipeline {
    /// Acquire the microphone and start feeding frames into `frame_tx`.
    ///
    /// The device is opened before the thread spawns, so an unavailable or
    /// permission-denied microphone fails the call synchronously with
    /// `DeviceUnavailable` instead of a silent audio-less session.
    pub fn start(
        config: &Config,
        frame_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<CaptureHandle, VoiceError> {
        let (pcm, params) = alsa_device::open_capture(config.capture_device, CAPTURE_SAMPLE_RATE)
            .map_err(|e| VoiceError::DeviceUnavailable(format!("{:#}", e)))?;

        let running = Arc::new(AtomicBool::new(true));
        let frame_samples = config.frame_samples;

        let thread = {
            let running = running.clone();
            thread::Builder::new()
                .name("voice-capture".into())
                .spawn(move || {
                    if let Err(e) = capture_loop(pcm, params.period_size, frame_samples, frame_tx, &running)
                    {
                        log::error!("Capture thread error: {}", e);
                    }
                })
                .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?
        };

        Ok(CaptureHandle { running, thread: Some(thread) })
    }
}

fn capture_loop(
    pcm: alsa::pcm::PCM,
    period_size: usize,
    frame_samples: usize,
    frame_tx: mpsc::Sender<AudioFrame>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let mut read_buf = vec![0i16; period_size];
    let mut chunker = FrameChunker::new(frame_samples);
    let mut convert_buf = Vec::with_capacity(period_size);

    log::info!(
        "Recording started: rate={}, period={}, frame_samples={}",
        CAPTURE_SAMPLE_RATE,
        period_size,
        frame_samples,
    );

    while running.load(Ordering::Relaxed) {
        // Read one period from ALSA
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                convert_buf.clear();
                convert_buf.extend(read_buf[..frames].iter().map(|&s| pcm16_to_f32(s)));
                chunker.push(&convert_buf);

                while let Some(samples) = chunker.next_frame() {
                    let frame = AudioFrame::new(samples, CAPTURE_SAMPLE_RATE);
                    match frame_tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Audio is ephemeral; dropping one frame beats
                            // stalling the device loop.
                            log::warn!("Capture channel full, dropping one frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            log::info!("Capture consumer gone, stopping");
                            return Ok(());
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_slices_across_period_boundaries() {
        let mut chunker = FrameChunker::new(4);
        chunker.push(&[0.0, 0.1, 0.2]);
        assert!(chunker.next_frame().is_none());
        chunker.push(&[0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);
        assert_eq!(chunker.next_frame().unwrap(), vec![0.0, 0.1, 0.2, 0.3]);
        assert_eq!(chunker.next_frame().unwrap(), vec![0.4, 0.5, 0.6, 0.7]);
        assert!(chunker.next_frame().is_none());
        // Remainder carries over into the next frame.
        chunker.push(&[0.9, 1.0, 1.1]);
        assert_eq!(chunker.next_frame().unwrap(), vec![0.8, 0.9, 1.0, 1.1]);
    }

    #[test]
    fn chunker_exact_multiple() {
        let mut chunker = FrameChunker::new(2);
        chunker.push(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(chunker.next_frame().unwrap(), vec![1.0, 2.0]);
        assert_eq!(chunker.next_frame().unwrap(), vec![3.0, 4.0]);
        assert!(chunker.next_frame().is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = running.clone();
            thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    thread::yield_now();
                }
            })
        };
        let mut handle = CaptureHandle { running, thread: Some(thread) };
        handle.stop();
        handle.stop();
        assert!(handle.thread.is_none());
    }
}
