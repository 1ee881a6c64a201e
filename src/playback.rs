//! Playback scheduler: contiguous, cursor-ordered output of decoded frames.
//!
//! A single cursor tracks the device-clock time at which the next frame
//! must begin for playback to stay gapless. Frames are written by a
//! dedicated OS thread in enqueue order, so they can never reorder or
//! overlap; a frame that arrives after a delivery gap simply starts right
//! away and the baseline resets (audible catch-up, not an error).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::alsa_device;
use crate::config::Config;
use crate::error::VoiceError;
use crate::pcm::{f32_to_pcm16, AudioFrame, PLAYBACK_SAMPLE_RATE};

// ======================== Cursor ========================

/// Bookkeeping timestamp marking where the next frame must start.
///
/// Monotonically non-decreasing under `schedule`; only `interrupt` pulls
/// it back to the present.
pub struct PlaybackCursor {
    next_start: f64,
}

impl PlaybackCursor {
    pub fn new(now: f64) -> Self {
        Self { next_start: now }
    }

    /// Pick the start time for a frame of `duration` seconds: `max(now,
    /// cursor)`, then advance the cursor past the frame.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = now.max(self.next_start);
        self.next_start = start + duration;
        start
    }

    /// The remote detected the user talking over playback: anything not
    /// yet scheduled should start immediately instead of queueing behind
    /// now-irrelevant audio.
    pub fn interrupt(&mut self, now: f64) {
        self.next_start = now;
    }
}

// ======================== Clock and sink seams ========================

/// Monotonic device clock in seconds.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock-independent clock anchored at scheduler creation.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl AudioClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Blocking audio output. The scheduler thread calls `write` once per
/// frame, in order.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;
}

/// ALSA-backed sink with the usual prepare-and-retry XRUN recovery.
struct AlsaSink {
    pcm: alsa::pcm::PCM,
    convert_buf: Vec<i16>,
}

impl AlsaSink {
    fn new(pcm: alsa::pcm::PCM) -> Self {
        Self { pcm, convert_buf: Vec::new() }
    }
}

impl AudioSink for AlsaSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.convert_buf.clear();
        self.convert_buf.extend(samples.iter().map(|&s| f32_to_pcm16(s)));

        let io = self.pcm.io_i16()?;
        let total_frames = self.convert_buf.len();
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            match io.writei(&self.convert_buf[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = self.pcm.prepare() {
                        anyhow::bail!("Failed to recover PCM playback: {}", e2);
                    }
                    // 熔断器：底层持续跟不上写入速度时，丢弃剩余帧防止死循环
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries reached. Dropping {} unwritten frames.",
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

// ======================== Scheduler ========================

struct ScheduledBuffer {
    /// Interrupt generation the buffer belongs to. The playback thread
    /// discards buffers from superseded generations instead of draining
    /// a backlog of now-irrelevant audio.
    generation: u64,
    start: f64,
    samples: Vec<f32>,
}

/// Owns the output device and plays enqueued frames at the correct,
/// gapless cadence.
pub struct PlaybackScheduler {
    clock: Arc<dyn AudioClock>,
    cursor: PlaybackCursor,
    buffer_tx: Option<mpsc::Sender<ScheduledBuffer>>,
    generation: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Acquire the ALSA output device and start the playback thread.
    pub fn open(config: &Config) -> Result<Self, VoiceError> {
        let (pcm, _params) = alsa_device::open_playback(config.playback_device, PLAYBACK_SAMPLE_RATE)
            .map_err(|e| VoiceError::DeviceUnavailable(format!("{:#}", e)))?;
        let clock: Arc<dyn AudioClock> = Arc::new(MonotonicClock::new());
        Self::start(clock, Box::new(AlsaSink::new(pcm)))
    }

    /// Start a scheduler over an arbitrary clock and sink.
    pub fn start(
        clock: Arc<dyn AudioClock>,
        sink: Box<dyn AudioSink>,
    ) -> Result<Self, VoiceError> {
        let (buffer_tx, buffer_rx) = mpsc::channel::<ScheduledBuffer>();
        let generation = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let generation = generation.clone();
            let running = running.clone();
            let clock = clock.clone();
            thread::Builder::new()
                .name("voice-playback".into())
                .spawn(move || playback_loop(buffer_rx, clock, sink, &generation, &running))
                .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?
        };

        let cursor = PlaybackCursor::new(clock.now());
        Ok(Self {
            clock,
            cursor,
            buffer_tx: Some(buffer_tx),
            generation,
            running,
            thread: Some(thread),
        })
    }

    /// Schedule a frame for contiguous playback. Returns the device-clock
    /// time at which it will start.
    pub fn enqueue(&mut self, frame: &AudioFrame) -> f64 {
        let now = self.clock.now();
        if frame.is_empty() {
            return now;
        }
        let start = self.cursor.schedule(now, frame.duration_secs());
        if let Some(tx) = &self.buffer_tx {
            let buffer = ScheduledBuffer {
                generation: self.generation.load(Ordering::SeqCst),
                start,
                samples: frame.samples.clone(),
            };
            if tx.send(buffer).is_err() {
                log::warn!("Playback thread gone, dropping frame");
            }
        }
        start
    }

    /// Reset the baseline so frames enqueued from here start immediately,
    /// and mark everything still queued as stale so the playback thread
    /// discards it instead of draining the backlog first.
    ///
    /// Only the buffer the thread is currently writing cannot be
    /// recalled; the user may hear that brief overlap.
    pub fn interrupt(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cursor.interrupt(self.clock.now());
    }

    /// Release the output device. Idempotent; safe after zero enqueues.
    pub fn teardown(&mut self) {
        self.buffer_tx.take();
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Playback thread panicked during shutdown");
            }
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn playback_loop(
    buffer_rx: mpsc::Receiver<ScheduledBuffer>,
    clock: Arc<dyn AudioClock>,
    mut sink: Box<dyn AudioSink>,
    generation: &AtomicU64,
    running: &AtomicBool,
) {
    log::info!("Playback started: rate={}", PLAYBACK_SAMPLE_RATE);
    while running.load(Ordering::Relaxed) {
        match buffer_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(buffer) => {
                // Interrupted while this buffer sat in the queue: skip it
                // rather than playing stale audio.
                if buffer.generation < generation.load(Ordering::SeqCst) {
                    log::debug!("Skipping interrupted buffer");
                    continue;
                }
                let now = clock.now();
                if buffer.start > now {
                    thread::sleep(Duration::from_secs_f64(buffer.start - now));
                }
                if let Err(e) = sink.write(&buffer.samples) {
                    log::error!("Playback write error: {}", e);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("Playback stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ManualClock {
        now: Mutex<f64>,
    }

    impl ManualClock {
        fn new(start: f64) -> Self {
            Self { now: Mutex::new(start) }
        }

        fn set(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl AudioClock for ManualClock {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    struct RecordingSink {
        writes: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            self.writes.lock().unwrap().push(samples.to_vec());
            Ok(())
        }
    }

    /// Blocks writes until the gate opens, letting a backlog pile up in
    /// the scheduler queue.
    struct GatedSink {
        writes: Arc<Mutex<Vec<Vec<f32>>>>,
        gate: Arc<AtomicBool>,
    }

    impl AudioSink for GatedSink {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            while !self.gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            self.writes.lock().unwrap().push(samples.to_vec());
            Ok(())
        }
    }

    fn frame_of(samples: usize, value: f32) -> AudioFrame {
        AudioFrame::new(vec![value; samples], PLAYBACK_SAMPLE_RATE)
    }

    #[test]
    fn cursor_is_gapless_and_non_overlapping() {
        let mut cursor = PlaybackCursor::new(10.0);
        let s1 = cursor.schedule(10.0, 0.02);
        let s2 = cursor.schedule(10.0, 0.02);
        let s3 = cursor.schedule(10.0, 0.05);
        assert_eq!(s1, 10.0);
        assert!((s2 - 10.02).abs() < 1e-9);
        assert!((s3 - 10.04).abs() < 1e-9);
    }

    #[test]
    fn cursor_catches_up_after_gap() {
        let mut cursor = PlaybackCursor::new(0.0);
        cursor.schedule(0.0, 0.02);
        // Next frame arrives long after the queue drained: it starts now,
        // not at the stale cursor position.
        let start = cursor.schedule(5.0, 0.02);
        assert_eq!(start, 5.0);
    }

    #[test]
    fn cursor_interrupt_resets_baseline() {
        let mut cursor = PlaybackCursor::new(0.0);
        cursor.schedule(0.0, 0.02);
        cursor.schedule(0.0, 0.02);
        cursor.interrupt(0.005);
        let start = cursor.schedule(0.005, 0.02);
        assert_eq!(start, 0.005);
    }

    #[test]
    fn scheduler_back_to_back_frames() {
        // F1(20ms), F2(20ms) enqueued at device time t0: F1 at t0, F2 at
        // t0 + 20ms.
        let clock = Arc::new(ManualClock::new(0.0));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(RecordingSink { writes: writes.clone() });
        let mut scheduler = PlaybackScheduler::start(clock.clone(), sink).unwrap();

        let s1 = scheduler.enqueue(&frame_of(480, 0.1));
        let s2 = scheduler.enqueue(&frame_of(480, 0.2));
        assert_eq!(s1, 0.0);
        assert!((s2 - 0.02).abs() < 1e-9);

        // Let the thread drain both buffers before tearing down.
        thread::sleep(Duration::from_millis(150));
        scheduler.teardown();

        let written = writes.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0][0], 0.1);
        assert_eq!(written[1][0], 0.2);
    }

    #[test]
    fn scheduler_interrupt_then_enqueue_plays_immediately() {
        let clock = Arc::new(ManualClock::new(0.0));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(RecordingSink { writes: writes.clone() });
        let mut scheduler = PlaybackScheduler::start(clock.clone(), sink).unwrap();

        scheduler.enqueue(&frame_of(480, 0.1));
        // Let the first frame reach the sink before interrupting.
        thread::sleep(Duration::from_millis(50));
        clock.set(0.005);
        scheduler.interrupt();
        let start = scheduler.enqueue(&frame_of(480, 0.2));
        assert!((start - 0.005).abs() < 1e-9);

        thread::sleep(Duration::from_millis(150));
        scheduler.teardown();
        assert_eq!(writes.lock().unwrap().len(), 2);
    }

    #[test]
    fn interrupt_discards_queued_backlog() {
        // The endpoint streams faster than real time, so a backlog piles
        // up while the sink is busy. An interrupt must discard the queued
        // frames, not drain them before the fresh audio.
        let clock = Arc::new(ManualClock::new(0.0));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(AtomicBool::new(false));
        let sink = Box::new(GatedSink { writes: writes.clone(), gate: gate.clone() });
        let mut scheduler = PlaybackScheduler::start(clock.clone(), sink).unwrap();

        for _ in 0..10 {
            scheduler.enqueue(&frame_of(480, 0.1));
        }
        // Let the thread pull the first buffer and block in the sink.
        thread::sleep(Duration::from_millis(50));
        scheduler.interrupt();
        let start = scheduler.enqueue(&frame_of(480, 0.9));
        // Cursor reset: the fresh frame starts now, not behind the backlog.
        assert_eq!(start, 0.0);

        gate.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        scheduler.teardown();

        let written = writes.lock().unwrap();
        // Only the frame already in the sink and the fresh one play.
        assert_eq!(written.len(), 2);
        assert_eq!(written[0][0], 0.1);
        assert_eq!(written[1][0], 0.9);
    }

    #[test]
    fn empty_frame_is_a_no_op() {
        let clock = Arc::new(ManualClock::new(1.0));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(RecordingSink { writes: writes.clone() });
        let mut scheduler = PlaybackScheduler::start(clock, sink).unwrap();

        scheduler.enqueue(&AudioFrame::new(Vec::new(), PLAYBACK_SAMPLE_RATE));
        let start = scheduler.enqueue(&frame_of(240, 0.3));
        // The empty frame advanced nothing.
        assert_eq!(start, 1.0);
        scheduler.teardown();
    }

    #[test]
    fn teardown_is_idempotent() {
        let clock = Arc::new(ManualClock::new(0.0));
        let sink = Box::new(RecordingSink { writes: Arc::new(Mutex::new(Vec::new())) });
        let mut scheduler = PlaybackScheduler::start(clock, sink).unwrap();
        scheduler.teardown();
        scheduler.teardown();
        // Enqueue after teardown must not panic either.
        scheduler.enqueue(&frame_of(10, 0.0));
    }
}
