//! ALSA PCM device wrappers for mono capture and playback.
//!
//! The endpoint contract fixes both rates (16 kHz up, 24 kHz down), so the
//! wrappers ask for exactly one channel and the given rate and report what
//! the hardware actually negotiated.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use crate::pcm::CHANNELS;

/// Parameters negotiated with the ALSA hardware. The rate is not carried
/// here: `open_pcm` fails unless the device negotiated exactly the
/// requested rate.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Period size in frames
    pub period_size: usize,
}

/// Open a mono PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, "Capture")
}

/// Open a mono PCM device for playback.
pub fn open_playback(device: &str, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, "Playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    // Blocking mode; the audio threads are dedicated to this device.
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(CHANNELS)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, period_size) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_rate()?, hwp.get_period_size()? as usize)
    };

    if actual_rate != sample_rate {
        // "plug" devices resample transparently; a raw hw device that cannot
        // do the wire rate is unusable for this session.
        anyhow::bail!(
            "{} device '{}' negotiated {} Hz, need {} Hz",
            dir_name,
            device,
            actual_rate,
            sample_rate
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        period_size,
    );

    Ok((pcm, AlsaParams { period_size }))
}
