//! Modem-facing port implementations.
//!
//! Every port speaks [`SoundIo`]: blocking mono `f64` reads and writes on
//! the modem thread, bitmask-selected open/close/abort/flush, and the file
//! tee toggles. Three implementations exist:
//!
//! - [`CallbackPort`](callback::CallbackPort) — rings and semaphores against
//!   a realtime callback driver (the production path, over cpal).
//! - [`BlockingPort`](blocking::BlockingPort) — synchronous transports that
//!   read and write stereo frames inline.
//! - [`NullPort`](null::NullPort) — no device at all; sleeps to keep the
//!   modem paced, still honours the file tee.

use std::time::Duration;

use crate::backend::DirMask;
use crate::config::{SettingsSource, MODEM_RATES};
use crate::error::SoundError;
use crate::files::FileTee;
use crate::resample::Resampler;

pub mod blocking;
pub mod callback;
pub mod null;

/// A direction's converter plus the ppm currently folded into its ratio.
pub(crate) struct ConverterSlot {
    pub resampler: Resampler,
    pub ppm: i32,
}

/// The uniform capture/playback surface presented to the modem.
///
/// All calls happen on the modem thread. `read_mono` and `write_mono` may
/// block, but never longer than the engine's data timeout.
pub trait SoundIo {
    /// Opens the selected directions at the given modem rate.
    ///
    /// Reopening with a different rate retunes or rebuilds as needed;
    /// already-running directions at an unchanged rate are left alone.
    fn open(&mut self, mode: DirMask, freq: u32) -> Result<(), SoundError>;

    /// Gracefully stops the selected directions, letting queued output
    /// play out (bounded by the control timeout). Idempotent.
    fn close(&mut self, dirs: DirMask);

    /// Stops the selected directions immediately, discarding queued frames.
    fn abort(&mut self, dirs: DirMask);

    /// Waits until queued output has reached the device, then resumes.
    fn flush(&mut self, dirs: DirMask);

    /// Fills `buf` with mono modem-rate samples; returns frames produced.
    fn read_mono(&mut self, buf: &mut [f64]) -> Result<usize, SoundError>;

    /// Sends mono modem-rate samples, duplicated onto both device channels;
    /// returns frames consumed.
    fn write_mono(&mut self, buf: &[f64]) -> Result<usize, SoundError>;

    /// Sends distinct left/right channels; returns frames consumed.
    fn write_stereo(&mut self, left: &[f64], right: &[f64]) -> Result<usize, SoundError>;

    /// Whether reopening a direction requires a full device teardown first.
    fn must_close(&self) -> bool;

    /// Access to the file tee toggles.
    fn tee_mut(&mut self) -> &mut FileTee;
}

/// Rejects modem rates outside the supported set.
pub(crate) fn validate_modem_rate(freq: u32) -> Result<(), SoundError> {
    if MODEM_RATES.contains(&freq) {
        Ok(())
    } else {
        Err(SoundError::invalid_state(format!(
            "unsupported modem rate {freq} Hz"
        )))
    }
}

/// Duplicates a mono block onto both channels of an interleaved buffer.
pub(crate) fn interleave_dup(mono: &[f64], out: &mut [f32]) {
    for (i, &s) in mono.iter().enumerate() {
        let v = s as f32;
        out[2 * i] = v;
        out[2 * i + 1] = v;
    }
}

/// Interleaves separate left/right blocks.
pub(crate) fn interleave_pair(left: &[f64], right: &[f64], out: &mut [f32]) {
    for i in 0..left.len() {
        out[2 * i] = left[i] as f32;
        out[2 * i + 1] = right[i] as f32;
    }
}

/// Extracts channel 0 of an interleaved buffer into a mono block.
pub(crate) fn deinterleave_first(stereo: &[f32], out: &mut [f64]) {
    for (i, s) in out.iter_mut().enumerate() {
        *s = f64::from(stereo[2 * i]);
    }
}

/// Sleeps for the wall-clock duration of `count` frames at `rate`.
pub(crate) fn pace_sleep(count: usize, rate: f64) {
    let micros = (1e6 * count as f64 / rate).ceil() as u64;
    std::thread::sleep(Duration::from_micros(micros));
}

/// The file-playback capture path shared by all ports: looped read, receive
/// mixer, capture tee, and realistic pacing.
pub(crate) fn playback_read(
    tee: &mut FileTee,
    settings: &dyn SettingsSource,
    req_rate: f64,
    buf: &mut [f64],
) -> Result<usize, SoundError> {
    tee.read_playback(buf)?;
    if settings.mixer_enabled() {
        let volume = f64::from(settings.rx_volume());
        for s in buf.iter_mut() {
            *s *= volume;
        }
    }
    tee.tee_capture(buf);
    pace_sleep(buf.len(), req_rate);
    Ok(buf.len())
}
