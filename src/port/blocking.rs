//! Blocking-transport port.
//!
//! Some audio paths are synchronous by nature: the transport accepts and
//! returns interleaved stereo frames with its own internal buffering, so no
//! rings or semaphores are needed — resampling happens inline on the modem
//! thread. Reopening a direction means tearing the transport down, which is
//! why [`BlockingPort::must_close`] answers `true`.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::{Dir, DirMask};
use crate::config::{
    DeviceSettings, SampleRateSetting, SettingsSource, DEVICE_CHANNELS, SCRATCH_FRAMES,
};
use crate::error::SoundError;
use crate::files::FileTee;
use crate::port::{
    deinterleave_first, interleave_dup, interleave_pair, playback_read, validate_modem_rate,
    ConverterSlot, SoundIo,
};
use crate::resample::Resampler;

/// Device rate assumed when the user setting leaves it to the transport.
const DEFAULT_BLOCKING_RATE: f64 = 48000.0;

/// A synchronous stereo-frame transport.
///
/// Frame buffers are interleaved 2-channel `f32`; sizing is in samples
/// (`frames × 2`), never in bytes, so unit mistakes cannot creep in.
pub trait BlockingIo {
    /// Opens one direction at the given device rate.
    fn open(
        &mut self,
        dir: Dir,
        dev_rate: f64,
        server: Option<&str>,
    ) -> Result<(), SoundError>;

    /// Releases one direction. Idempotent.
    fn close(&mut self, dir: Dir);

    /// Blocks until `frames` is filled with captured audio.
    fn read(&mut self, frames: &mut [f32]) -> Result<(), SoundError>;

    /// Blocks until `frames` has been accepted for playback.
    fn write(&mut self, frames: &[f32]) -> Result<(), SoundError>;

    /// Blocks until previously written audio has reached the device.
    fn drain(&mut self, dir: Dir) -> Result<(), SoundError>;

    /// Discards any buffered audio without playing it.
    fn discard(&mut self, dir: Dir);

    /// Whether the direction is open.
    fn is_open(&self, dir: Dir) -> bool;
}

/// Port over a [`BlockingIo`] transport.
pub struct BlockingPort<T: BlockingIo> {
    io: T,
    settings: Arc<dyn SettingsSource>,
    device: DeviceSettings,
    req_rate: f64,
    dev_rate: [f64; 2],
    converters: [ConverterSlot; 2],
    fbuf: Vec<f32>,
    snd_buffer: Vec<f32>,
    src_buffer: Vec<f32>,
    tee: FileTee,
}

impl<T: BlockingIo> BlockingPort<T> {
    /// Creates a closed port over the given transport.
    pub fn new(io: T, settings: Arc<dyn SettingsSource>, device: DeviceSettings) -> Self {
        let quality = device.converter;
        Self {
            io,
            settings,
            device,
            req_rate: 0.0,
            dev_rate: [0.0, 0.0],
            converters: [
                ConverterSlot {
                    resampler: Resampler::new(DEVICE_CHANNELS, 1.0, quality),
                    ppm: 0,
                },
                ConverterSlot {
                    resampler: Resampler::new(DEVICE_CHANNELS, 1.0, quality),
                    ppm: 0,
                },
            ],
            fbuf: vec![0.0; DEVICE_CHANNELS * SCRATCH_FRAMES],
            snd_buffer: vec![0.0; DEVICE_CHANNELS * SCRATCH_FRAMES],
            src_buffer: vec![0.0; DEVICE_CHANNELS * SCRATCH_FRAMES],
            tee: FileTee::new(),
        }
    }

    /// Borrow of the underlying transport.
    pub fn io(&self) -> &T {
        &self.io
    }

    fn settings_rate(&self, dir: Dir) -> f64 {
        let setting = match dir {
            Dir::Input => self.device.in_sample_rate,
            Dir::Output => self.device.out_sample_rate,
        };
        match setting {
            SampleRateSetting::Hz(rate) => f64::from(rate),
            SampleRateSetting::Auto | SampleRateSetting::Native => DEFAULT_BLOCKING_RATE,
        }
    }

    fn live_ppm(&self, dir: Dir) -> i32 {
        match dir {
            Dir::Input => self.settings.rx_ppm(),
            Dir::Output => self.settings.tx_ppm(),
        }
    }

    fn ratio_for(&self, dir: Dir, ppm: i32) -> f64 {
        let corrected = self.dev_rate[dir.index()] * (1.0 + f64::from(ppm) * 1e-6);
        match dir {
            Dir::Input => self.req_rate / corrected,
            Dir::Output => corrected / self.req_rate,
        }
    }

    fn rebuild_converter(&mut self, dir: Dir) {
        let ppm = self.live_ppm(dir);
        let ratio = self.ratio_for(dir, ppm);
        let slot = &mut self.converters[dir.index()];
        slot.ppm = ppm;
        slot.resampler.set_ratio(ratio);
        slot.resampler.reset();
    }

    fn retune(&mut self, dir: Dir) {
        let ppm = self.live_ppm(dir);
        if ppm != self.converters[dir.index()].ppm {
            let ratio = self.ratio_for(dir, ppm);
            let slot = &mut self.converters[dir.index()];
            slot.ppm = ppm;
            slot.resampler.set_ratio(ratio);
        }
    }

    fn require_open(&self, dir: Dir) -> Result<(), SoundError> {
        if self.io.is_open(dir) {
            Ok(())
        } else {
            Err(SoundError::invalid_state(format!("{dir:?} not open")))
        }
    }

    fn read_block(&mut self, buf: &mut [f64]) -> Result<usize, SoundError> {
        let count = buf.len();
        self.retune(Dir::Input);
        let ratio = self.converters[0].resampler.ratio();
        let ncount = ((count as f64 / ratio).floor() as usize)
            .clamp(1, SCRATCH_FRAMES);

        self.io.read(&mut self.fbuf[..DEVICE_CHANNELS * ncount])?;

        let resample = self.req_rate != self.dev_rate[0] || self.converters[0].ppm != 0;
        let produced;
        if resample {
            let conv = &mut self.converters[0].resampler;
            let result = conv.process(
                &self.fbuf[..DEVICE_CHANNELS * ncount],
                &mut self.snd_buffer[..DEVICE_CHANNELS * count],
            );
            produced = result.output_gen;
            deinterleave_first(
                &self.snd_buffer[..DEVICE_CHANNELS * produced],
                &mut buf[..produced],
            );
        } else {
            produced = count;
            deinterleave_first(&self.fbuf[..DEVICE_CHANNELS * count], buf);
        }

        self.tee.tee_capture(&buf[..produced]);
        Ok(produced)
    }

    fn write_block(&mut self, count: usize) -> Result<(), SoundError> {
        self.retune(Dir::Output);
        let resample = self.req_rate != self.dev_rate[1] || self.converters[1].ppm != 0;
        if resample {
            let conv = &mut self.converters[1].resampler;
            let result = conv.process(
                &self.fbuf[..DEVICE_CHANNELS * count],
                &mut self.src_buffer[..],
            );
            self.io
                .write(&self.src_buffer[..DEVICE_CHANNELS * result.output_gen])
        } else {
            self.io.write(&self.fbuf[..DEVICE_CHANNELS * count])
        }
    }
}

impl<T: BlockingIo> SoundIo for BlockingPort<T> {
    fn open(&mut self, mode: DirMask, freq: u32) -> Result<(), SoundError> {
        validate_modem_rate(freq)?;
        let rate_changed = self.req_rate != f64::from(freq);
        self.req_rate = f64::from(freq);
        self.tee.set_sample_rate(freq);

        let all_open = Dir::BOTH
            .into_iter()
            .filter(|d| mode.contains(*d))
            .all(|d| self.io.is_open(d));

        for dir in Dir::BOTH {
            if !mode.contains(dir) {
                continue;
            }
            self.dev_rate[dir.index()] = self.settings_rate(dir);
            if !(all_open && rate_changed) && !self.io.is_open(dir) {
                let server = self.device.server.clone();
                self.io
                    .open(dir, self.dev_rate[dir.index()], server.as_deref())?;
            }
            self.rebuild_converter(dir);
        }
        Ok(())
    }

    fn close(&mut self, dirs: DirMask) {
        for dir in Dir::BOTH {
            if dirs.contains(dir) && self.io.is_open(dir) {
                if let Err(e) = self.io.drain(dir) {
                    tracing::warn!("drain before close failed: {e}");
                }
                self.io.close(dir);
            }
        }
    }

    fn abort(&mut self, dirs: DirMask) {
        for dir in Dir::BOTH {
            if dirs.contains(dir) && self.io.is_open(dir) {
                self.io.discard(dir);
                self.io.close(dir);
            }
        }
    }

    fn flush(&mut self, dirs: DirMask) {
        for dir in Dir::BOTH {
            if dirs.contains(dir) && self.io.is_open(dir) {
                if let Err(e) = self.io.drain(dir) {
                    tracing::warn!("drain failed: {e}");
                }
            }
        }
    }

    fn read_mono(&mut self, buf: &mut [f64]) -> Result<usize, SoundError> {
        if self.tee.is_playback() {
            return playback_read(&mut self.tee, self.settings.as_ref(), self.req_rate, buf);
        }
        self.require_open(Dir::Input)?;
        self.retune(Dir::Input);

        let ratio = self.converters[0].resampler.ratio();
        let max_chunk = ((SCRATCH_FRAMES as f64 * ratio).floor() as usize)
            .clamp(1, SCRATCH_FRAMES);
        if buf.len() <= max_chunk {
            return self.read_block(buf);
        }
        let mut total = 0;
        for chunk in buf.chunks_mut(max_chunk) {
            total += self.read_block(chunk)?;
        }
        Ok(total)
    }

    fn write_mono(&mut self, buf: &[f64]) -> Result<usize, SoundError> {
        self.tee.tee_generate(buf);
        self.require_open(Dir::Output)?;
        self.retune(Dir::Output);

        let ratio = self.converters[1].resampler.ratio();
        let max_chunk = ((SCRATCH_FRAMES as f64 / ratio).floor() as usize)
            .clamp(1, SCRATCH_FRAMES);
        for chunk in buf.chunks(max_chunk) {
            interleave_dup(chunk, &mut self.fbuf[..DEVICE_CHANNELS * chunk.len()]);
            self.write_block(chunk.len())?;
        }
        Ok(buf.len())
    }

    fn write_stereo(&mut self, left: &[f64], right: &[f64]) -> Result<usize, SoundError> {
        debug_assert_eq!(left.len(), right.len());
        self.tee.tee_generate(left);
        self.require_open(Dir::Output)?;
        self.retune(Dir::Output);

        let count = left.len().min(right.len());
        let ratio = self.converters[1].resampler.ratio();
        let max_chunk = ((SCRATCH_FRAMES as f64 / ratio).floor() as usize)
            .clamp(1, SCRATCH_FRAMES);
        let mut start = 0;
        while start < count {
            let n = (count - start).min(max_chunk);
            interleave_pair(
                &left[start..start + n],
                &right[start..start + n],
                &mut self.fbuf[..DEVICE_CHANNELS * n],
            );
            self.write_block(n)?;
            start += n;
        }
        Ok(count)
    }

    fn must_close(&self) -> bool {
        true
    }

    fn tee_mut(&mut self) -> &mut FileTee {
        &mut self.tee
    }
}

impl<T: BlockingIo> Drop for BlockingPort<T> {
    fn drop(&mut self) {
        self.close(DirMask::BOTH);
    }
}

/// In-memory transport that loops written frames back to the reader.
///
/// Reads return silence once the queue runs dry, like a quiet capture
/// device. Used by tests and offline loop checks.
pub struct LoopbackIo {
    queue: VecDeque<f32>,
    open: [bool; 2],
}

impl LoopbackIo {
    /// Creates a closed loopback transport.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            open: [false, false],
        }
    }

    /// Samples currently queued between the two directions.
    pub fn queued_samples(&self) -> usize {
        self.queue.len()
    }
}

impl Default for LoopbackIo {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingIo for LoopbackIo {
    fn open(
        &mut self,
        dir: Dir,
        _dev_rate: f64,
        _server: Option<&str>,
    ) -> Result<(), SoundError> {
        self.open[dir.index()] = true;
        Ok(())
    }

    fn close(&mut self, dir: Dir) {
        self.open[dir.index()] = false;
    }

    fn read(&mut self, frames: &mut [f32]) -> Result<(), SoundError> {
        for s in frames.iter_mut() {
            *s = self.queue.pop_front().unwrap_or(0.0);
        }
        Ok(())
    }

    fn write(&mut self, frames: &[f32]) -> Result<(), SoundError> {
        self.queue.extend(frames.iter().copied());
        Ok(())
    }

    fn drain(&mut self, _dir: Dir) -> Result<(), SoundError> {
        Ok(())
    }

    fn discard(&mut self, _dir: Dir) {
        self.queue.clear();
    }

    fn is_open(&self, dir: Dir) -> bool {
        self.open[dir.index()]
    }
}
