//! The duplex streaming engine.
//!
//! [`CallbackPort`] bridges the modem's blocking mono API and a realtime
//! callback driver. Per direction it keeps a transfer ring, two counting
//! semaphores and a streaming resampler; the callback side of the protocol
//! lives in [`crate::backend`]. The modem side here does the resampling,
//! channel fan-in/fan-out, drift retuning and all waiting.
//!
//! Every wait is bounded: data-path waits by `max(1 s, 2·2·n/dev_rate)`,
//! close and flush by [`CONTROL_TIMEOUT`]. The realtime callback is never
//! waited on while holding anything it needs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::cpal_driver::CpalDriver;
use crate::backend::{
    CallbackDriver, Dir, DirMask, DriverConfig, DriverStream, StreamShared, StreamState,
};
use crate::config::{
    DeviceSettings, SampleRateSetting, SettingsSource, CONTROL_TIMEOUT, DEVICE_CHANNELS,
    RING_BLOCK_FRAMES, SCRATCH_FRAMES,
};
use crate::error::SoundError;
use crate::files::FileTee;
use crate::port::{
    deinterleave_first, interleave_dup, interleave_pair, playback_read, validate_modem_rate,
    ConverterSlot, SoundIo,
};
use crate::resample::Resampler;

/// Running condition counters, updated as flags come back from the
/// realtime callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Capture blocks dropped because the modem thread fell behind.
    pub overruns: u64,
    /// Playback callbacks that ran the ring dry and sent silence.
    pub underruns: u64,
}

struct StreamSlot<S> {
    stream: Option<S>,
    shared: Option<Arc<StreamShared>>,
    dev_rate: f64,
}

impl<S> StreamSlot<S> {
    fn new() -> Self {
        Self {
            stream: None,
            shared: None,
            dev_rate: 0.0,
        }
    }
}

/// Duplex port over a callback driver. `CallbackPort<CpalDriver>` is the
/// production configuration; tests run the same engine over the loopback
/// driver.
pub struct CallbackPort<D: CallbackDriver> {
    driver: D,
    settings: Arc<dyn SettingsSource>,
    device: DeviceSettings,
    req_rate: f64,
    slots: [StreamSlot<D::Stream>; 2],
    converters: [ConverterSlot; 2],
    /// Resampler output scratch, capture side.
    snd_buffer: Vec<f32>,
    /// Resampler output scratch, playback side.
    src_buffer: Vec<f32>,
    /// Interleave / ring-copy scratch.
    fbuf: Vec<f32>,
    tee: FileTee,
    stats: PortStats,
}

impl CallbackPort<CpalDriver> {
    /// Creates a closed port over the system audio devices.
    pub fn new(settings: Arc<dyn SettingsSource>, device: DeviceSettings) -> Self {
        Self::with_driver(CpalDriver::new(), settings, device)
    }
}

impl<D: CallbackDriver> CallbackPort<D> {
    /// Creates a closed port over an explicit driver.
    pub fn with_driver(
        driver: D,
        settings: Arc<dyn SettingsSource>,
        device: DeviceSettings,
    ) -> Self {
        let quality = device.converter;
        Self {
            driver,
            settings,
            device,
            req_rate: 0.0,
            slots: [StreamSlot::new(), StreamSlot::new()],
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
            snd_buffer: vec![0.0; DEVICE_CHANNELS * SCRATCH_FRAMES],
            src_buffer: vec![0.0; DEVICE_CHANNELS * SCRATCH_FRAMES],
            fbuf: vec![0.0; DEVICE_CHANNELS * SCRATCH_FRAMES],
            tee: FileTee::new(),
            stats: PortStats::default(),
        }
    }

    /// Condition counters since the port was created.
    pub fn stats(&self) -> PortStats {
        self.stats
    }

    /// Current converter ratio for a direction (output/input frames).
    pub fn converter_ratio(&self, dir: Dir) -> f64 {
        self.converters[dir.index()].resampler.ratio()
    }

    /// Negotiated device rate for a direction; 0 before the first open.
    pub fn dev_sample_rate(&self, dir: Dir) -> f64 {
        self.slots[dir.index()].dev_rate
    }

    /// Frames currently queued in a direction's transfer ring.
    pub fn queued_frames(&self, dir: Dir) -> usize {
        self.slots[dir.index()]
            .shared
            .as_ref()
            .map_or(0, |s| s.ring.read_space() / DEVICE_CHANNELS)
    }

    /// Whether a direction's stream is running.
    pub fn is_active(&self, dir: Dir) -> bool {
        self.slots[dir.index()]
            .stream
            .as_ref()
            .is_some_and(DriverStream::is_active)
    }

    fn rate_setting(&self, dir: Dir) -> SampleRateSetting {
        match dir {
            Dir::Input => self.device.in_sample_rate,
            Dir::Output => self.device.out_sample_rate,
        }
    }

    fn driver_config(&self, dir: Dir) -> DriverConfig {
        DriverConfig {
            device_name: match dir {
                Dir::Input => self.device.input_device.clone(),
                Dir::Output => self.device.output_device.clone(),
            },
            rate_setting: self.rate_setting(dir),
            req_rate: self.req_rate as u32,
            frames_per_buffer: self.device.frames_per_buffer,
        }
    }

    fn live_ppm(&self, dir: Dir) -> i32 {
        match dir {
            Dir::Input => self.settings.rx_ppm(),
            Dir::Output => self.settings.tx_ppm(),
        }
    }

    fn ratio_for(dir: Dir, req_rate: f64, dev_rate: f64, ppm: i32) -> f64 {
        let corrected = dev_rate * (1.0 + f64::from(ppm) * 1e-6);
        match dir {
            Dir::Input => req_rate / corrected,
            Dir::Output => corrected / req_rate,
        }
    }

    /// Ring capacity in samples for one direction, derived from the rate
    /// ratio so a full resampled block always fits. Input gets twice the
    /// slack since the modem may poll late.
    fn ring_samples(dir: Dir, req_rate: f64, dev_rate: f64) -> usize {
        let hi = req_rate.max(dev_rate);
        let lo = req_rate.min(dev_rate).max(1.0);
        match dir {
            Dir::Input => {
                let base = (2.0 * DEVICE_CHANNELS as f64 * RING_BLOCK_FRAMES as f64 * hi / lo)
                    .ceil() as usize;
                2 * base.next_power_of_two().max(4096)
            }
            Dir::Output => {
                let base =
                    (DEVICE_CHANNELS as f64 * RING_BLOCK_FRAMES as f64 * hi / lo).ceil() as usize;
                let mut size = base.next_power_of_two();
                if req_rate > 8000.0 {
                    size *= 2;
                }
                size.max(2048)
            }
        }
    }

    /// Rebuilds a direction's converter from scratch: fresh streaming state,
    /// ratio retuned against the live ppm setting.
    fn rebuild_converter(&mut self, dir: Dir) {
        let ppm = self.live_ppm(dir);
        let ratio = Self::ratio_for(dir, self.req_rate, self.slots[dir.index()].dev_rate, ppm);
        let slot = &mut self.converters[dir.index()];
        slot.ppm = ppm;
        slot.resampler.set_ratio(ratio);
        slot.resampler.reset();
    }

    /// Folds a changed ppm setting into the ratio without touching the
    /// streaming state.
    fn retune(&mut self, dir: Dir) {
        let ppm = self.live_ppm(dir);
        if ppm != self.converters[dir.index()].ppm {
            let ratio = Self::ratio_for(dir, self.req_rate, self.slots[dir.index()].dev_rate, ppm);
            let slot = &mut self.converters[dir.index()];
            slot.ppm = ppm;
            slot.resampler.set_ratio(ratio);
            tracing::debug!("{dir:?} ppm now {ppm}, ratio {ratio:.9}");
        }
    }

    fn shared(&self, dir: Dir) -> Result<Arc<StreamShared>, SoundError> {
        self.slots[dir.index()]
            .shared
            .clone()
            .ok_or_else(|| SoundError::invalid_state(format!("{dir:?} stream not open")))
    }

    fn require_active(&self, dir: Dir) -> Result<(), SoundError> {
        if self.is_active(dir) {
            Ok(())
        } else {
            Err(SoundError::invalid_state(format!(
                "{dir:?} stream not running"
            )))
        }
    }

    /// Blocks until `predicate` holds, re-armed by `rw_sem` posts, for at
    /// most the data timeout for `frames`.
    fn wait_ring(
        shared: &StreamShared,
        dir: Dir,
        dev_rate: f64,
        frames: usize,
        predicate: impl Fn(&StreamShared) -> bool,
    ) -> Result<(), SoundError> {
        let timeout = Duration::from_secs_f64(
            (2.0 * DEVICE_CHANNELS as f64 * frames as f64 / dev_rate).max(1.0),
        );
        let deadline = Instant::now() + timeout;
        while !predicate(shared) {
            let now = Instant::now();
            if now >= deadline {
                return Err(SoundError::Timeout { dir, timeout });
            }
            shared.rw_sem.wait_timeout(deadline - now);
        }
        Ok(())
    }

    fn note_flags(&mut self, shared: &StreamShared) {
        let (overrun, underrun) = shared.take_flags();
        if overrun {
            self.stats.overruns += 1;
            tracing::warn!("capture ring overrun, oldest data kept");
        }
        if underrun {
            self.stats.underruns += 1;
            tracing::debug!("playback ring underrun, sent silence");
        }
    }

    fn open_dir(&mut self, dir: Dir, rate_changed: bool) -> Result<(), SoundError> {
        let setting = self.rate_setting(dir);
        // A modem-rate change forces a rebuild only under Auto negotiation,
        // and never when the host pins the device rate (JACK-style servers):
        // there the device rate cannot follow the modem anyway, so the
        // converter alone absorbs the change.
        let rebuild = !self.is_active(dir)
            || (rate_changed
                && !self.driver.rate_pinned(dir)
                && setting == SampleRateSetting::Auto);

        if !rebuild {
            if rate_changed {
                self.rebuild_converter(dir);
            }
            return Ok(());
        }

        self.close_dir(dir);

        let cfg = self.driver_config(dir);
        let dev_rate = self.driver.prepare(dir, &cfg)?;
        self.slots[dir.index()].dev_rate = dev_rate;
        self.rebuild_converter(dir);

        // ring_samples always returns a power of two, so an equal capacity
        // means the old ring can be re-armed instead of reallocated.
        let want = Self::ring_samples(dir, self.req_rate, dev_rate);
        let shared = match self.slots[dir.index()].shared.take() {
            Some(existing) if existing.ring.capacity() == want => {
                existing.rearm();
                existing
            }
            _ => Arc::new(StreamShared::new(want)),
        };
        // Discard wakeups left over from the previous incarnation, on both
        // semaphores.
        shared.rw_sem.drain();
        shared.ctl_sem.drain();

        match self.driver.start(dir, Arc::clone(&shared)) {
            Ok(stream) => {
                self.slots[dir.index()].stream = Some(stream);
                self.slots[dir.index()].shared = Some(shared);
                Ok(())
            }
            Err(err) => {
                // Tear down whatever the driver managed to build.
                self.slots[dir.index()].shared = Some(shared);
                self.close_dir(dir);
                Err(err)
            }
        }
    }

    fn close_dir(&mut self, dir: Dir) {
        let slot = &mut self.slots[dir.index()];
        if slot.stream.is_none() {
            return;
        }
        if self.is_active(dir) {
            if let Some(shared) = self.slots[dir.index()].shared.clone() {
                shared.set_state(StreamState::Complete);
                if !shared.ctl_sem.wait_timeout(CONTROL_TIMEOUT) {
                    tracing::warn!("{dir:?} stream wedged, tearing down anyway");
                }
                shared.set_state(StreamState::Continue);
            }
        }
        self.slots[dir.index()].stream = None;
    }

    fn abort_dir(&mut self, dir: Dir) {
        if let Some(shared) = &self.slots[dir.index()].shared {
            shared.set_state(StreamState::Abort);
        }
        if let Some(mut stream) = self.slots[dir.index()].stream.take() {
            stream.abort();
        }
        if let Some(shared) = &self.slots[dir.index()].shared {
            shared.set_state(StreamState::Continue);
        }
    }

    fn flush_dir(&mut self, dir: Dir) {
        if !self.is_active(dir) {
            return;
        }
        let Ok(shared) = self.shared(dir) else { return };
        shared.set_state(StreamState::Drain);
        if !shared.ctl_sem.wait_timeout(CONTROL_TIMEOUT) {
            tracing::warn!("timeout while draining {dir:?} stream");
        }
        shared.set_state(StreamState::Continue);
    }

    /// One bounded capture transfer of at most `maxframes` modem frames.
    fn read_block(&mut self, buf: &mut [f64]) -> Result<usize, SoundError> {
        let count = buf.len();
        if count == 0 {
            return Ok(0);
        }
        self.retune(Dir::Input);
        let shared = self.shared(Dir::Input)?;
        let dev_rate = self.slots[0].dev_rate;
        let ratio = self.converters[0].resampler.ratio();

        // Device frames needed to produce `count` modem frames.
        let ncount = ((count as f64 / ratio).floor() as usize).max(1);
        let need = DEVICE_CHANNELS * ncount;

        Self::wait_ring(&shared, Dir::Input, dev_rate, ncount, |s| {
            s.ring.read_space() >= need
        })?;
        self.note_flags(&shared);

        let resample = self.req_rate != dev_rate || self.converters[0].ppm != 0;
        let produced;
        if resample {
            let conv = &mut self.converters[0].resampler;
            let snd = &mut self.snd_buffer;
            let out_cap = DEVICE_CHANNELS * count;
            // Resample straight out of the ring when the readable region is
            // contiguous; fall back to one copy otherwise.
            let direct = shared.ring.with_read_slices(|a, _b| {
                if a.len() >= need {
                    Some(conv.process(&a[..need], &mut snd[..out_cap]))
                } else {
                    None
                }
            });
            let result = match direct {
                Some(result) => {
                    shared.ring.advance_read(need);
                    result
                }
                None => {
                    let tmp = &mut self.fbuf[..need];
                    shared.ring.read(tmp);
                    conv.process(tmp, &mut snd[..out_cap])
                }
            };
            produced = result.output_gen;
            deinterleave_first(&self.snd_buffer[..DEVICE_CHANNELS * produced], &mut buf[..produced]);
        } else {
            let direct = shared.ring.with_read_slices(|a, _b| {
                if a.len() >= need {
                    deinterleave_first(&a[..need], buf);
                    true
                } else {
                    false
                }
            });
            if direct {
                shared.ring.advance_read(need);
            } else {
                let tmp = &mut self.fbuf[..need];
                shared.ring.read(tmp);
                deinterleave_first(tmp, buf);
            }
            produced = count;
        }

        self.tee.tee_capture(&buf[..produced]);
        Ok(produced)
    }

    /// Pushes `count` interleaved frames already staged in `fbuf` (starting
    /// at frame `start`) through the converter and into the output ring.
    fn write_block(&mut self, start: usize, count: usize) -> Result<(), SoundError> {
        self.retune(Dir::Output);
        let shared = self.shared(Dir::Output)?;
        let dev_rate = self.slots[1].dev_rate;
        let ratio = self.converters[1].resampler.ratio();
        self.note_flags(&shared);

        let resample = self.req_rate != dev_rate || self.converters[1].ppm != 0;
        let mut staged = DEVICE_CHANNELS * count;
        let mut from_scratch = false;

        if resample {
            // One frame of headroom past the ceiling so the converter never
            // caps mid-block.
            let need_cap = DEVICE_CHANNELS * ((count as f64 * ratio).ceil() as usize + 1);
            let conv = &mut self.converters[1].resampler;
            let input = &self.fbuf[DEVICE_CHANNELS * start..DEVICE_CHANNELS * (start + count)];
            // Resample straight into the ring when the writable region is
            // contiguous and large enough.
            let direct = shared.ring.with_write_slices(|a, _b| {
                if a.len() >= need_cap {
                    Some(conv.process(input, a))
                } else {
                    None
                }
            });
            if let Some(result) = direct {
                shared.ring.advance_write(DEVICE_CHANNELS * result.output_gen);
                shared.rw_sem.post();
                return Ok(());
            }
            let result = conv.process(input, &mut self.src_buffer[..]);
            staged = DEVICE_CHANNELS * result.output_gen;
            from_scratch = true;
        }

        let frames = staged / DEVICE_CHANNELS;
        Self::wait_ring(&shared, Dir::Output, dev_rate, frames, |s| {
            s.ring.write_space() >= staged
        })?;
        let src = if from_scratch {
            &self.src_buffer[..staged]
        } else {
            &self.fbuf[DEVICE_CHANNELS * start..DEVICE_CHANNELS * start + staged]
        };
        shared.ring.write(src);
        Ok(())
    }

    /// Splits an interleaved write staged in `fbuf` so each block fits the
    /// ring with room to spare.
    fn resample_write(&mut self, count: usize) -> Result<(), SoundError> {
        let shared = self.shared(Dir::Output)?;
        let ratio = self.converters[1].resampler.ratio();
        let cap_frames = shared.ring.capacity() / DEVICE_CHANNELS;
        let maxframes = (((cap_frames as f64 / ratio).floor() as usize) / 2).max(1);

        let mut start = 0;
        while start < count {
            let n = (count - start).min(maxframes);
            self.write_block(start, n)?;
            start += n;
        }
        Ok(())
    }
}

impl<D: CallbackDriver> SoundIo for CallbackPort<D> {
    fn open(&mut self, mode: DirMask, freq: u32) -> Result<(), SoundError> {
        validate_modem_rate(freq)?;
        let rate_changed = self.req_rate != f64::from(freq);
        self.req_rate = f64::from(freq);
        self.tee.set_sample_rate(freq);

        for dir in Dir::BOTH {
            if mode.contains(dir) {
                self.open_dir(dir, rate_changed)?;
            }
        }
        Ok(())
    }

    fn close(&mut self, dirs: DirMask) {
        for dir in Dir::BOTH {
            if dirs.contains(dir) {
                self.close_dir(dir);
            }
        }
    }

    fn abort(&mut self, dirs: DirMask) {
        for dir in Dir::BOTH {
            if dirs.contains(dir) {
                self.abort_dir(dir);
            }
        }
    }

    fn flush(&mut self, dirs: DirMask) {
        for dir in Dir::BOTH {
            if dirs.contains(dir) {
                self.flush_dir(dir);
            }
        }
    }

    fn read_mono(&mut self, buf: &mut [f64]) -> Result<usize, SoundError> {
        if self.tee.is_playback() {
            return playback_read(&mut self.tee, self.settings.as_ref(), self.req_rate, buf);
        }
        self.require_active(Dir::Input)?;
        self.retune(Dir::Input);

        let shared = self.shared(Dir::Input)?;
        let ratio = self.converters[0].resampler.ratio();
        // Bounded by what the ring can yield per pass and what the scratch
        // buffers can hold.
        let maxframes = (((shared.ring.capacity() / DEVICE_CHANNELS) as f64 * ratio).floor()
            as usize)
            .clamp(1, SCRATCH_FRAMES);

        if buf.len() <= maxframes {
            return self.read_block(buf);
        }
        let mut total = 0;
        for chunk in buf.chunks_mut(maxframes) {
            total += self.read_block(chunk)?;
        }
        Ok(total)
    }

    fn write_mono(&mut self, buf: &[f64]) -> Result<usize, SoundError> {
        self.tee.tee_generate(buf);
        self.require_active(Dir::Output)?;

        for chunk in buf.chunks(SCRATCH_FRAMES) {
            interleave_dup(chunk, &mut self.fbuf[..DEVICE_CHANNELS * chunk.len()]);
            self.resample_write(chunk.len())?;
        }
        Ok(buf.len())
    }

    fn write_stereo(&mut self, left: &[f64], right: &[f64]) -> Result<usize, SoundError> {
        debug_assert_eq!(left.len(), right.len());
        self.tee.tee_generate(left);
        self.require_active(Dir::Output)?;

        let count = left.len().min(right.len());
        let mut start = 0;
        while start < count {
            let n = (count - start).min(SCRATCH_FRAMES);
            interleave_pair(
                &left[start..start + n],
                &right[start..start + n],
                &mut self.fbuf[..DEVICE_CHANNELS * n],
            );
            self.resample_write(n)?;
            start += n;
        }
        Ok(count)
    }

    fn must_close(&self) -> bool {
        false
    }

    fn tee_mut(&mut self) -> &mut FileTee {
        &mut self.tee
    }
}

impl<D: CallbackDriver> Drop for CallbackPort<D> {
    fn drop(&mut self) {
        self.close(DirMask::BOTH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback::LoopbackDriver;
    use crate::config::SharedSettings;

    fn loopback_port() -> (CallbackPort<LoopbackDriver>, Arc<SharedSettings>) {
        let settings = Arc::new(SharedSettings::new());
        let port = CallbackPort::with_driver(
            LoopbackDriver::new().with_block_frames(64),
            settings.clone(),
            DeviceSettings::default(),
        );
        (port, settings)
    }

    #[test]
    fn test_ring_sizing_identity_rates() {
        // Equal rates: input 2·max(ceil2(2·2·512), 4096), output max(ceil2(2·512), 2048).
        assert_eq!(
            CallbackPort::<LoopbackDriver>::ring_samples(Dir::Input, 8000.0, 8000.0),
            8192
        );
        assert_eq!(
            CallbackPort::<LoopbackDriver>::ring_samples(Dir::Output, 8000.0, 8000.0),
            2048
        );
        // Above 8 kHz the output ring doubles.
        assert_eq!(
            CallbackPort::<LoopbackDriver>::ring_samples(Dir::Output, 48000.0, 48000.0),
            2048
        );
    }

    #[test]
    fn test_ring_sizing_grows_with_rate_spread() {
        let near = CallbackPort::<LoopbackDriver>::ring_samples(Dir::Input, 48000.0, 48000.0);
        let wide = CallbackPort::<LoopbackDriver>::ring_samples(Dir::Input, 8000.0, 48000.0);
        assert!(wide > near);
    }

    #[test]
    fn test_ratio_formulas() {
        let rx = CallbackPort::<LoopbackDriver>::ratio_for(Dir::Input, 8000.0, 48000.0, 0);
        assert!((rx - 1.0 / 6.0).abs() < 1e-12);
        let tx = CallbackPort::<LoopbackDriver>::ratio_for(Dir::Output, 8000.0, 48000.0, 0);
        assert!((tx - 6.0).abs() < 1e-12);

        // Positive rx ppm slows the nominal device clock correction down:
        // ratio shrinks.
        let rx_ppm = CallbackPort::<LoopbackDriver>::ratio_for(Dir::Input, 8000.0, 48000.0, 100);
        assert!(rx_ppm < rx);
        let tx_ppm = CallbackPort::<LoopbackDriver>::ratio_for(Dir::Output, 8000.0, 48000.0, 100);
        assert!(tx_ppm > tx);
    }

    #[test]
    fn test_open_rejects_bad_rate() {
        let (mut port, _settings) = loopback_port();
        assert!(port.open(DirMask::BOTH, 44000).is_err());
    }

    #[test]
    fn test_open_close_lifecycle() {
        let (mut port, _settings) = loopback_port();
        assert!(!port.is_active(Dir::Input));

        port.open(DirMask::BOTH, 8000).unwrap();
        assert!(port.is_active(Dir::Input));
        assert!(port.is_active(Dir::Output));
        assert_eq!(port.dev_sample_rate(Dir::Input), 8000.0);

        port.close(DirMask::BOTH);
        assert!(!port.is_active(Dir::Input));
        assert!(!port.is_active(Dir::Output));
    }

    #[test]
    fn test_reopen_same_rate_keeps_stream() {
        let (mut port, _settings) = loopback_port();
        port.open(DirMask::OUTPUT, 8000).unwrap();
        port.open(DirMask::OUTPUT, 8000).unwrap();
        assert!(port.is_active(Dir::Output));
    }

    #[test]
    fn test_reopen_new_rate_retunes() {
        let (mut port, _settings) = loopback_port();
        port.open(DirMask::OUTPUT, 8000).unwrap();
        port.open(DirMask::OUTPUT, 48000).unwrap();
        assert_eq!(port.dev_sample_rate(Dir::Output), 48000.0);
        assert!((port.converter_ratio(Dir::Output) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pinned_rate_reopen_keeps_stream() {
        // A rate-pinning host keeps the stream across a modem-rate change;
        // only the converter ratio moves.
        let settings = Arc::new(SharedSettings::new());
        let mut port = CallbackPort::with_driver(
            LoopbackDriver::new()
                .with_block_frames(64)
                .with_native_rate(48000)
                .with_pinned_rate(),
            settings.clone(),
            DeviceSettings::default(),
        );
        port.open(DirMask::OUTPUT, 48000).unwrap();
        assert_eq!(port.dev_sample_rate(Dir::Output), 48000.0);

        port.open(DirMask::OUTPUT, 8000).unwrap();
        assert_eq!(
            port.dev_sample_rate(Dir::Output),
            48000.0,
            "pinned device rate must not follow the modem"
        );
        assert!(port.is_active(Dir::Output));
        assert!((port.converter_ratio(Dir::Output) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_read_write_require_open_stream() {
        let (mut port, _settings) = loopback_port();
        port.req_rate = 8000.0;
        let mut buf = [0.0f64; 16];
        assert!(matches!(
            port.read_mono(&mut buf),
            Err(SoundError::InvalidState { .. })
        ));
        assert!(matches!(
            port.write_mono(&[0.0; 16]),
            Err(SoundError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_ppm_retune_before_next_read() {
        let (mut port, settings) = loopback_port();
        port.open(DirMask::BOTH, 8000).unwrap();
        let flat = port.converter_ratio(Dir::Input);
        assert_eq!(flat, 1.0);

        settings.set_rx_ppm(200);
        let mut buf = [0.0f64; 64];
        port.read_mono(&mut buf).unwrap();
        let tuned = port.converter_ratio(Dir::Input);
        assert!(tuned < flat, "ratio must pick up the new ppm");
        assert!((tuned - 1.0 / (1.0 + 200e-6)).abs() < 1e-9);
    }

    #[test]
    fn test_abort_discards_queued_output() {
        let (mut port, _settings) = loopback_port();
        port.open(DirMask::OUTPUT, 8000).unwrap();
        port.write_mono(&[0.5; 256]).unwrap();
        port.abort(DirMask::OUTPUT);
        assert!(!port.is_active(Dir::Output));
    }
}
