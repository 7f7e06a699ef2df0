//! In-process loopback driver.
//!
//! Emulates a full-duplex sound device without hardware: each started
//! stream runs a paced thread that invokes the shared callback protocol at
//! the device rate, and frames pulled from the playback ring are routed
//! back to the capture side over an internal wire. The duplex engine —
//! rings, semaphores, drain and close protocols, timeouts — runs exactly as
//! it would against a real device, which is what the integration tests
//! exercise.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backend::{
    process_input, process_output, CallbackDriver, CallbackFlow, Dir, DriverConfig, DriverStream,
    StreamShared,
};
use crate::config::SampleRateSetting;
use crate::error::SoundError;

/// Upper bound on buffered wire samples (a few seconds at 48 kHz stereo).
const WIRE_MAX_SAMPLES: usize = 1 << 20;

/// Consecutive empty-wire ticks before the capture side reverts to
/// delivering silence. A momentarily empty wire (scheduler jitter, the
/// modem thread busy reading) skips the tick instead, so silence is never
/// spliced into the middle of a transmitted stream.
const IDLE_TICKS: u32 = 8;

/// Samples in flight from the playback side to the capture side.
struct Wire {
    buf: Mutex<VecDeque<f32>>,
}

impl Wire {
    fn push(&self, samples: &[f32]) {
        let mut buf = self.buf.lock().unwrap();
        for &s in samples {
            if buf.len() >= WIRE_MAX_SAMPLES {
                buf.pop_front();
            }
            buf.push_back(s);
        }
    }

    fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut buf = self.buf.lock().unwrap();
        let n = out.len().min(buf.len());
        for s in &mut out[..n] {
            *s = buf.pop_front().unwrap_or(0.0);
        }
        n
    }
}

/// Loopback callback driver for tests and offline runs.
pub struct LoopbackDriver {
    wire: Arc<Wire>,
    native_rate: u32,
    block_frames: usize,
    negotiated: [f64; 2],
    paused: Arc<AtomicBool>,
    pinned_rate: bool,
}

impl LoopbackDriver {
    /// Creates a loopback device with a 48 kHz native rate and 256-frame
    /// callback blocks.
    pub fn new() -> Self {
        Self {
            wire: Arc::new(Wire {
                buf: Mutex::new(VecDeque::new()),
            }),
            native_rate: 48000,
            block_frames: 256,
            negotiated: [0.0, 0.0],
            paused: Arc::new(AtomicBool::new(false)),
            pinned_rate: false,
        }
    }

    /// Switch that freezes the emulated device clock: while set, callbacks
    /// stop firing and rings fill or starve just as with a stalled device.
    pub fn pause_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Overrides the rate reported as the device default.
    #[must_use]
    pub fn with_native_rate(mut self, rate: u32) -> Self {
        self.native_rate = rate;
        self
    }

    /// Overrides the callback block size.
    #[must_use]
    pub fn with_block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames.max(1);
        self
    }

    /// Emulates a JACK-style host that pins the device rate: negotiation
    /// always yields the native rate and reports the rate as pinned.
    #[must_use]
    pub fn with_pinned_rate(mut self) -> Self {
        self.pinned_rate = true;
        self
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// A paced loopback stream thread for one direction.
pub struct LoopbackStream {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
}

impl DriverStream for LoopbackStream {
    fn is_active(&self) -> bool {
        self.handle.is_some() && !self.shared.is_halted() && !self.stop.load(Ordering::Relaxed)
    }

    fn abort(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        self.abort();
    }
}

impl CallbackDriver for LoopbackDriver {
    type Stream = LoopbackStream;

    fn prepare(&mut self, dir: Dir, cfg: &DriverConfig) -> Result<f64, SoundError> {
        let rate = if self.pinned_rate {
            self.native_rate
        } else {
            match cfg.rate_setting {
                SampleRateSetting::Auto => cfg.req_rate,
                SampleRateSetting::Native => self.native_rate,
                SampleRateSetting::Hz(rate) => rate,
            }
        };
        self.negotiated[dir.index()] = f64::from(rate);
        Ok(f64::from(rate))
    }

    fn start(
        &mut self,
        dir: Dir,
        shared: Arc<StreamShared>,
    ) -> Result<Self::Stream, SoundError> {
        let rate = self.negotiated[dir.index()];
        if rate <= 0.0 {
            return Err(SoundError::invalid_state(format!(
                "{dir:?} stream not prepared"
            )));
        }
        let block = self.block_frames;
        let period = Duration::from_secs_f64(block as f64 / rate);
        let stop = Arc::new(AtomicBool::new(false));
        let wire = Arc::clone(&self.wire);
        let paused = Arc::clone(&self.paused);

        let thread_stop = Arc::clone(&stop);
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            let mut buf = vec![0.0f32; 2 * block];
            let mut next = Instant::now() + period;
            // Start idle so a capture-only stream sees silence at once.
            let mut empty_ticks = IDLE_TICKS;
            while !thread_stop.load(Ordering::Relaxed) && !thread_shared.is_halted() {
                let now = Instant::now();
                if now < next {
                    std::thread::sleep(next - now);
                }
                next += period;
                if paused.load(Ordering::Relaxed) {
                    continue;
                }

                match dir {
                    Dir::Input => {
                        let got = wire.pop_into(&mut buf);
                        let feed = if got > 0 {
                            empty_ticks = 0;
                            &buf[..got]
                        } else {
                            empty_ticks += 1;
                            if empty_ticks < IDLE_TICKS {
                                continue;
                            }
                            // Idle device: full blocks of silence.
                            buf.fill(0.0);
                            &buf[..]
                        };
                        if let CallbackFlow::Halt(_) = process_input(&thread_shared, feed) {
                            thread_shared.mark_halted();
                        }
                    }
                    Dir::Output => {
                        let (flow, got) = process_output(&thread_shared, &mut buf);
                        // Forward only real frames so the capture side sees
                        // the exact transmitted stream.
                        wire.push(&buf[..got]);
                        if let CallbackFlow::Halt(_) = flow {
                            thread_shared.mark_halted();
                        }
                    }
                }
            }
        });

        Ok(LoopbackStream {
            stop,
            handle: Some(handle),
            shared,
        })
    }

    fn rate_pinned(&self, _dir: Dir) -> bool {
        self.pinned_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StreamState;

    fn config(req_rate: u32) -> DriverConfig {
        DriverConfig {
            device_name: None,
            rate_setting: SampleRateSetting::Auto,
            req_rate,
            frames_per_buffer: 0,
        }
    }

    #[test]
    fn test_negotiates_requested_rate_under_auto() {
        let mut driver = LoopbackDriver::new();
        assert_eq!(driver.prepare(Dir::Input, &config(8000)).unwrap(), 8000.0);
    }

    #[test]
    fn test_native_setting_uses_device_default() {
        let mut driver = LoopbackDriver::new().with_native_rate(44100);
        let cfg = DriverConfig {
            rate_setting: SampleRateSetting::Native,
            ..config(8000)
        };
        assert_eq!(driver.prepare(Dir::Output, &cfg).unwrap(), 44100.0);
    }

    #[test]
    fn test_output_stream_drains_ring() {
        let mut driver = LoopbackDriver::new().with_block_frames(64);
        driver.prepare(Dir::Output, &config(8000)).unwrap();

        let shared = Arc::new(StreamShared::new(4096));
        shared.ring.write(&[0.5f32; 1024]);
        let mut stream = driver.start(Dir::Output, Arc::clone(&shared)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while shared.ring.read_space() > 0 {
            assert!(Instant::now() < deadline, "ring did not drain");
            std::thread::sleep(Duration::from_millis(5));
        }
        stream.abort();
    }

    #[test]
    fn test_written_frames_loop_back_to_input() {
        let mut driver = LoopbackDriver::new().with_block_frames(64);
        driver.prepare(Dir::Input, &config(8000)).unwrap();
        driver.prepare(Dir::Output, &config(8000)).unwrap();

        let in_shared = Arc::new(StreamShared::new(1 << 15));
        let out_shared = Arc::new(StreamShared::new(1 << 15));
        out_shared.ring.write(&[0.25f32; 512]);

        let mut out_stream = driver.start(Dir::Output, Arc::clone(&out_shared)).unwrap();
        let mut in_stream = driver.start(Dir::Input, Arc::clone(&in_shared)).unwrap();

        // Wait until the transmitted frames appear on the capture side.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while seen.iter().filter(|&&s| s == 0.25f32).count() < 512 {
            assert!(Instant::now() < deadline, "loopback did not deliver");
            let mut buf = [0.0f32; 256];
            let n = in_shared.ring.read(&mut buf);
            seen.extend_from_slice(&buf[..n]);
            std::thread::sleep(Duration::from_millis(5));
        }

        out_stream.abort();
        in_stream.abort();
    }

    #[test]
    fn test_complete_halts_and_posts_control() {
        let mut driver = LoopbackDriver::new().with_block_frames(64);
        driver.prepare(Dir::Output, &config(8000)).unwrap();

        let shared = Arc::new(StreamShared::new(4096));
        shared.ring.write(&[0.5f32; 256]);
        let stream = driver.start(Dir::Output, Arc::clone(&shared)).unwrap();

        shared.set_state(StreamState::Complete);
        assert!(
            shared.ctl_sem.wait_timeout(Duration::from_secs(2)),
            "no stop acknowledgement"
        );
        assert!(shared.is_halted());
        assert!(!stream.is_active());
    }
}
