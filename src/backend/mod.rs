//! Backend drivers and the realtime callback protocol.
//!
//! A callback driver owns the OS audio streams and invokes
//! [`process_input`]/[`process_output`] from its realtime thread; everything
//! those functions touch ([`StreamShared`]) is lock-free or non-blocking.
//! The same protocol drives both the cpal device driver and the loopback
//! test driver, so the hard path is exercised without audio hardware.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::SampleRateSetting;
use crate::error::SoundError;
use crate::ring::RingBuffer;
use crate::sync::Semaphore;

pub mod cpal_driver;
pub mod loopback;

/// Transfer direction, device-relative: `Input` is capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    /// Device to modem.
    Input,
    /// Modem to device.
    Output,
}

impl Dir {
    /// Both directions, input first.
    pub const BOTH: [Dir; 2] = [Dir::Input, Dir::Output];

    /// Slot index: input is 0, output is 1.
    pub fn index(self) -> usize {
        match self {
            Dir::Input => 0,
            Dir::Output => 1,
        }
    }
}

/// A set of directions, used for open modes and close/abort/flush selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirMask(u8);

impl DirMask {
    /// The empty set.
    pub const NONE: DirMask = DirMask(0);
    /// Capture only.
    pub const INPUT: DirMask = DirMask(1);
    /// Playback only.
    pub const OUTPUT: DirMask = DirMask(2);
    /// Full duplex.
    pub const BOTH: DirMask = DirMask(3);

    /// Whether `dir` is in the set.
    pub fn contains(self, dir: Dir) -> bool {
        self.0 & (1 << dir.index()) != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two sets.
    #[must_use]
    pub fn union(self, other: DirMask) -> DirMask {
        DirMask(self.0 | other.0)
    }
}

impl From<Dir> for DirMask {
    fn from(dir: Dir) -> Self {
        match dir {
            Dir::Input => DirMask::INPUT,
            Dir::Output => DirMask::OUTPUT,
        }
    }
}

/// Callback-visible stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Normal streaming.
    Continue = 0,
    /// Finish queued output, then stop.
    Complete = 1,
    /// Stop immediately, discarding queued frames.
    Abort = 2,
    /// Finish queued output, then resume normal streaming.
    Drain = 3,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Complete,
            2 => Self::Abort,
            3 => Self::Drain,
            _ => Self::Continue,
        }
    }
}

/// What the driver should do after a callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    /// Keep the stream running.
    Continue,
    /// Halt the stream; the terminal state says whether queued frames were
    /// honoured (`Complete`) or discarded (`Abort`).
    Halt(StreamState),
}

/// State shared between a port, its driver, and the realtime callback.
///
/// One per open direction. The ring is SPSC between the callback and the
/// modem thread; the semaphores carry the wakeups (`rw_sem` for ring
/// occupancy changes, `ctl_sem` for stop/drain acknowledgements).
pub struct StreamShared {
    /// Interleaved 2-channel transfer ring.
    pub ring: RingBuffer,
    /// Posted whenever ring occupancy changes in the waiting side's favour.
    pub rw_sem: Semaphore,
    /// Posted on stop and on drain completion.
    pub ctl_sem: Semaphore,
    state: AtomicU8,
    overrun: AtomicBool,
    underrun: AtomicBool,
    halted: AtomicBool,
}

impl StreamShared {
    /// Creates shared state with a ring of at least `ring_capacity` samples.
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(ring_capacity),
            rw_sem: Semaphore::new(),
            ctl_sem: Semaphore::new(),
            state: AtomicU8::new(StreamState::Continue as u8),
            overrun: AtomicBool::new(false),
            underrun: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    /// Current stream state.
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions the stream state.
    pub fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the callback dropped capture samples because the ring was
    /// full (the modem thread fell behind).
    pub fn overrun(&self) -> bool {
        self.overrun.load(Ordering::Relaxed)
    }

    /// Whether the callback zero-filled playback frames because the ring ran
    /// dry.
    pub fn underrun(&self) -> bool {
        self.underrun.load(Ordering::Relaxed)
    }

    /// Clears both condition flags, returning (overrun, underrun).
    pub fn take_flags(&self) -> (bool, bool) {
        (
            self.overrun.swap(false, Ordering::Relaxed),
            self.underrun.swap(false, Ordering::Relaxed),
        )
    }

    /// Whether the stream has reached a terminal state and performed its
    /// stop duties.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Performs the stop duties exactly once: empty the ring and post the
    /// control semaphore for whoever is waiting in close().
    pub fn mark_halted(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            self.ring.reset();
            self.ctl_sem.post();
        }
    }

    /// Returns a stopped shared state to service: streaming state, condition
    /// flags, halt latch and ring all cleared. Only legal while no stream is
    /// attached.
    pub fn rearm(&self) {
        self.set_state(StreamState::Continue);
        self.overrun.store(false, Ordering::Relaxed);
        self.underrun.store(false, Ordering::Relaxed);
        self.halted.store(false, Ordering::Release);
        self.ring.reset();
    }
}

/// Capture-side callback step: ingest `data` (interleaved 2-channel frames)
/// into the ring.
///
/// Realtime-safe: no blocking, no allocation, no logging. A full ring drops
/// the overflow and raises the overrun flag; the oldest data stays intact so
/// a late reader still sees frames in order.
pub fn process_input(shared: &StreamShared, data: &[f32]) -> CallbackFlow {
    let state = shared.state();
    if state == StreamState::Continue {
        let written = shared.ring.write(data);
        if written < data.len() {
            shared.overrun.store(true, Ordering::Relaxed);
        }
        shared.rw_sem.post();
        return CallbackFlow::Continue;
    }
    if state == StreamState::Drain {
        // Nothing to drain on the capture side; acknowledge at once.
        shared.ctl_sem.post();
        return CallbackFlow::Continue;
    }
    CallbackFlow::Halt(state)
}

/// Playback-side callback step: fill `out` (interleaved 2-channel frames)
/// from the ring, zero-filling any shortfall.
///
/// Queued output is still honoured after `Complete`; only `Abort` discards.
/// Returns the flow decision and how many samples came from the ring.
pub fn process_output(shared: &StreamShared, out: &mut [f32]) -> (CallbackFlow, usize) {
    let state = shared.state();
    if state == StreamState::Abort {
        return (CallbackFlow::Halt(StreamState::Abort), 0);
    }

    let got = shared.ring.read(out);
    if got < out.len() {
        out[got..].fill(0.0);
        if state == StreamState::Continue {
            shared.underrun.store(true, Ordering::Relaxed);
        }
    }
    if got > 0 {
        shared.rw_sem.post();
    }

    if state == StreamState::Continue || shared.ring.read_space() > 0 {
        return (CallbackFlow::Continue, got);
    }

    // Ring is empty and the state asks for something other than streaming.
    if state == StreamState::Drain {
        shared.set_state(StreamState::Continue);
        shared.ctl_sem.post();
        return (CallbackFlow::Continue, got);
    }

    (CallbackFlow::Halt(state), got)
}

/// Open-time parameters handed to a driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Device name, or `None` for the system default.
    pub device_name: Option<String>,
    /// Sample-rate policy for this direction.
    pub rate_setting: SampleRateSetting,
    /// The modem rate, tried first under `Auto`.
    pub req_rate: u32,
    /// Requested callback block size in frames; 0 lets the backend choose.
    pub frames_per_buffer: u32,
}

/// A started per-direction stream owned by a driver.
pub trait DriverStream {
    /// Whether the stream is still delivering callbacks.
    fn is_active(&self) -> bool;
    /// Stops the stream immediately, discarding in-flight frames.
    fn abort(&mut self);
}

/// A callback-style backend: selects devices, negotiates rates, and runs
/// the realtime callback protocol against a [`StreamShared`].
pub trait CallbackDriver {
    /// The per-direction stream handle type.
    type Stream: DriverStream;

    /// Selects the device for `dir` and negotiates its sample rate.
    /// No audio flows yet.
    fn prepare(&mut self, dir: Dir, cfg: &DriverConfig) -> Result<f64, SoundError>;

    /// Opens and starts the stream prepared by the last
    /// [`prepare`](Self::prepare) call for `dir`.
    fn start(&mut self, dir: Dir, shared: Arc<StreamShared>)
        -> Result<Self::Stream, SoundError>;

    /// Whether the host pins the device rate regardless of what is
    /// requested (JACK-style sound servers). A pinned rate means a change
    /// of the modem rate never warrants a stream rebuild; only the
    /// converter retunes.
    fn rate_pinned(&self, _dir: Dir) -> bool {
        false
    }
}
