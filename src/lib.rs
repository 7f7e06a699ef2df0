//! # modem-audio
//!
//! Real-time full-duplex audio I/O for soft-modem DSP loops.
//!
//! `modem-audio` sits between a modem that produces and consumes mono
//! floating-point sample blocks at its own rate, and host audio backends
//! that deal in interleaved stereo frames at device rates. It bridges the
//! two clock domains with bounded latency, absorbs the mismatch between the
//! modem's blocking call pattern and the backend's realtime callbacks, and
//! applies a live ppm clock-drift correction in both directions.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use modem_audio::{CallbackPort, DeviceSettings, DirMask, SharedSettings, SoundIo};
//!
//! let settings = Arc::new(SharedSettings::new());
//! let mut port = CallbackPort::new(settings.clone(), DeviceSettings::default());
//! port.open(DirMask::BOTH, 8000)?;
//!
//! let mut rx = vec![0.0f64; 512];
//! let got = port.read_mono(&mut rx)?;      // capture, resampled to 8 kHz
//! port.write_mono(&rx[..got])?;            // playback
//!
//! port.close(DirMask::BOTH);
//! # Ok::<(), modem_audio::SoundError>(())
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Realtime callback**: never blocks, never allocates, never touches
//!   files; moves frames between the device and a lock-free SPSC ring.
//! - **Ring + semaphores**: one transfer ring and two counting semaphores
//!   per direction; every modem-side wait carries a finite timeout.
//! - **Modem thread**: resampling, channel fan-in/fan-out, drift retuning
//!   and the optional file tee all run here, in `read_mono`/`write_mono`.
//!
//! Three port flavours share the same [`SoundIo`] surface: the callback
//! engine over cpal ([`CallbackPort`]), a synchronous blocking archetype
//! ([`BlockingPort`]), and a no-device pacer ([`NullPort`]) for file-only
//! runs. A loopback driver stands in for hardware in tests.

#![warn(missing_docs)]
// Audio code moves between f64 modem blocks, f32 device frames and integer
// PCM; the casts are intentional.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

mod config;
mod error;
mod files;
mod resample;
mod ring;
mod sync;

pub mod backend;
pub mod port;

pub use backend::loopback::LoopbackDriver;
pub use backend::{Dir, DirMask, StreamState};
pub use config::{
    ConverterQuality, DeviceSettings, SampleRateSetting, SettingsSource, SharedSettings,
    CONTROL_TIMEOUT, DEVICE_CHANNELS, MODEM_RATES, PCM16_SCALE, RING_BLOCK_FRAMES,
    SCRATCH_FRAMES,
};
pub use error::SoundError;
pub use files::{FileFormat, FileTags, FileTee};
pub use port::blocking::{BlockingIo, BlockingPort, LoopbackIo};
pub use port::callback::{CallbackPort, PortStats};
pub use port::null::NullPort;
pub use port::SoundIo;
pub use resample::{ProcessResult, Resampler};
pub use ring::RingBuffer;
pub use sync::Semaphore;

/// The callback port in its production configuration.
pub type CpalPort = CallbackPort<backend::cpal_driver::CpalDriver>;
