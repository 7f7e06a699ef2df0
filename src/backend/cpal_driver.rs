//! Device-backed callback driver over cpal.
//!
//! One cpal stream per open direction, always 2-channel f32 at the
//! negotiated device rate. The data callbacks delegate to the shared
//! protocol in [`crate::backend`]; the error callback only logs.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};

use crate::backend::{
    process_input, process_output, CallbackDriver, CallbackFlow, Dir, DriverConfig, DriverStream,
    StreamShared,
};
use crate::config::{SampleRateSetting, DEVICE_CHANNELS};
use crate::error::SoundError;

/// Callback driver over the system's default cpal host.
pub struct CpalDriver {
    host: cpal::Host,
    prepared: [Option<Prepared>; 2],
}

struct Prepared {
    device: cpal::Device,
    config: StreamConfig,
}

/// A running cpal stream for one direction.
///
/// The stream runs until aborted or dropped; after the callback reaches a
/// terminal state it idles (zero-filling output) until the handle goes away.
pub struct CpalStream {
    inner: Option<cpal::Stream>,
    shared: Arc<StreamShared>,
}

impl DriverStream for CpalStream {
    fn is_active(&self) -> bool {
        self.inner.is_some() && !self.shared.is_halted()
    }

    fn abort(&mut self) {
        self.inner.take();
    }
}

impl CpalDriver {
    /// Creates a driver on the default host.
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            prepared: [None, None],
        }
    }

    fn select_device(&self, dir: Dir, cfg: &DriverConfig) -> Result<cpal::Device, SoundError> {
        if let Some(wanted) = &cfg.device_name {
            let devices = match dir {
                Dir::Input => self.host.input_devices(),
                Dir::Output => self.host.output_devices(),
            }
            .map_err(SoundError::backend)?;
            for device in devices {
                if device.name().map(|n| &n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
            tracing::warn!("device \"{wanted}\" not found, using default {dir:?} device");
        }
        let fallback = match dir {
            Dir::Input => self.host.default_input_device(),
            Dir::Output => self.host.default_output_device(),
        };
        fallback.ok_or_else(|| SoundError::DeviceUnavailable {
            name: cfg.device_name.clone().unwrap_or_else(|| "default".into()),
        })
    }

    fn rate_is_supported(device: &cpal::Device, dir: Dir, rate: u32) -> bool {
        let check = |channels: u16, format: SampleFormat, min: SampleRate, max: SampleRate| {
            usize::from(channels) == DEVICE_CHANNELS
                && format == SampleFormat::F32
                && min.0 <= rate
                && rate <= max.0
        };
        match dir {
            Dir::Input => device.supported_input_configs().map_or(false, |mut it| {
                it.any(|r| check(r.channels(), r.sample_format(), r.min_sample_rate(), r.max_sample_rate()))
            }),
            Dir::Output => device.supported_output_configs().map_or(false, |mut it| {
                it.any(|r| check(r.channels(), r.sample_format(), r.min_sample_rate(), r.max_sample_rate()))
            }),
        }
    }

    fn default_rate(device: &cpal::Device, dir: Dir) -> Result<u32, SoundError> {
        let config = match dir {
            Dir::Input => device.default_input_config(),
            Dir::Output => device.default_output_config(),
        }
        .map_err(SoundError::backend)?;
        Ok(config.sample_rate().0)
    }

    /// Picks the device rate: the modem rate if the device takes it, the
    /// device default otherwise. Explicit user settings skip the probe.
    fn negotiate_rate(
        device: &cpal::Device,
        dir: Dir,
        cfg: &DriverConfig,
    ) -> Result<u32, SoundError> {
        match cfg.rate_setting {
            SampleRateSetting::Native => Self::default_rate(device, dir),
            SampleRateSetting::Hz(rate) => Ok(rate),
            SampleRateSetting::Auto => {
                if Self::rate_is_supported(device, dir, cfg.req_rate) {
                    return Ok(cfg.req_rate);
                }
                let default = Self::default_rate(device, dir)?;
                if Self::rate_is_supported(device, dir, default) {
                    tracing::debug!(
                        "{dir:?}: {} Hz unsupported, falling back to {default} Hz",
                        cfg.req_rate
                    );
                    return Ok(default);
                }
                Err(SoundError::UnsupportedSampleRate {
                    dir,
                    requested: cfg.req_rate,
                })
            }
        }
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackDriver for CpalDriver {
    type Stream = CpalStream;

    fn prepare(&mut self, dir: Dir, cfg: &DriverConfig) -> Result<f64, SoundError> {
        let device = self.select_device(dir, cfg)?;
        let dev_rate = Self::negotiate_rate(&device, dir, cfg)?;

        let buffer_size = if cfg.frames_per_buffer > 0 {
            BufferSize::Fixed(cfg.frames_per_buffer)
        } else {
            BufferSize::Default
        };
        let config = StreamConfig {
            channels: DEVICE_CHANNELS as u16,
            sample_rate: SampleRate(dev_rate),
            buffer_size,
        };

        tracing::debug!(
            "{dir:?}: using \"{}\" at {dev_rate} Hz",
            device.name().unwrap_or_else(|_| "<unnamed>".into())
        );

        self.prepared[dir.index()] = Some(Prepared { device, config });
        Ok(f64::from(dev_rate))
    }

    fn start(
        &mut self,
        dir: Dir,
        shared: Arc<StreamShared>,
    ) -> Result<Self::Stream, SoundError> {
        let prepared = self.prepared[dir.index()]
            .take()
            .ok_or_else(|| SoundError::invalid_state(format!("{dir:?} stream not prepared")))?;

        let stream = match dir {
            Dir::Input => {
                let cb_shared = Arc::clone(&shared);
                prepared
                    .device
                    .build_input_stream(
                        &prepared.config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if cb_shared.is_halted() {
                                return;
                            }
                            if let CallbackFlow::Halt(_) = process_input(&cb_shared, data) {
                                cb_shared.mark_halted();
                            }
                        },
                        |err| tracing::error!("capture stream error: {err}"),
                        None,
                    )
                    .map_err(SoundError::backend)?
            }
            Dir::Output => {
                let cb_shared = Arc::clone(&shared);
                prepared
                    .device
                    .build_output_stream(
                        &prepared.config,
                        move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            if cb_shared.is_halted() {
                                out.fill(0.0);
                                return;
                            }
                            if let (CallbackFlow::Halt(_), _) = process_output(&cb_shared, out) {
                                cb_shared.mark_halted();
                            }
                        },
                        |err| tracing::error!("playback stream error: {err}"),
                        None,
                    )
                    .map_err(SoundError::backend)?
            }
        };

        stream.play().map_err(SoundError::backend)?;
        Ok(CpalStream {
            inner: Some(stream),
            shared,
        })
    }

    fn rate_pinned(&self, _dir: Dir) -> bool {
        // The JACK server owns the sample rate; streams run at it no
        // matter what was asked for, so a modem-rate change never needs a
        // stream rebuild there.
        self.host.id().name().eq_ignore_ascii_case("jack")
    }
}
