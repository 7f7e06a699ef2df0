//! Configuration types and load-bearing constants.
//!
//! Two kinds of settings exist with different freshness requirements:
//!
//! - [`DeviceSettings`] is a snapshot consumed once when a port is opened
//!   (device names, sample-rate policy, callback block size, converter
//!   quality).
//! - [`SettingsSource`] is consulted on every transfer for the values an
//!   operator may change while a stream runs (ppm drift correction, receive
//!   mixer). [`SharedSettings`] is the provided lock-free implementation.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

/// Device-side channel count. Capture ignores the right channel; playback
/// duplicates the left channel unless stereo data is written explicitly.
pub const DEVICE_CHANNELS: usize = 2;

/// Sizing unit for the transfer rings, in frames.
pub const RING_BLOCK_FRAMES: usize = 512;

/// Length of the per-port scratch buffers, in frames.
pub const SCRATCH_FRAMES: usize = 65536;

/// Full-scale value used when converting to 16-bit PCM. Slightly under
/// `i16::MAX` to leave headroom for resampler overshoot.
pub const PCM16_SCALE: f64 = 32000.0;

/// Bound on close/flush waits for the stop or drain acknowledgement.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Modem sample rates a port can be opened at.
pub const MODEM_RATES: [u32; 7] = [8000, 11025, 16000, 22050, 44100, 48000, 96000];

/// Per-direction sample-rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleRateSetting {
    /// Try the modem rate first, fall back to the device default.
    #[default]
    Auto,
    /// Use the device's default rate unconditionally.
    Native,
    /// Use this rate unconditionally.
    Hz(u32),
}

/// Quality setting for the streaming sample-rate converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConverterQuality {
    /// Linear interpolation between neighbouring frames.
    #[default]
    Linear,
    /// Zero-order hold: repeat the most recent frame.
    ZeroOrderHold,
}

/// Open-time device configuration.
///
/// Captured once by `open()`; changing these afterwards requires reopening
/// the port.
#[derive(Debug, Clone, Default)]
pub struct DeviceSettings {
    /// Capture device name, or `None` for the system default.
    pub input_device: Option<String>,
    /// Playback device name, or `None` for the system default.
    pub output_device: Option<String>,
    /// Sample-rate policy for the capture direction.
    pub in_sample_rate: SampleRateSetting,
    /// Sample-rate policy for the playback direction.
    pub out_sample_rate: SampleRateSetting,
    /// Requested callback block size in frames; 0 lets the backend choose.
    pub frames_per_buffer: u32,
    /// Resampler quality.
    pub converter: ConverterQuality,
    /// Optional sound-server address (used by networked blocking
    /// transports).
    pub server: Option<String>,
}

/// Live settings consulted once per data-path call.
pub trait SettingsSource: Send + Sync {
    /// Capture-side clock correction in parts per million.
    fn rx_ppm(&self) -> i32;
    /// Playback-side clock correction in parts per million.
    fn tx_ppm(&self) -> i32;
    /// Receive-volume scale applied to file playback.
    fn rx_volume(&self) -> f32;
    /// Whether the receive mixer scale is applied at all.
    fn mixer_enabled(&self) -> bool;
}

/// Atomic [`SettingsSource`] that can be shared with a control thread or UI.
#[derive(Debug)]
pub struct SharedSettings {
    rx_ppm: AtomicI32,
    tx_ppm: AtomicI32,
    rx_volume_bits: AtomicU32,
    mixer_enabled: AtomicBool,
}

impl SharedSettings {
    /// Creates settings with zero ppm correction and the mixer disabled.
    pub fn new() -> Self {
        Self {
            rx_ppm: AtomicI32::new(0),
            tx_ppm: AtomicI32::new(0),
            rx_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            mixer_enabled: AtomicBool::new(false),
        }
    }

    /// Updates the capture-side ppm correction.
    pub fn set_rx_ppm(&self, ppm: i32) {
        self.rx_ppm.store(ppm, Ordering::Relaxed);
    }

    /// Updates the playback-side ppm correction.
    pub fn set_tx_ppm(&self, ppm: i32) {
        self.tx_ppm.store(ppm, Ordering::Relaxed);
    }

    /// Updates the receive-volume scale.
    pub fn set_rx_volume(&self, volume: f32) {
        self.rx_volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Enables or disables the receive mixer.
    pub fn set_mixer_enabled(&self, enabled: bool) {
        self.mixer_enabled.store(enabled, Ordering::Relaxed);
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsSource for SharedSettings {
    fn rx_ppm(&self) -> i32 {
        self.rx_ppm.load(Ordering::Relaxed)
    }

    fn tx_ppm(&self) -> i32 {
        self.tx_ppm.load(Ordering::Relaxed)
    }

    fn rx_volume(&self) -> f32 {
        f32::from_bits(self.rx_volume_bits.load(Ordering::Relaxed))
    }

    fn mixer_enabled(&self) -> bool {
        self.mixer_enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_setting_default_is_auto() {
        assert_eq!(SampleRateSetting::default(), SampleRateSetting::Auto);
    }

    #[test]
    fn test_shared_settings_defaults() {
        let s = SharedSettings::new();
        assert_eq!(s.rx_ppm(), 0);
        assert_eq!(s.tx_ppm(), 0);
        assert_eq!(s.rx_volume(), 1.0);
        assert!(!s.mixer_enabled());
    }

    #[test]
    fn test_shared_settings_updates_visible() {
        let s = SharedSettings::new();
        s.set_rx_ppm(-150);
        s.set_tx_ppm(75);
        s.set_rx_volume(0.5);
        s.set_mixer_enabled(true);
        assert_eq!(s.rx_ppm(), -150);
        assert_eq!(s.tx_ppm(), 75);
        assert_eq!(s.rx_volume(), 0.5);
        assert!(s.mixer_enabled());
    }

    #[test]
    fn test_device_settings_default() {
        let d = DeviceSettings::default();
        assert!(d.input_device.is_none());
        assert_eq!(d.in_sample_rate, SampleRateSetting::Auto);
        assert_eq!(d.frames_per_buffer, 0);
        assert_eq!(d.converter, ConverterQuality::Linear);
    }
}
