//! No-device port.
//!
//! Used when the modem should run without touching any audio hardware:
//! reads deliver silence (or the playback file), writes are discarded, and
//! both sleep for the block's wall-clock duration so the modem's timing
//! matches a real device. The file tee works as usual, which makes this the
//! port of choice for file-only operation.

use std::sync::Arc;

use crate::backend::DirMask;
use crate::config::SettingsSource;
use crate::error::SoundError;
use crate::files::FileTee;
use crate::port::{pace_sleep, playback_read, validate_modem_rate, SoundIo};

/// A port that meters time instead of moving audio.
pub struct NullPort {
    settings: Arc<dyn SettingsSource>,
    req_rate: f64,
    tee: FileTee,
}

impl NullPort {
    /// Creates a closed null port.
    pub fn new(settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            settings,
            req_rate: 8000.0,
            tee: FileTee::new(),
        }
    }
}

impl SoundIo for NullPort {
    fn open(&mut self, _mode: DirMask, freq: u32) -> Result<(), SoundError> {
        validate_modem_rate(freq)?;
        self.req_rate = f64::from(freq);
        self.tee.set_sample_rate(freq);
        Ok(())
    }

    fn close(&mut self, _dirs: DirMask) {}

    fn abort(&mut self, _dirs: DirMask) {}

    fn flush(&mut self, _dirs: DirMask) {}

    fn read_mono(&mut self, buf: &mut [f64]) -> Result<usize, SoundError> {
        if self.tee.is_playback() {
            return playback_read(&mut self.tee, self.settings.as_ref(), self.req_rate, buf);
        }
        buf.fill(0.0);
        self.tee.tee_capture(buf);
        pace_sleep(buf.len(), self.req_rate);
        Ok(buf.len())
    }

    fn write_mono(&mut self, buf: &[f64]) -> Result<usize, SoundError> {
        self.tee.tee_generate(buf);
        pace_sleep(buf.len(), self.req_rate);
        Ok(buf.len())
    }

    fn write_stereo(&mut self, left: &[f64], _right: &[f64]) -> Result<usize, SoundError> {
        self.tee.tee_generate(left);
        pace_sleep(left.len(), self.req_rate);
        Ok(left.len())
    }

    fn must_close(&self) -> bool {
        false
    }

    fn tee_mut(&mut self) -> &mut FileTee {
        &mut self.tee
    }
}
