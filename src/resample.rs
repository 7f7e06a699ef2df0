//! Streaming sample-rate conversion.
//!
//! The converter bridges the modem and device clock domains, including the
//! ppm drift correction folded into the ratio. It is a streaming linear
//! interpolator: state persists across calls (the final frame of each block
//! is carried so interpolation is seamless at block boundaries), and the
//! ratio may be retuned between calls without losing that state. Reset
//! happens only when a stream is (re)opened.

use crate::config::ConverterQuality;

/// Frame counts consumed and produced by one [`Resampler::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    /// Input frames consumed. Less than the frames offered only when the
    /// output buffer capacity was reached first; the caller then re-feeds
    /// the remainder.
    pub input_used: usize,
    /// Output frames generated.
    pub output_gen: usize,
}

/// Stateful streaming resampler over interleaved frames.
///
/// For any single call with ratio `r` over `n` consumed frames, the output
/// count differs from `r * n` by at most one frame; the fractional remainder
/// is carried into the next call rather than dropped.
pub struct Resampler {
    channels: usize,
    ratio: f64,
    quality: ConverterQuality,
    /// Last frame of the previously consumed input, used to interpolate
    /// output positions that fall between two blocks.
    prev: Vec<f32>,
    have_prev: bool,
    /// Source position of the next output frame, in input-frame units
    /// relative to the start of the next block. Negative values address
    /// into `prev`.
    next_pos: f64,
}

impl Resampler {
    /// Creates a converter for `channels`-wide interleaved frames at the
    /// given ratio (output rate / input rate).
    pub fn new(channels: usize, ratio: f64, quality: ConverterQuality) -> Self {
        assert!(channels > 0);
        assert!(ratio > 0.0, "resample ratio must be positive");
        Self {
            channels,
            ratio,
            quality,
            prev: vec![0.0; channels],
            have_prev: false,
            next_pos: 0.0,
        }
    }

    /// Current output/input ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Retunes the ratio. Streaming state is preserved; the new ratio takes
    /// effect from the next output frame.
    pub fn set_ratio(&mut self, ratio: f64) {
        assert!(ratio > 0.0, "resample ratio must be positive");
        self.ratio = ratio;
    }

    /// Discards carried state. Called when a stream is (re)opened, never
    /// between blocks.
    pub fn reset(&mut self) {
        self.have_prev = false;
        self.next_pos = 0.0;
    }

    /// Converts `input` into `output`, both interleaved at the converter's
    /// channel count.
    ///
    /// Generates as many output frames as the ratio allows without reading
    /// past the supplied input, stopping early if `output` fills up.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> ProcessResult {
        let ch = self.channels;
        debug_assert_eq!(input.len() % ch, 0);
        let n_in = input.len() / ch;
        let cap = output.len() / ch;
        let step = 1.0 / self.ratio;

        let mut pos = self.next_pos;
        let mut produced = 0usize;

        while produced < cap {
            if pos < 0.0 {
                if !self.have_prev {
                    pos = 0.0;
                    continue;
                }
                match self.quality {
                    ConverterQuality::ZeroOrderHold => {
                        output[produced * ch..(produced + 1) * ch].copy_from_slice(&self.prev);
                    }
                    ConverterQuality::Linear => {
                        if n_in == 0 {
                            break;
                        }
                        let frac = (pos + 1.0) as f32;
                        for c in 0..ch {
                            let a = self.prev[c];
                            let b = input[c];
                            output[produced * ch + c] = a + (b - a) * frac;
                        }
                    }
                }
            } else {
                let i = pos as usize;
                if i >= n_in {
                    break;
                }
                let frac = pos - i as f64;
                match self.quality {
                    ConverterQuality::ZeroOrderHold => {
                        output[produced * ch..(produced + 1) * ch]
                            .copy_from_slice(&input[i * ch..(i + 1) * ch]);
                    }
                    ConverterQuality::Linear => {
                        if frac > 0.0 && i + 1 >= n_in {
                            break;
                        }
                        if frac == 0.0 {
                            output[produced * ch..(produced + 1) * ch]
                                .copy_from_slice(&input[i * ch..(i + 1) * ch]);
                        } else {
                            let frac = frac as f32;
                            for c in 0..ch {
                                let a = input[i * ch + c];
                                let b = input[(i + 1) * ch + c];
                                output[produced * ch + c] = a + (b - a) * frac;
                            }
                        }
                    }
                }
            }
            produced += 1;
            pos += step;
        }

        // Output capacity may cut the call short; frames strictly behind the
        // cursor count as consumed, the rest are the caller's to re-feed.
        let input_used = if produced == cap {
            n_in.min(pos.max(0.0) as usize)
        } else {
            n_in
        };

        if input_used > 0 {
            self.prev
                .copy_from_slice(&input[(input_used - 1) * ch..input_used * ch]);
            self.have_prev = true;
        }
        self.next_pos = pos - input_used as f64;

        ProcessResult {
            input_used,
            output_gen: produced,
        }
    }
}
