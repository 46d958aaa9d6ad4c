//! Phase-difference FM discriminator.

use num_complex::Complex32;

/// FM demodulator with phase memory across blocks.
///
/// Output per sample is `gain * arg(sample * conj(previous))`, the phase
/// advance in radians since the previous sample.
#[derive(Debug, Clone)]
pub struct FmDemodulator {
    previous: Complex32,
    gain: f32,
}

impl Default for FmDemodulator {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl FmDemodulator {
    /// Demodulator scaling its output by `gain`.
    pub fn new(gain: f32) -> Self {
        Self {
            previous: Complex32::new(1.0, 0.0),
            gain,
        }
    }

    /// Output scale factor.
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Demodulate one block.
    pub fn process(&mut self, samples: &[Complex32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(samples.len());
        for &sample in samples {
            out.push((sample * self.previous.conj()).arg() * self.gain);
            self.previous = sample;
        }
        out
    }

    /// Forget the phase of the last sample seen.
    pub fn reset(&mut self) {
        self.previous = Complex32::new(1.0, 0.0);
    }
}
