//! Low-pass FIR design and a streaming complex FIR filter.
//!
//! # Example
//!
//! ```
//! use sdr_stream::demod::filter::{low_pass, ComplexFirFilter};
//! use num_complex::Complex32;
//!
//! // 5 kHz pass band, 7 kHz stop band at 48 kHz, 60 dB down
//! let taps = low_pass(48_000.0, 5_000.0, 7_000.0, 60.0)?;
//! assert_eq!(taps.len() % 2, 1);
//!
//! let mut filter = ComplexFirFilter::new(taps, 1.0)?;
//! let out = filter.process(&[Complex32::new(1.0, 0.0); 32]);
//! assert_eq!(out.len(), 32);
//! # Ok::<(), sdr_stream::error::StreamError>(())
//! ```

use crate::error::{StreamError, StreamResult};
use num_complex::Complex32;
use std::f64::consts::PI;
use std::fmt;

/// Design a linear-phase low-pass filter with a Hamming-windowed sinc.
///
/// The cutoff sits midway between `pass` and `stop`. The tap count is
/// estimated from the transition width and `attenuation_db`
/// (`taps ≈ A * fs / (22 * (stop - pass))`) and rounded up to an odd number
/// so the filter has an integer group delay. Coefficients are normalized to
/// unity DC gain.
pub fn low_pass(
    sample_rate: f64,
    pass: f64,
    stop: f64,
    attenuation_db: f64,
) -> StreamResult<Vec<f32>> {
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(StreamError::Configuration(format!(
            "filter sample rate must be positive, got {sample_rate}"
        )));
    }
    if !(pass > 0.0 && stop > pass) {
        return Err(StreamError::Configuration(format!(
            "stop band edge ({stop} Hz) must be above pass band edge ({pass} Hz)"
        )));
    }
    if stop > sample_rate / 2.0 {
        return Err(StreamError::Configuration(format!(
            "stop band edge ({stop} Hz) is above Nyquist ({} Hz)",
            sample_rate / 2.0
        )));
    }
    if attenuation_db <= 0.0 {
        return Err(StreamError::configuration("attenuation must be positive"));
    }

    let estimate = (attenuation_db * sample_rate / (22.0 * (stop - pass))).ceil() as usize;
    let taps = estimate.max(3) | 1;

    let cutoff = (pass + stop) / 2.0 / sample_rate;
    let mid = (taps / 2) as f64;
    let mut coefficients: Vec<f64> = (0..taps)
        .map(|n| {
            let x = n as f64 - mid;
            let sinc = if x == 0.0 {
                2.0 * cutoff
            } else {
                (2.0 * PI * cutoff * x).sin() / (PI * x)
            };
            let window = 0.54 - 0.46 * (2.0 * PI * n as f64 / (taps - 1) as f64).cos();
            sinc * window
        })
        .collect();

    let sum: f64 = coefficients.iter().sum();
    for c in coefficients.iter_mut() {
        *c /= sum;
    }
    Ok(coefficients.into_iter().map(|c| c as f32).collect())
}

/// Streaming FIR filter for complex samples with real coefficients.
///
/// The delay line carries across calls, so splitting a stream into blocks
/// does not change the output.
#[derive(Clone)]
pub struct ComplexFirFilter {
    coefficients: Vec<f32>,
    gain: f32,
    history: Vec<Complex32>,
    head: usize,
}

impl fmt::Debug for ComplexFirFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplexFirFilter")
            .field("taps", &self.coefficients.len())
            .field("gain", &self.gain)
            .finish()
    }
}

impl ComplexFirFilter {
    /// Filter with `coefficients`, scaling every output by `gain`.
    pub fn new(coefficients: Vec<f32>, gain: f32) -> StreamResult<Self> {
        if coefficients.is_empty() {
            return Err(StreamError::configuration(
                "filter needs at least one coefficient",
            ));
        }
        let taps = coefficients.len();
        Ok(Self {
            coefficients,
            gain,
            history: vec![Complex32::default(); taps],
            head: 0,
        })
    }

    /// Number of taps.
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    /// Always false; a filter has at least one tap.
    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Filter one block, producing one output per input sample.
    pub fn process(&mut self, samples: &[Complex32]) -> Vec<Complex32> {
        let taps = self.coefficients.len();
        let mut out = Vec::with_capacity(samples.len());

        for &sample in samples {
            self.history[self.head] = sample;

            // coefficients[0] pairs with the newest sample
            let mut acc = Complex32::default();
            let mut index = self.head;
            for &c in &self.coefficients {
                acc += self.history[index] * c;
                index = if index == 0 { taps - 1 } else { index - 1 };
            }
            out.push(acc * self.gain);

            self.head = (self.head + 1) % taps;
        }
        out
    }

    /// Zero the delay line.
    pub fn reset(&mut self) {
        self.history.fill(Complex32::default());
        self.head = 0;
    }
}
