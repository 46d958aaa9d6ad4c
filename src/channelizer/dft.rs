//! Critically sampled DFT filterbank.
//!
//! Each frame of `channel_count` consecutive input samples is commutated
//! through a boxcar prototype filter and one FFT, yielding one output sample
//! per channel. Channel `k` is centered on `k * sample_rate / channel_count`;
//! channels above `channel_count / 2` cover negative frequencies. Samples that
//! do not fill a frame are carried into the next call.

use super::ChannelizerTransform;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// FFT channelizer with a `channel_count`-tap boxcar prototype.
pub struct DftChannelizer {
    channel_count: usize,
    fft: Arc<dyn Fft<f32>>,
    remainder: Vec<Complex32>,
    frame: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl fmt::Debug for DftChannelizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DftChannelizer")
            .field("channel_count", &self.channel_count)
            .field("carried", &self.remainder.len())
            .finish()
    }
}

impl DftChannelizer {
    /// Filterbank producing `channel_count` channels.
    ///
    /// A zero channel count is accepted here and rejected by the channelizer
    /// that wraps the transform.
    pub fn new(channel_count: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(channel_count.max(1));
        let scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];

        Self {
            channel_count,
            fft,
            remainder: Vec::with_capacity(channel_count),
            frame: vec![Complex32::default(); channel_count],
            scratch,
        }
    }

    /// Input samples waiting for a complete frame.
    pub fn carried(&self) -> usize {
        self.remainder.len()
    }

    fn transform_frame(&mut self, frame: &[Complex32], channels: &mut [Vec<Complex32>]) {
        let scale = 1.0 / self.channel_count as f32;
        self.frame.copy_from_slice(frame);
        self.fft.process_with_scratch(&mut self.frame, &mut self.scratch);
        for (channel, bin) in channels.iter_mut().zip(&self.frame) {
            channel.push(*bin * scale);
        }
    }
}

impl ChannelizerTransform for DftChannelizer {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn process(&mut self, samples: &[Complex32]) -> Vec<Vec<Complex32>> {
        let m = self.channel_count;
        if m == 0 {
            return Vec::new();
        }

        let frames = (self.remainder.len() + samples.len()) / m;
        let mut channels = vec![Vec::with_capacity(frames); m];
        let mut input = samples;

        if !self.remainder.is_empty() {
            let needed = m - self.remainder.len();
            if input.len() < needed {
                self.remainder.extend_from_slice(input);
                return channels;
            }
            let mut frame = std::mem::take(&mut self.remainder);
            frame.extend_from_slice(&input[..needed]);
            self.transform_frame(&frame, &mut channels);
            frame.clear();
            self.remainder = frame;
            input = &input[needed..];
        }

        let mut chunks = input.chunks_exact(m);
        for chunk in &mut chunks {
            self.transform_frame(chunk, &mut channels);
        }
        self.remainder.extend_from_slice(chunks.remainder());

        channels
    }

    fn reset(&mut self) {
        self.remainder.clear();
    }
}
