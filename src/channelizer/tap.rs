//! Single-channel extraction back into the pooled buffer world.

use super::{ChannelConsumer, ChannelResultsBuffer};
use crate::listener::Listener;
use crate::source_event::{SourceEvent, SourceEventProvider};
use anyhow::{anyhow, Context};
use num_complex::Complex32;
use parking_lot::{Mutex, RwLock};
use sdr_pool::{ReusableBuffer, ReusableBufferPool};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type Output = Arc<dyn Listener<ReusableBuffer<Complex32>>>;

/// Tracks the rate announced to a tap.
#[derive(Default)]
struct TapEvents {
    sample_rate: Mutex<Option<f64>>,
    frequency: Mutex<Option<u64>>,
}

impl Listener<SourceEvent> for TapEvents {
    fn receive(&self, item: SourceEvent) -> anyhow::Result<()> {
        match item {
            SourceEvent::SampleRateChange { sample_rate } => {
                debug!(sample_rate, "Channel tap rate updated");
                *self.sample_rate.lock() = Some(sample_rate);
            }
            SourceEvent::FrequencyChange { frequency } => {
                *self.frequency.lock() = Some(frequency);
            }
            SourceEvent::Notification(_) => {}
        }
        Ok(())
    }
}

/// Channel consumer that copies one channel into pooled buffers.
///
/// Each dispatch yields one buffer from `pool` holding the selected channel's
/// samples, handed to the output listener with a single holder.
pub struct ChannelTap {
    channel: usize,
    pool: ReusableBufferPool<Complex32>,
    events: Arc<TapEvents>,
    output: RwLock<Option<Output>>,
    forwarded: AtomicU64,
}

impl fmt::Debug for ChannelTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTap")
            .field("channel", &self.channel)
            .field("sample_rate", &self.sample_rate())
            .field("forwarded", &self.forwarded())
            .finish()
    }
}

impl ChannelTap {
    /// Tap `channel`, drawing output buffers from `pool`.
    pub fn new(channel: usize, pool: ReusableBufferPool<Complex32>) -> Self {
        Self {
            channel,
            pool,
            events: Arc::new(TapEvents::default()),
            output: RwLock::new(None),
            forwarded: AtomicU64::new(0),
        }
    }

    /// Channel index this tap extracts.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Set or replace (`None` clears) the listener receiving channel buffers.
    pub fn set_output_listener(&self, listener: Option<Output>) {
        *self.output.write() = listener;
    }

    /// Last channel rate announced to this tap.
    pub fn sample_rate(&self) -> Option<f64> {
        *self.events.sample_rate.lock()
    }

    /// Last tuned frequency announced to this tap.
    pub fn frequency(&self) -> Option<u64> {
        *self.events.frequency.lock()
    }

    /// Buffers handed to the output listener.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl SourceEventProvider for ChannelTap {
    fn source_event_listener(&self) -> Arc<dyn Listener<SourceEvent>> {
        self.events.clone()
    }
}

impl ChannelConsumer for ChannelTap {
    fn receive_channel_results(&self, results: Arc<ChannelResultsBuffer>) -> anyhow::Result<()> {
        let samples = results.channel(self.channel).ok_or_else(|| {
            anyhow!(
                "channel {} not present in results with {} channels",
                self.channel,
                results.channel_count()
            )
        })?;

        if self.sample_rate() != Some(results.channel_sample_rate()) {
            warn!(
                announced = ?self.sample_rate(),
                actual = results.channel_sample_rate(),
                "Channel results rate differs from announced rate"
            );
        }

        let Some(output) = self.output.read().clone() else {
            return Ok(());
        };
        let buffer = self.pool.acquire(samples);
        output
            .receive(buffer)
            .with_context(|| format!("channel {} output rejected buffer", self.channel))?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
