//! Wideband-to-narrowband channelization and per-channel fan-out.
//!
//! A [`PolyphaseChannelizer`] receives wideband sample blocks, runs its
//! [`ChannelizerTransform`] exactly once per block, and hands the resulting
//! [`ChannelResultsBuffer`] to every registered [`ChannelConsumer`] as one
//! shared `Arc`. Consumers also hear about rate changes through the event
//! listener they supply at registration.
//!
//! Rate updates and dispatch are serialized: once [`PolyphaseChannelizer::set_sample_rate`]
//! returns, every consumer has been told the new channel rate and every later
//! dispatch is computed and stamped at that rate. Registration is not: consumers
//! work from a snapshot, so channels may be added or removed at any time,
//! including from inside a consumer callback.

pub mod dft;
pub mod tap;

pub use dft::DftChannelizer;
pub use tap::ChannelTap;

use crate::broadcast::ChannelRegistry;
use crate::error::{StreamError, StreamResult};
use crate::listener::{guarded, Delivery, Listener};
use crate::source_event::{SourceEvent, SourceEventProvider};
use num_complex::Complex32;
use parking_lot::{Mutex, RwLock};
use sdr_pool::ReusableBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// The arithmetic behind a channelizer: wideband samples in, one sample
/// sequence per channel out.
pub trait ChannelizerTransform: Send {
    /// Number of channels produced.
    fn channel_count(&self) -> usize;

    /// Channelize `samples`. Returns exactly `channel_count()` sequences of
    /// equal length, possibly empty when too few samples were supplied.
    fn process(&mut self, samples: &[Complex32]) -> Vec<Vec<Complex32>>;

    /// Forget any carried state.
    fn reset(&mut self) {}
}

/// Receives every channel results dispatch from a [`PolyphaseChannelizer`].
pub trait ChannelConsumer: SourceEventProvider {
    /// Handle one dispatch. The buffer is shared with the other consumers.
    fn receive_channel_results(&self, results: Arc<ChannelResultsBuffer>) -> anyhow::Result<()>;
}

/// Output of one channelizer invocation, indexed by channel number.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResultsBuffer {
    channel_sample_rate: f64,
    channels: Vec<Vec<Complex32>>,
}

impl ChannelResultsBuffer {
    /// Wrap per-channel sample sequences produced at `channel_sample_rate`.
    pub fn new(channel_sample_rate: f64, channels: Vec<Vec<Complex32>>) -> Self {
        Self {
            channel_sample_rate,
            channels,
        }
    }

    /// Rate the samples were produced at, in Hz.
    pub fn channel_sample_rate(&self) -> f64 {
        self.channel_sample_rate
    }

    /// Samples for `index`, or `None` if there is no such channel.
    pub fn channel(&self, index: usize) -> Option<&[Complex32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples in each channel.
    pub fn samples_per_channel(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

/// Input rate and channel count. The channel rate is always derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelizerConfig {
    /// Wideband input rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Number of output channels
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
}

fn default_sample_rate() -> f64 {
    384_000.0
}

fn default_channel_count() -> usize {
    8
}

impl Default for ChannelizerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channel_count: default_channel_count(),
        }
    }
}

impl ChannelizerConfig {
    /// Per-channel output rate in Hz.
    pub fn channel_sample_rate(&self) -> f64 {
        self.sample_rate / self.channel_count as f64
    }

    /// Reject a zero channel count or a rate that is not positive and finite.
    pub fn validate(&self) -> StreamResult<()> {
        if self.channel_count == 0 {
            return Err(StreamError::configuration("channel_count must be > 0"));
        }
        validate_sample_rate(self.sample_rate)
    }
}

fn validate_sample_rate(sample_rate: f64) -> StreamResult<()> {
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(StreamError::Configuration(format!(
            "sample rate must be positive and finite, got {sample_rate}"
        )));
    }
    Ok(())
}

/// Channelizer activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelizerStats {
    /// Input blocks transformed
    pub blocks: u64,
    /// Results buffers handed to consumers (one per consumer per block)
    pub deliveries: u64,
    /// Consumer deliveries that failed
    pub failures: u64,
}

/// Channelizer front end: configuration, the transform, and the consumer set.
pub struct PolyphaseChannelizer<X> {
    config: RwLock<ChannelizerConfig>,
    transform: Mutex<X>,
    // Held across transform and dispatch, and across rate updates, so no
    // dispatch straddles a rate announcement. Registration never takes it.
    dispatch: Mutex<()>,
    // Orders registration against rate announcements.
    announce: Mutex<()>,
    channels: ChannelRegistry<dyn ChannelConsumer>,
    blocks: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
}

impl<X> fmt::Debug for PolyphaseChannelizer<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolyphaseChannelizer")
            .field("config", &*self.config.read())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl<X: ChannelizerTransform> PolyphaseChannelizer<X> {
    /// Channelizer for input at `sample_rate` Hz. The channel count comes
    /// from the transform.
    pub fn new(sample_rate: f64, transform: X) -> StreamResult<Self> {
        let config = ChannelizerConfig {
            sample_rate,
            channel_count: transform.channel_count(),
        };
        config.validate()?;

        info!(
            sample_rate,
            channel_count = config.channel_count,
            channel_sample_rate = config.channel_sample_rate(),
            "Channelizer created"
        );

        Ok(Self {
            config: RwLock::new(config),
            transform: Mutex::new(transform),
            dispatch: Mutex::new(()),
            announce: Mutex::new(()),
            channels: ChannelRegistry::new(),
            blocks: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Input sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.config.read().sample_rate
    }

    /// Number of output channels.
    pub fn channel_count(&self) -> usize {
        self.config.read().channel_count
    }

    /// Output rate of each channel in Hz.
    pub fn channel_sample_rate(&self) -> f64 {
        self.config.read().channel_sample_rate()
    }

    /// Current configuration, read atomically.
    pub fn config(&self) -> ChannelizerConfig {
        *self.config.read()
    }

    /// Change the input rate and announce the new channel rate to every
    /// registered consumer before any dispatch at that rate.
    ///
    /// Waits for an in-flight dispatch to finish. Must not be called from
    /// inside a consumer callback.
    pub fn set_sample_rate(&self, sample_rate: f64) -> StreamResult<()> {
        validate_sample_rate(sample_rate)?;

        let _dispatch = self.dispatch.lock();
        let _announce = self.announce.lock();
        let channel_sample_rate = {
            let mut config = self.config.write();
            config.sample_rate = sample_rate;
            config.channel_sample_rate()
        };
        let notified = self.channels.broadcast_event(SourceEvent::SampleRateChange {
            sample_rate: channel_sample_rate,
        });
        debug!(
            sample_rate,
            channel_sample_rate, notified, "Channelizer sample rate changed"
        );
        Ok(())
    }

    /// Register a consumer. Returns `false` if it is already registered.
    ///
    /// The consumer's event listener is told the current channel rate before
    /// the consumer joins the dispatch set. Safe to call from inside a
    /// consumer callback; a consumer added during a dispatch may or may not
    /// receive that dispatch.
    pub fn add_channel(&self, consumer: Arc<dyn ChannelConsumer>) -> bool {
        let _announce = self.announce.lock();
        let initial = SourceEvent::SampleRateChange {
            sample_rate: self.channel_sample_rate(),
        };
        self.channels.add_announced(consumer, initial)
    }

    /// Unregister a consumer. Removing one that is not registered does nothing.
    ///
    /// Safe to call from inside a consumer callback; the dispatch in progress
    /// still completes over the consumers it started with.
    pub fn remove_channel(&self, consumer: &Arc<dyn ChannelConsumer>) -> bool {
        self.channels.remove(consumer)
    }

    /// Number of registered consumers.
    pub fn registered_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Apply an upstream event: a rate change reconfigures the channelizer,
    /// anything else is forwarded to the consumers.
    pub fn receive_source_event(&self, event: SourceEvent) -> StreamResult<()> {
        match event {
            SourceEvent::SampleRateChange { sample_rate } => self.set_sample_rate(sample_rate),
            other => {
                let _announce = self.announce.lock();
                self.channels.broadcast_event(other);
                Ok(())
            }
        }
    }

    /// Channelize one wideband block and dispatch the result.
    ///
    /// The buffer is copied and released before the transform runs. Each
    /// consumer in the registration snapshot gets the same results buffer; a
    /// consumer that errors or panics is logged and counted, and the rest
    /// still receive it. Returns the number of consumers that accepted the
    /// results.
    pub fn receive(&self, buffer: ReusableBuffer<Complex32>) -> StreamResult<usize> {
        let samples = buffer.copy_of_samples();
        buffer.release()?;

        let _dispatch = self.dispatch.lock();
        let channels = self.transform.lock().process(&samples);

        let config = *self.config.read();
        if channels.len() != config.channel_count {
            return Err(StreamError::ChannelMismatch {
                expected: config.channel_count,
                actual: channels.len(),
            });
        }
        self.blocks.fetch_add(1, Ordering::Relaxed);

        let results = Arc::new(ChannelResultsBuffer::new(
            config.channel_sample_rate(),
            channels,
        ));
        if results.samples_per_channel() == 0 {
            return Ok(0);
        }

        let consumers = self.channels.consumers();
        let mut accepted = 0;
        for consumer in consumers.iter() {
            match guarded(|| consumer.receive_channel_results(Arc::clone(&results))) {
                Delivery::Delivered => accepted += 1,
                Delivery::Failed(message) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %message, "Channel consumer failed to process results");
                }
                Delivery::Panicked(message) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(panic = %message, "Channel consumer panicked while processing results");
                }
            }
        }
        self.deliveries.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }

    /// Clear the transform's carried samples.
    pub fn reset(&self) {
        self.transform.lock().reset();
    }

    /// Activity counters.
    pub fn stats(&self) -> ChannelizerStats {
        ChannelizerStats {
            blocks: self.blocks.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl<X: ChannelizerTransform> Listener<ReusableBuffer<Complex32>> for PolyphaseChannelizer<X> {
    fn receive(&self, item: ReusableBuffer<Complex32>) -> anyhow::Result<()> {
        PolyphaseChannelizer::receive(self, item)?;
        Ok(())
    }
}

impl<X: ChannelizerTransform> Listener<SourceEvent> for PolyphaseChannelizer<X> {
    fn receive(&self, item: SourceEvent) -> anyhow::Result<()> {
        self.receive_source_event(item)?;
        Ok(())
    }
}
