//! CLI entry point for sdr_stream
//!
//! Provides a command-line interface for:
//! - Running the streaming pipeline against a synthetic wideband source
//! - Checking a configuration file without running anything
//!
//! # Usage
//!
//! ```bash
//! sdr_stream run --duration 5s --channel 2 --tone-offset 500
//! sdr_stream check --config config/sdr_stream.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use num_complex::Complex32;
use parking_lot::Mutex;
use sdr_stream::channelizer::{ChannelConsumer, ChannelTap, DftChannelizer, PolyphaseChannelizer};
use sdr_stream::config::{StreamConfig, DEFAULT_CONFIG_PATH};
use sdr_stream::demod::{FmDemodulatorModule, DEMODULATOR_SAMPLE_RATE};
use sdr_stream::module::Module;
use sdr_stream::pool::{ReusableBuffer, ReusableBufferPool};
use sdr_stream::processor::ScheduledBufferProcessor;
use sdr_stream::queue::OverflowListener;
use sdr_stream::scheduler::TokioScheduler;
use sdr_stream::tracing_init;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sdr_stream")]
#[command(about = "SDR streaming core: pooled buffers, scheduled dispatch, channelizer, FM demod", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on a synthetic FM signal
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// How long to run (e.g. "2s", "500ms")
        #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Channel to demodulate
        #[arg(long, default_value_t = 1)]
        channel: usize,

        /// Offset of the synthetic carrier from the channel center, in Hz
        #[arg(long, default_value_t = 0.0)]
        tone_offset: f64,
    },

    /// Load and validate a configuration file
    Check {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration,
            channel,
            tone_offset,
        } => {
            let config = load(&config)?;
            tracing_init::init_from_config(&config)?;
            run_pipeline(config, duration, channel, tone_offset).await
        }
        Commands::Check { config } => check(&config),
    }
}

fn load(path: &Path) -> Result<StreamConfig> {
    let config = StreamConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    println!("Configuration OK: {}", path.display());
    println!(
        "  processor:   capacity {}, reset at {}, {} buffers every {}",
        config.processor.capacity,
        config.processor.reset_threshold,
        config.processor.max_buffers_per_interval,
        humantime::format_duration(config.processor.distribution_interval)
    );
    println!(
        "  channelizer: {} Hz in, {} channels of {} Hz",
        config.channelizer.sample_rate,
        config.channelizer.channel_count,
        config.channelizer.channel_sample_rate()
    );
    println!(
        "  demodulator: pass {} Hz, stop {} Hz",
        config.demodulator.pass, config.demodulator.stop
    );
    if config.channelizer.channel_sample_rate() != DEMODULATOR_SAMPLE_RATE {
        println!(
            "  warning: channel rate differs from the demodulator's {DEMODULATOR_SAMPLE_RATE} Hz"
        );
    }
    Ok(())
}

/// Logs overflow transitions of the processor queue.
struct OverflowLogger {
    episodes: AtomicU64,
}

impl OverflowListener for OverflowLogger {
    fn on_overflow(&self) {
        let episode = self.episodes.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(episode, "Wideband queue overflow, dropping blocks");
    }

    fn on_reset(&self) {
        info!("Wideband queue recovered");
    }
}

#[derive(Default)]
struct AudioStats {
    blocks: AtomicU64,
    samples: AtomicU64,
    energy: Mutex<f64>,
}

async fn run_pipeline(
    config: StreamConfig,
    duration: Duration,
    channel: usize,
    tone_offset: f64,
) -> Result<()> {
    let channels = config.channelizer.channel_count;
    if channel >= channels {
        bail!("channel {channel} out of range, channelizer has {channels} channels");
    }
    let channel_rate = config.channelizer.channel_sample_rate();
    if channel_rate != DEMODULATOR_SAMPLE_RATE {
        warn!(
            channel_rate,
            expected = DEMODULATOR_SAMPLE_RATE,
            "Channel rate does not match demodulator filter design"
        );
    }

    let strict = config.pool.strict.unwrap_or(cfg!(debug_assertions));
    let wideband_pool = ReusableBufferPool::<Complex32>::with_preallocated(
        "wideband",
        config.pool.preallocate,
        config.pool.block_len,
    )
    .strict(strict);
    let channel_pool = ReusableBufferPool::<Complex32>::new("channel").strict(strict);

    let scheduler = Arc::new(TokioScheduler::current()?);
    let processor: Arc<ScheduledBufferProcessor<ReusableBuffer<Complex32>>> =
        Arc::new(ScheduledBufferProcessor::new(&config.processor, scheduler)?);
    processor.set_overflow_listener(Some(Arc::new(OverflowLogger {
        episodes: AtomicU64::new(0),
    })));

    let channelizer = Arc::new(PolyphaseChannelizer::new(
        config.channelizer.sample_rate,
        DftChannelizer::new(channels),
    )?);
    let tap = Arc::new(ChannelTap::new(channel, channel_pool.clone()));
    let demodulator = Arc::new(FmDemodulatorModule::from_config(&config.demodulator)?);

    let audio = Arc::new(AudioStats::default());
    let sink = Arc::clone(&audio);
    demodulator.set_output_listener(Arc::new(move |block: Vec<f32>| -> anyhow::Result<()> {
        let energy: f64 = block.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        *sink.energy.lock() += energy;
        sink.samples.fetch_add(block.len() as u64, Ordering::Relaxed);
        sink.blocks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }))?;

    tap.set_output_listener(Some(demodulator.clone()));
    let consumer: Arc<dyn ChannelConsumer> = tap.clone();
    channelizer.add_channel(Arc::clone(&consumer));
    processor.set_listener(Some(channelizer.clone()));

    demodulator.start()?;
    processor.start();

    // Channels above the midpoint cover negative frequencies.
    let center = if channel <= channels / 2 {
        channel as f64 * channel_rate
    } else {
        (channel as f64 - channels as f64) * channel_rate
    };
    let carrier = center + tone_offset;
    info!(channel, carrier, "Starting synthetic FM source");

    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let running = Arc::clone(&running);
        let processor = Arc::clone(&processor);
        let pool = wideband_pool.clone();
        let block_len = config.pool.block_len;
        let sample_rate = config.channelizer.sample_rate;
        tokio::task::spawn_blocking(move || {
            let mut source = FmSource::new(sample_rate, carrier, 2_500.0, 400.0);
            let block_period = Duration::from_secs_f64(block_len as f64 / sample_rate);
            let mut next = Instant::now();
            let mut produced = 0u64;
            while running.load(Ordering::Acquire) {
                let buffer = pool.acquire_with(block_len, |samples| source.fill(samples));
                processor.receive(buffer);
                produced += 1;
                next += block_period;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    std::thread::sleep(wait);
                }
            }
            produced
        })
    };

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    running.store(false, Ordering::Release);
    let produced = producer.await.context("producer task failed")?;
    processor.stop();
    demodulator.stop()?;

    let processor_stats = processor.stats();
    let channelizer_stats = channelizer.stats();
    let audio_samples = audio.samples.load(Ordering::Relaxed);
    let rms = if audio_samples > 0 {
        (*audio.energy.lock() / audio_samples as f64).sqrt()
    } else {
        0.0
    };

    info!(
        produced,
        dispatched = processor_stats.dispatched,
        rejected = processor_stats.queue.rejected,
        overflow_episodes = processor_stats.queue.overflow_episodes,
        "Processor summary"
    );
    info!(
        blocks = channelizer_stats.blocks,
        deliveries = channelizer_stats.deliveries,
        failures = channelizer_stats.failures,
        tap_forwarded = tap.forwarded(),
        "Channelizer summary"
    );
    info!(
        blocks = audio.blocks.load(Ordering::Relaxed),
        samples = audio_samples,
        rms,
        "Audio summary"
    );

    channelizer.remove_channel(&consumer);
    demodulator.dispose()?;

    for stats in [wideband_pool.stats(), channel_pool.stats()] {
        info!(
            allocated = stats.allocated,
            outstanding = stats.outstanding,
            recycled = stats.recycled,
            implicit_releases = stats.implicit_releases,
            "Pool summary"
        );
    }
    Ok(())
}

/// Complex FM test signal: a carrier swept sinusoidally by `deviation` Hz.
struct FmSource {
    sample_rate: f64,
    carrier: f64,
    deviation: f64,
    modulation: f64,
    phase: f64,
    n: u64,
}

impl FmSource {
    fn new(sample_rate: f64, carrier: f64, deviation: f64, modulation: f64) -> Self {
        Self {
            sample_rate,
            carrier,
            deviation,
            modulation,
            phase: 0.0,
            n: 0,
        }
    }

    fn fill(&mut self, samples: &mut [Complex32]) {
        for sample in samples {
            let t = self.n as f64 / self.sample_rate;
            let frequency = self.carrier + self.deviation * (TAU * self.modulation * t).sin();
            self.phase = (self.phase + TAU * frequency / self.sample_rate) % TAU;
            *sample = Complex32::from_polar(1.0, self.phase as f32);
            self.n += 1;
        }
    }
}
