//! End-to-end pipeline test: processor → channelizer → tap → FM demodulator
//!
//! Runs synthetic wideband tones through the whole chain on a manual clock
//! and checks the recovered audio plus pool accounting at every stage.

use num_complex::Complex32;
use parking_lot::Mutex;
use sdr_stream::channelizer::{ChannelConsumer, ChannelTap, DftChannelizer, PolyphaseChannelizer};
use sdr_stream::demod::{AudioListener, FmDemodulatorModule};
use sdr_stream::module::{Module, ModuleStatus};
use sdr_stream::pool::{ReusableBuffer, ReusableBufferPool};
use sdr_stream::processor::{ProcessorConfig, ScheduledBufferProcessor};
use sdr_stream::scheduler::ManualScheduler;
use sdr_stream::StreamError;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

const WIDEBAND_RATE: f64 = 384_000.0;
const CHANNELS: usize = 8;
const BLOCK_LEN: usize = 1024;

struct Pipeline {
    scheduler: ManualScheduler,
    processor: Arc<ScheduledBufferProcessor<ReusableBuffer<Complex32>>>,
    channelizer: Arc<PolyphaseChannelizer<DftChannelizer>>,
    tap: Arc<ChannelTap>,
    demodulator: Arc<FmDemodulatorModule>,
    wideband: ReusableBufferPool<Complex32>,
    narrow: ReusableBufferPool<Complex32>,
    audio: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl Pipeline {
    fn new(channel: usize) -> Self {
        let scheduler = ManualScheduler::new();
        let config = ProcessorConfig {
            capacity: 16,
            reset_threshold: 4,
            distribution_interval: Duration::from_millis(10),
            max_buffers_per_interval: 8,
        };
        let processor = Arc::new(
            ScheduledBufferProcessor::new(&config, Arc::new(scheduler.clone())).unwrap(),
        );
        let channelizer = Arc::new(
            PolyphaseChannelizer::new(WIDEBAND_RATE, DftChannelizer::new(CHANNELS)).unwrap(),
        );
        let wideband = ReusableBufferPool::new("wideband");
        let narrow = ReusableBufferPool::new("narrow");
        let tap = Arc::new(ChannelTap::new(channel, narrow.clone()));
        let demodulator = Arc::new(FmDemodulatorModule::new(5_000.0, 7_000.0).unwrap());

        let audio = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&audio);
        let listener: AudioListener = Arc::new(move |block: Vec<f32>| -> anyhow::Result<()> {
            sink.lock().push(block);
            Ok(())
        });
        demodulator.set_output_listener(listener).unwrap();

        tap.set_output_listener(Some(demodulator.clone()));
        channelizer.add_channel(tap.clone());
        processor.set_listener(Some(channelizer.clone()));
        demodulator.start().unwrap();
        processor.start();

        Self {
            scheduler,
            processor,
            channelizer,
            tap,
            demodulator,
            wideband,
            narrow,
            audio,
        }
    }

    /// Feed `blocks` blocks of a constant tone at `frequency` Hz and let the
    /// processor drain them.
    fn feed_tone(&self, frequency: f64, blocks: usize) {
        let step = TAU * frequency / WIDEBAND_RATE;
        let mut phase = 0.0f64;
        for _ in 0..blocks {
            let buffer = self.wideband.acquire_with(BLOCK_LEN, |samples| {
                for sample in samples.iter_mut() {
                    *sample = Complex32::from_polar(1.0, phase as f32);
                    phase = (phase + step) % TAU;
                }
            });
            self.processor.receive(buffer);
        }
        self.scheduler.run_pending();
        self.scheduler.advance(Duration::from_millis(10));
    }
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

#[test]
fn centered_carrier_demodulates_to_silence() {
    let pipeline = Pipeline::new(1);
    assert_eq!(pipeline.tap.sample_rate(), Some(48_000.0));

    pipeline.feed_tone(48_000.0, 4);

    let audio = pipeline.audio.lock();
    assert_eq!(audio.len(), 4);
    assert!(audio.iter().all(|block| block.len() == BLOCK_LEN / CHANNELS));
    let last = audio.last().unwrap();
    assert!(mean(last).abs() < 1e-3, "mean {}", mean(last));
}

#[test]
fn offset_carrier_demodulates_to_its_phase_step() {
    let pipeline = Pipeline::new(1);

    // 1 kHz above channel 1's center
    pipeline.feed_tone(49_000.0, 4);

    let expected = (TAU * 1_000.0 / 48_000.0) as f32;
    let audio = pipeline.audio.lock();
    assert_eq!(audio.len(), 4);
    let last = audio.last().unwrap();
    assert!(
        (mean(last) - expected).abs() < 1e-2,
        "mean {} expected {expected}",
        mean(last)
    );
}

#[test]
fn negative_channel_tracks_negative_offset() {
    // Channel 7 of 8 is centered at -48 kHz
    let pipeline = Pipeline::new(7);

    pipeline.feed_tone(-48_000.0 - 1_000.0, 4);

    let expected = -(TAU * 1_000.0 / 48_000.0) as f32;
    let audio = pipeline.audio.lock();
    let last = audio.last().unwrap();
    assert!((mean(last) - expected).abs() < 1e-2, "mean {}", mean(last));
}

#[test]
fn every_pooled_buffer_is_released_explicitly() {
    let pipeline = Pipeline::new(1);
    pipeline.feed_tone(48_000.0, 6);

    let wideband = pipeline.wideband.stats();
    assert_eq!(wideband.acquires, 6);
    assert_eq!(wideband.outstanding, 0);
    assert_eq!(wideband.implicit_releases, 0);
    assert_eq!(wideband.releases, wideband.acquires + wideband.retains);

    let narrow = pipeline.narrow.stats();
    assert_eq!(narrow.acquires, 6);
    assert_eq!(narrow.outstanding, 0);
    assert_eq!(narrow.implicit_releases, 0);
    // Steady state reuses one slot
    assert_eq!(narrow.allocated, 1);
    assert_eq!(narrow.recycled, 5);

    assert_eq!(pipeline.processor.stats().dispatched, 6);
    assert_eq!(pipeline.channelizer.stats().blocks, 6);
    assert_eq!(pipeline.tap.forwarded(), 6);
    assert_eq!(pipeline.demodulator.blocks(), 6);
}

#[test]
fn disposed_demodulator_still_returns_buffers() {
    let pipeline = Pipeline::new(1);
    pipeline.feed_tone(48_000.0, 2);

    pipeline.demodulator.dispose().unwrap();
    assert_eq!(pipeline.demodulator.status(), ModuleStatus::Disposed);
    assert!(matches!(
        pipeline.demodulator.dispose(),
        Err(StreamError::Disposed(_))
    ));

    pipeline.feed_tone(48_000.0, 2);

    // The tap reports the refusal, the channelizer counts it, nothing leaks
    assert_eq!(pipeline.channelizer.stats().failures, 2);
    assert_eq!(pipeline.tap.forwarded(), 2);
    assert_eq!(pipeline.audio.lock().len(), 2);
    assert_eq!(pipeline.narrow.stats().outstanding, 0);
    assert_eq!(pipeline.wideband.stats().outstanding, 0);
}

#[test]
fn removed_tap_stops_audio() {
    let pipeline = Pipeline::new(1);
    pipeline.feed_tone(48_000.0, 1);

    let consumer: Arc<dyn ChannelConsumer> = pipeline.tap.clone();
    assert!(pipeline.channelizer.remove_channel(&consumer));
    pipeline.feed_tone(48_000.0, 3);

    assert_eq!(pipeline.audio.lock().len(), 1);
    assert_eq!(pipeline.channelizer.stats().blocks, 4);
    assert_eq!(pipeline.wideband.stats().outstanding, 0);
}
