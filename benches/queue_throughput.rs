//! Criterion benchmarks for the producer-side hot paths.
//!
//! The producer must never wait on downstream stages, so these measure the
//! costs it pays per block:
//! - Pool acquire/release with recycled slots
//! - Queue offer/drain, including offers rejected during overflow
//! - Channelizer transform and fan-out to several consumers
//!
//! Run with: cargo bench --bench queue_throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use num_complex::Complex32;
use sdr_stream::channelizer::{
    ChannelConsumer, ChannelResultsBuffer, DftChannelizer, PolyphaseChannelizer,
};
use sdr_stream::listener::Listener;
use sdr_stream::pool::ReusableBufferPool;
use sdr_stream::queue::OverflowableQueue;
use sdr_stream::source_event::{SourceEvent, SourceEventProvider};
use std::sync::Arc;
use std::thread;

/// Benchmark acquiring and releasing pooled blocks of common sizes.
fn pool_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_release");

    for block_len in [256usize, 1024, 4096, 16 * 1024] {
        let pool = ReusableBufferPool::<Complex32>::with_preallocated("bench", 4, block_len);
        let block = vec![Complex32::new(0.5, -0.5); block_len];

        group.throughput(Throughput::Elements(block_len as u64));
        group.bench_with_input(BenchmarkId::new("acquire", block_len), &block_len, |b, _| {
            b.iter(|| {
                let buffer = pool.acquire(black_box(&block));
                buffer.release().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark queue offer/drain in steady state and under overflow.
fn queue_offer_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    let queue = OverflowableQueue::<u64>::new(1024, 256).unwrap();
    let mut batch = Vec::with_capacity(64);
    group.bench_function("offer_then_drain_64", |b| {
        b.iter(|| {
            for i in 0..64 {
                let _ = queue.offer(black_box(i));
            }
            batch.clear();
            queue.drain_into(&mut batch, 64);
            black_box(batch.len());
        });
    });

    // A full queue: every offer takes the rejection path
    let full = OverflowableQueue::<u64>::new(64, 16).unwrap();
    for i in 0..64 {
        let _ = full.offer(i);
    }
    group.bench_function("offer_rejected", |b| {
        b.iter(|| {
            let _ = black_box(full.offer(black_box(1)));
        });
    });

    group.finish();
}

/// Benchmark offers from several producer threads into one queue.
fn queue_concurrent_offers(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_concurrent");

    for thread_count in [1usize, 2, 4, 8] {
        let queue = Arc::new(OverflowableQueue::<u64>::new(8192, 1024).unwrap());

        group.bench_with_input(
            BenchmarkId::new("offers", thread_count),
            &thread_count,
            |b, &thread_count| {
                b.iter(|| {
                    let handles: Vec<_> = (0..thread_count)
                        .map(|_| {
                            let queue = Arc::clone(&queue);
                            thread::spawn(move || {
                                for i in 0..256 {
                                    let _ = queue.offer(i);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    queue.clear();
                });
            },
        );
    }

    group.finish();
}

struct Sink;

impl SourceEventProvider for Sink {
    fn source_event_listener(&self) -> Arc<dyn Listener<SourceEvent>> {
        Arc::new(|_event: SourceEvent| -> anyhow::Result<()> { Ok(()) })
    }
}

impl ChannelConsumer for Sink {
    fn receive_channel_results(&self, results: Arc<ChannelResultsBuffer>) -> anyhow::Result<()> {
        black_box(results.samples_per_channel());
        Ok(())
    }
}

/// Benchmark one channelizer block with a growing number of consumers.
///
/// The transform runs once per block regardless of consumer count, so the
/// per-consumer cost should be a reference-count bump.
fn channelizer_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("channelizer_fan_out");
    let block_len = 4096;
    let pool = ReusableBufferPool::<Complex32>::with_preallocated("bench", 4, block_len);
    let block: Vec<Complex32> = (0..block_len)
        .map(|n| Complex32::from_polar(1.0, 0.1 * n as f32))
        .collect();

    for consumers in [1usize, 4, 8] {
        let channelizer = PolyphaseChannelizer::new(384_000.0, DftChannelizer::new(8)).unwrap();
        for _ in 0..consumers {
            channelizer.add_channel(Arc::new(Sink));
        }

        group.throughput(Throughput::Elements(block_len as u64));
        group.bench_with_input(
            BenchmarkId::new("consumers", consumers),
            &consumers,
            |b, _| {
                b.iter(|| {
                    let accepted = channelizer.receive(pool.acquire(&block)).unwrap();
                    black_box(accepted);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    pool_acquire_release,
    queue_offer_drain,
    queue_concurrent_offers,
    channelizer_fan_out
);
criterion_main!(benches);
