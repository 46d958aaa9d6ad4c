//! Pool accounting across holders, threads and the scheduled processor

use num_complex::Complex32;
use sdr_stream::broadcast::Broadcaster;
use sdr_stream::listener::Listener;
use sdr_stream::pool::{ReusableBuffer, ReusableBufferPool};
use sdr_stream::processor::{ProcessorConfig, ScheduledBufferProcessor};
use sdr_stream::scheduler::ManualScheduler;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn fan_out_holders_each_release_once() {
    let pool = ReusableBufferPool::<f32>::new("fan-out");
    let block = pool.acquire(&[1.0; 64]);

    let holders: Vec<_> = (0..4).map(|_| block.retain()).collect();
    assert_eq!(block.user_count(), 5);
    block.release().unwrap();

    let handles: Vec<_> = holders
        .into_iter()
        .map(|holder| {
            thread::spawn(move || {
                let sum: f32 = holder.samples().iter().sum();
                holder.release().unwrap();
                sum
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 64.0);
    }

    let stats = pool.stats();
    assert_eq!(stats.acquires, 1);
    assert_eq!(stats.retains, 4);
    assert_eq!(stats.releases, 5);
    assert_eq!(stats.implicit_releases, 0);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.available, 1);
}

#[test]
fn steady_producer_reuses_preallocated_slots() {
    let pool = ReusableBufferPool::<Complex32>::with_preallocated("steady", 2, 256);

    for i in 0..100 {
        let first = pool.acquire_with(256, |s| s.fill(Complex32::new(i as f32, 0.0)));
        let second = pool.acquire(&first.samples());
        first.release().unwrap();
        second.release().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.allocated, 2);
    assert_eq!(stats.recycled, 200);
    assert_eq!(stats.outstanding, 0);
}

#[test]
fn rejected_and_discarded_buffers_return_to_pool() {
    let pool = ReusableBufferPool::<f32>::new("processor");
    let scheduler = ManualScheduler::new();
    let config = ProcessorConfig {
        capacity: 4,
        reset_threshold: 1,
        distribution_interval: Duration::from_millis(10),
        max_buffers_per_interval: 2,
    };
    let processor: ScheduledBufferProcessor<ReusableBuffer<f32>> =
        ScheduledBufferProcessor::new(&config, Arc::new(scheduler.clone())).unwrap();
    processor.set_listener(Some(Arc::new(
        |buffer: ReusableBuffer<f32>| -> anyhow::Result<()> {
            buffer.release()?;
            Ok(())
        },
    )));
    processor.start();

    // 4 queued, 2 rejected at the door
    for i in 0..6 {
        processor.receive(pool.acquire(&[i as f32; 8]));
    }
    assert_eq!(pool.stats().implicit_releases, 2);
    assert_eq!(pool.stats().outstanding, 4);

    // Two delivered and released by the listener
    scheduler.run_pending();
    assert_eq!(pool.stats().releases, 2);
    assert_eq!(pool.stats().outstanding, 2);

    // The rest are discarded by stop
    processor.stop();
    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.implicit_releases, 4);
    assert_eq!(stats.releases + stats.implicit_releases, stats.acquires);
}

#[test]
fn failing_listener_still_frees_its_buffer() {
    let pool = ReusableBufferPool::<f32>::new("failing");
    let scheduler = ManualScheduler::new();
    let processor: ScheduledBufferProcessor<ReusableBuffer<f32>> =
        ScheduledBufferProcessor::new(&ProcessorConfig::default(), Arc::new(scheduler.clone()))
            .unwrap();
    processor.set_listener(Some(Arc::new(
        |_buffer: ReusableBuffer<f32>| -> anyhow::Result<()> { anyhow::bail!("sink offline") },
    )));
    processor.start();

    for _ in 0..3 {
        processor.receive(pool.acquire(&[0.0; 4]));
    }
    scheduler.run_pending();

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.implicit_releases, 3);
    assert_eq!(processor.stats().failures, 3);
}

#[test]
fn broadcaster_fan_out_uses_retain() {
    let pool = ReusableBufferPool::<f32>::new("broadcast");
    let broadcaster: Broadcaster<Arc<ReusableBuffer<f32>>> = Broadcaster::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for _ in 0..3 {
        let seen = Arc::clone(&seen);
        let listener: Arc<dyn Listener<Arc<ReusableBuffer<f32>>>> = Arc::new(
            move |shared: Arc<ReusableBuffer<f32>>| -> anyhow::Result<()> {
                // Each listener takes its own claim before the shared handle goes away
                seen.lock().push(shared.retain());
                Ok(())
            },
        );
        broadcaster.add_listener(listener);
    }

    let block = pool.acquire(&[2.0; 16]);
    assert_eq!(broadcaster.broadcast(Arc::new(block)), 3);

    // The broadcast's own handle was dropped with the last Arc
    let held: Vec<_> = seen.lock().drain(..).collect();
    assert_eq!(held.len(), 3);
    assert_eq!(pool.stats().outstanding, 1);
    for holder in held {
        holder.release().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.retains, 3);
    assert_eq!(stats.releases, 3);
    assert_eq!(stats.implicit_releases, 1);
}
