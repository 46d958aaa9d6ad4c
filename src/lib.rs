//! # SDR Streaming Core
//!
//! Plumbing that carries complex baseband samples from a fast producer to
//! slower signal-processing stages without blocking the producer and without
//! unbounded buffering.
//!
//! ## Crate Structure
//!
//! - **`sdr_pool`** (workspace crate): recyclable sample storage with linear
//!   buffer handles and an atomic user count. Re-exported as [`pool`].
//! - **`queue`**: bounded FIFO that reports overflow and recovery once per
//!   episode.
//! - **`scheduler`**: injectable fixed-rate scheduling, backed by tokio or by
//!   a manual virtual clock.
//! - **`processor`**: the scheduled buffer processor; a queue drained in
//!   bounded batches into a single listener.
//! - **`broadcast`**: copy-on-write registries and listener fan-out, plus the
//!   channel registry that mirrors consumers and their event listeners.
//! - **`channelizer`**: channelizer front end, a DFT filterbank transform and
//!   a single-channel tap.
//! - **`demod`**: low-pass FIR design, streaming complex FIR, FM discriminator
//!   and the demodulation module that composes them.
//! - **`module`**: lifecycle trait shared by processing modules.
//! - **`config`** / **`tracing_init`**: layered configuration and logging setup.
//! - **`error`**: the crate error type.
//!
//! ## Data Flow
//!
//! ```text
//! producer ─acquire─> ReusableBuffer ─receive─> ScheduledBufferProcessor
//!                                                   │ every interval, ≤ N buffers
//!                                                   v
//!                                          PolyphaseChannelizer ─one transform─┐
//!                                                                              v
//!                                     ChannelTap ... ChannelTap  <── Arc<ChannelResultsBuffer>
//!                                         │
//!                                         v
//!                                 FmDemodulatorModule ──> audio listener
//! ```

pub mod broadcast;
pub mod channelizer;
pub mod config;
pub mod demod;
pub mod error;
pub mod listener;
pub mod module;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod source_event;
pub mod tracing_init;

pub use sdr_pool as pool;

pub use error::{StreamError, StreamResult};
pub use listener::Listener;
