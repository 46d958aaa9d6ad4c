//! Narrowband FM demodulation module.
//!
//! [`FmDemodulatorModule`] chains a low-pass [`ComplexFirFilter`] and an
//! [`FmDemodulator`] and delivers real-valued audio to an output listener.
//! Processing is synchronous on the caller's thread.
//!
//! Input arrives as pooled [`ReusableBuffer`]s. The samples are copied out
//! and the buffer released before filtering, since the stages downstream
//! work on plain vectors and never hold pooled storage.

pub mod filter;
pub mod fm;

pub use filter::{low_pass, ComplexFirFilter};
pub use fm::FmDemodulator;

use crate::error::{StreamError, StreamResult};
use crate::listener::{deliver, Delivery, Listener};
use crate::module::{Module, ModuleStatus};
use num_complex::Complex32;
use parking_lot::{Mutex, RwLock};
use sdr_pool::ReusableBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Input rate the module's filter is designed for, in Hz.
pub const DEMODULATOR_SAMPLE_RATE: f64 = 48_000.0;

/// Stop-band attenuation of the designed filter, in dB.
pub const FILTER_ATTENUATION_DB: f64 = 60.0;

const NAME: &str = "fm_demodulator";

/// Output listener type: one demodulated block per input buffer.
pub type AudioListener = Arc<dyn Listener<Vec<f32>>>;

/// Filter band edges for an [`FmDemodulatorModule`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemodulatorConfig {
    /// Pass band edge in Hz
    #[serde(default = "default_pass")]
    pub pass: f64,
    /// Stop band edge in Hz
    #[serde(default = "default_stop")]
    pub stop: f64,
}

fn default_pass() -> f64 {
    5_000.0
}

fn default_stop() -> f64 {
    7_000.0
}

impl Default for DemodulatorConfig {
    fn default() -> Self {
        Self {
            pass: default_pass(),
            stop: default_stop(),
        }
    }
}

impl DemodulatorConfig {
    /// Check the band edges against the module's fixed input rate.
    pub fn validate(&self) -> StreamResult<()> {
        low_pass(
            DEMODULATOR_SAMPLE_RATE,
            self.pass,
            self.stop,
            FILTER_ATTENUATION_DB,
        )
        .map(|_| ())
    }
}

struct Stages {
    filter: ComplexFirFilter,
    demodulator: FmDemodulator,
}

/// Filter → FM discriminator → output listener.
pub struct FmDemodulatorModule {
    // `None` once disposed
    stages: Mutex<Option<Stages>>,
    output: RwLock<Option<AudioListener>>,
    status: Mutex<ModuleStatus>,
    blocks: AtomicU64,
    output_failures: AtomicU64,
}

impl fmt::Debug for FmDemodulatorModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FmDemodulatorModule")
            .field("status", &*self.status.lock())
            .field("blocks", &self.blocks())
            .finish()
    }
}

impl FmDemodulatorModule {
    /// Module whose filter passes `pass` Hz and stops from `stop` Hz at
    /// 48 kHz input.
    pub fn new(pass: f64, stop: f64) -> StreamResult<Self> {
        let coefficients = low_pass(DEMODULATOR_SAMPLE_RATE, pass, stop, FILTER_ATTENUATION_DB)?;
        debug!(pass, stop, taps = coefficients.len(), "Designed demodulator filter");
        Self::with_coefficients(coefficients)
    }

    /// Module from configured band edges.
    pub fn from_config(config: &DemodulatorConfig) -> StreamResult<Self> {
        Self::new(config.pass, config.stop)
    }

    /// Module using precomputed filter coefficients.
    pub fn with_coefficients(coefficients: Vec<f32>) -> StreamResult<Self> {
        let filter = ComplexFirFilter::new(coefficients, 1.0)?;
        Ok(Self {
            stages: Mutex::new(Some(Stages {
                filter,
                demodulator: FmDemodulator::new(1.0),
            })),
            output: RwLock::new(None),
            status: Mutex::new(ModuleStatus::Idle),
            blocks: AtomicU64::new(0),
            output_failures: AtomicU64::new(0),
        })
    }

    /// Set or replace the listener receiving demodulated audio.
    pub fn set_output_listener(&self, listener: AudioListener) -> StreamResult<()> {
        self.ensure_live()?;
        *self.output.write() = Some(listener);
        Ok(())
    }

    /// Stop delivering audio. Output is discarded until a listener is set.
    pub fn remove_output_listener(&self) -> StreamResult<()> {
        self.ensure_live()?;
        *self.output.write() = None;
        Ok(())
    }

    /// Filter and demodulate one buffer.
    ///
    /// The buffer is released before anything else happens, including the
    /// disposed check, so a disposed module never leaks pooled storage.
    /// Returns the number of audio samples produced.
    pub fn receive(&self, buffer: ReusableBuffer<Complex32>) -> StreamResult<usize> {
        let samples = buffer.copy_of_samples();
        buffer.release()?;

        let audio = {
            let mut stages = self.stages.lock();
            let stages = stages.as_mut().ok_or(StreamError::Disposed(NAME))?;
            let filtered = stages.filter.process(&samples);
            stages.demodulator.process(&filtered)
        };
        self.blocks.fetch_add(1, Ordering::Relaxed);

        let produced = audio.len();
        let output = self.output.read().clone();
        if let Some(output) = output {
            match deliver(output.as_ref(), audio) {
                Delivery::Delivered => {}
                Delivery::Failed(message) | Delivery::Panicked(message) => {
                    self.output_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %message, "Demodulator output listener failed");
                }
            }
        }
        Ok(produced)
    }

    /// Input buffers processed.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Output deliveries that failed.
    pub fn output_failures(&self) -> u64 {
        self.output_failures.load(Ordering::Relaxed)
    }

    fn ensure_live(&self) -> StreamResult<()> {
        if *self.status.lock() == ModuleStatus::Disposed {
            return Err(StreamError::Disposed(NAME));
        }
        Ok(())
    }

    fn transition(&self, to: ModuleStatus) -> StreamResult<()> {
        let mut status = self.status.lock();
        if *status == ModuleStatus::Disposed {
            return Err(StreamError::Disposed(NAME));
        }
        *status = to;
        Ok(())
    }
}

impl Module for FmDemodulatorModule {
    fn name(&self) -> &str {
        NAME
    }

    fn status(&self) -> ModuleStatus {
        *self.status.lock()
    }

    fn start(&self) -> StreamResult<()> {
        self.transition(ModuleStatus::Running)
    }

    fn stop(&self) -> StreamResult<()> {
        self.transition(ModuleStatus::Stopped)
    }

    /// Clears demodulator phase memory. The filter keeps its coefficients.
    fn reset(&self) -> StreamResult<()> {
        let mut stages = self.stages.lock();
        let stages = stages.as_mut().ok_or(StreamError::Disposed(NAME))?;
        stages.demodulator.reset();
        Ok(())
    }

    fn dispose(&self) -> StreamResult<()> {
        let mut status = self.status.lock();
        if *status == ModuleStatus::Disposed {
            return Err(StreamError::Disposed(NAME));
        }
        *status = ModuleStatus::Disposed;
        self.stages.lock().take();
        self.output.write().take();
        info!(blocks = self.blocks(), "FM demodulator disposed");
        Ok(())
    }
}

impl Listener<ReusableBuffer<Complex32>> for FmDemodulatorModule {
    fn receive(&self, item: ReusableBuffer<Complex32>) -> anyhow::Result<()> {
        FmDemodulatorModule::receive(self, item)?;
        Ok(())
    }
}
