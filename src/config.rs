//! Configuration loading using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file, `config/sdr_stream.toml` unless another path is given
//! 3. Environment variables prefixed with `SDR_STREAM_`, with `__`
//!    separating nested keys
//!
//! # Example
//! ```no_run
//! use sdr_stream::config::StreamConfig;
//!
//! // SDR_STREAM_PROCESSOR__CAPACITY=128 overrides [processor] capacity
//! let config = StreamConfig::load()?;
//! config.validate()?;
//! println!("Drain every {:?}", config.processor.distribution_interval);
//! # Ok::<(), sdr_stream::error::StreamError>(())
//! ```

use crate::channelizer::ChannelizerConfig;
use crate::demod::DemodulatorConfig;
use crate::error::{StreamError, StreamResult};
use crate::processor::ProcessorConfig;
use crate::tracing_init::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sdr_stream.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SDR_STREAM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Buffer pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
    /// Scheduled processor queue and cadence
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Channelizer input rate and channel count
    #[serde(default)]
    pub channelizer: ChannelizerConfig,
    /// Demodulator filter band edges
    #[serde(default)]
    pub demodulator: DemodulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Slots allocated up front
    #[serde(default = "default_preallocate")]
    pub preallocate: usize,
    /// Samples per wideband block
    #[serde(default = "default_block_len")]
    pub block_len: usize,
    /// Panic on ownership misuse instead of reporting it. Defaults to on in
    /// debug builds.
    #[serde(default)]
    pub strict: Option<bool>,
}

fn default_name() -> String {
    "sdr_stream".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_preallocate() -> usize {
    32
}

fn default_block_len() -> usize {
    4096
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preallocate: default_preallocate(),
            block_len: default_block_len(),
            strict: None,
        }
    }
}

impl StreamConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> StreamResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(StreamError::from)
    }

    /// The provider chain used by [`Self::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> StreamResult<()> {
        parse_log_level(&self.application.log_level)?;

        if self.pool.block_len == 0 {
            return Err(StreamError::configuration("pool block_len must be > 0"));
        }

        self.processor.validate()?;
        self.channelizer.validate()?;
        self.demodulator.validate()?;

        if self.pool.block_len < self.channelizer.channel_count {
            return Err(StreamError::Configuration(format!(
                "pool block_len ({}) is smaller than channel_count ({}); no block would produce output",
                self.pool.block_len, self.channelizer.channel_count
            )));
        }
        Ok(())
    }
}
