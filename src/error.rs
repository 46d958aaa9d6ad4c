//! Custom error types for the streaming core.
//!
//! `StreamError` covers the structural failures that propagate to the caller:
//!
//! - **`Configuration`**: invalid parameters caught at construction or during
//!   validation (e.g. a stop edge at or below the pass edge, a zero channel
//!   count). Values are never silently clamped.
//! - **`ConfigLoad`**: the figment provider chain could not produce a config.
//! - **`Pool`**: buffer ownership misuse reported by `sdr_pool`.
//! - **`Disposed`**: an operation reached a module after `dispose()`.
//! - **`ChannelMismatch`**: a channelizer transform disagrees with the
//!   configured channel count.
//!
//! Operational conditions (queue overflow, a failing downstream consumer) are
//! not errors here. They are absorbed where they happen and surfaced through
//! overflow notifications and logs.

use sdr_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Primary error type for the streaming core.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Invalid parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Provider chain failed to extract a config
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Buffer ownership misuse
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// Operation on a disposed module
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Transform output disagrees with the configured channel count
    #[error("Channelizer transform produces {actual} channels, expected {expected}")]
    ChannelMismatch {
        /// Configured channel count
        expected: usize,
        /// Channels the transform returned
        actual: usize,
    },
}

impl StreamError {
    /// Shorthand for a [`StreamError::Configuration`] error.
    pub fn configuration(message: impl Into<String>) -> Self {
        StreamError::Configuration(message.into())
    }
}

impl From<figment::Error> for StreamError {
    fn from(value: figment::Error) -> Self {
        StreamError::ConfigLoad(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_converts() {
        let err: StreamError = PoolError::OverRelease {
            pool: "iq".into(),
            slot: 3,
        }
        .into();
        assert!(matches!(err, StreamError::Pool(_)));
        assert!(err.to_string().contains("slot 3"));
    }

    #[test]
    fn test_disposed_message_names_component() {
        let err = StreamError::Disposed("FM demodulator module");
        assert_eq!(err.to_string(), "FM demodulator module has been disposed");
    }
}
