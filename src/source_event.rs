//! Control events travelling alongside sample data.

use crate::listener::Listener;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Change in the characteristics of a sample source.
///
/// The channelizer announces its per-channel rate to channel consumers with
/// [`SourceEvent::SampleRateChange`] before any dispatch computed at that rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceEvent {
    /// Samples now arrive at `sample_rate` Hz
    SampleRateChange {
        /// New rate in Hz
        sample_rate: f64,
    },
    /// Tuned center frequency changed
    FrequencyChange {
        /// New center frequency in Hz
        frequency: u64,
    },
    /// Free-form notification
    Notification(String),
}

impl fmt::Display for SourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceEvent::SampleRateChange { sample_rate } => {
                write!(f, "sample rate change: {sample_rate} Hz")
            }
            SourceEvent::FrequencyChange { frequency } => {
                write!(f, "frequency change: {frequency} Hz")
            }
            SourceEvent::Notification(message) => write!(f, "notification: {message}"),
        }
    }
}

/// Something that wants to hear about [`SourceEvent`]s through a listener it owns.
pub trait SourceEventProvider: Send + Sync {
    /// The listener that should receive events on this component's behalf.
    fn source_event_listener(&self) -> Arc<dyn Listener<SourceEvent>>;
}
