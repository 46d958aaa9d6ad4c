//! Lifecycle interface shared by processing modules.
//!
//! A module is a processing stage that can be placed in a pipeline and
//! driven through a common lifecycle:
//!
//! ```text
//! Idle ──start()──> Running ──stop()──> Stopped
//!   │                  │                   │
//!   └──────────────────┴──dispose()────────┴──> Disposed (terminal)
//! ```
//!
//! `reset()` clears signal state without leaving the current status. Once
//! disposed, every lifecycle call fails with [`StreamError::Disposed`].
//!
//! [`StreamError::Disposed`]: crate::error::StreamError::Disposed

use crate::error::StreamResult;
use serde::{Deserialize, Serialize};

/// The current status of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleStatus {
    /// Created, never started
    Idle,
    /// Started
    Running,
    /// Stopped; may be started again
    Stopped,
    /// Resources released; unusable
    Disposed,
}

/// Base trait for pipeline modules.
///
/// Modules must be `Send + Sync` so they can be shared via `Arc` between the
/// producer side and the scheduled dispatch side.
pub trait Module: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Current lifecycle status.
    fn status(&self) -> ModuleStatus;

    /// Begin processing.
    fn start(&self) -> StreamResult<()>;

    /// Stop processing.
    fn stop(&self) -> StreamResult<()>;

    /// Clear internal signal state.
    fn reset(&self) -> StreamResult<()>;

    /// Release resources. Every later call fails.
    fn dispose(&self) -> StreamResult<()>;
}
