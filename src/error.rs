//! Custom error types for the controller.
//!
//! This module defines the primary error type, `ControllerError`, shared by the
//! transport session, the channel registry, the blocking-operation coordinator
//! and the facade. Using the `thiserror` crate, it provides one consistent
//! taxonomy for everything a caller can observe from the board.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: The serial link could not be opened or was lost. Fatal
//!   to the session.
//! - **`Transport`**: A single write failed. The session stays usable and the
//!   caller may retry.
//! - **`NotInitialized`**: A stepper or I2C call was made before the resource
//!   was set up. This is a programming error on the caller side.
//! - **`InvalidTransition`**: A channel already holds a different mode and the
//!   caller did not explicitly reconfigure it.
//! - **`Busy`**: The resource slot is held by another operation.
//! - **`Timeout`**: No completion frame arrived within the bound. The resource
//!   slot stays held until the firmware answers or the session shuts down.
//! - **`Aborted`**: The session was shut down while the operation was pending.
//!
//! Range clamping of output values is a documented quantization and never
//! produces an error.

use std::time::Duration;
use thiserror::Error;

use crate::registry::{ChannelId, PinMode};

/// Convenience alias for results using the controller error type.
pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ControllerError {
    #[error("Connection error on {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("Transport write failed: {0}")]
    Transport(#[source] std::io::Error),

    #[error("{0} is not initialized")]
    NotInitialized(String),

    #[error("Channel {channel} is in {current:?} mode, cannot switch to {requested:?} without reconfiguring")]
    InvalidTransition {
        channel: ChannelId,
        current: PinMode,
        requested: PinMode,
    },

    #[error("Resource {0} is busy")]
    Busy(String),

    #[error("Timed out after {timeout:?} waiting for {resource}")]
    Timeout { resource: String, timeout: Duration },

    #[error("Operation on {0} aborted by session shutdown")]
    Aborted(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,
}

impl ControllerError {
    /// True when the error leaves the session usable for a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::Transport(_) | ControllerError::Busy(_) | ControllerError::Timeout { .. }
        )
    }
}
