//! Error taxonomy of the acquisition engine.
//!
//! `LsmError` separates the failure classes callers handle differently:
//!
//! - **`StateMisuse`** / **`EmptyQueue`**: protocol errors (a setter after
//!   finalize, playing an unfinalized or empty queue). These are programming
//!   errors and surface immediately.
//! - **`OutOfBounds`** / **`ChannelOutOfRange`**: a value or channel index
//!   rejected before it reaches a waveform.
//! - **`Timeout`** / **`Hardware`**: recoverable device-side failures. The
//!   playback coordinator reports these as a `false` result instead so control
//!   loops can keep running.
//! - **`Recycler`**: stack pool errors, converted with `?` from
//!   [`RecyclerError`].
//! - **`Config`**: configuration loading or validation failures.

use std::time::Duration;

use lsm_pool::RecyclerError;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the engine error type.
pub type LsmResult<T> = std::result::Result<T, LsmError>;

/// Errors raised by the acquisition engine.
#[derive(Error, Debug)]
pub enum LsmError {
    /// An operation was called in a phase that does not allow it.
    #[error("'{operation}' is not allowed while the queue is {phase}")]
    StateMisuse {
        /// Rejected operation.
        operation: &'static str,
        /// Phase the queue was in.
        phase: String,
    },

    /// Playback of a queue holding no snapshots.
    #[error("queue is empty, nothing to play")]
    EmptyQueue,

    /// A stave was placed beyond the movement's channel capacity.
    #[error("channel {index} out of range (movement has {capacity} channels)")]
    ChannelOutOfRange {
        /// Requested channel.
        index: usize,
        /// Channel capacity.
        capacity: usize,
    },

    /// A DOF value outside its configured bounds.
    #[error("{dof} = {value} outside bounds [{min}, {max}]")]
    OutOfBounds {
        /// DOF name, e.g. `lightsheet[0].z`.
        dof: String,
        /// Rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// A device index with no matching device.
    #[error("no {kind} with index {index}")]
    DeviceNotFound {
        /// Device kind, e.g. `camera`.
        kind: &'static str,
        /// Requested index.
        index: usize,
    },

    /// A deadline elapsed.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Deadline.
        timeout: Duration,
    },

    /// A device reported failure.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// A parameter rejected a value (read-only, validator, JSON type).
    #[error("parameter error: {0}")]
    Parameter(String),

    /// The operation was cancelled through a cancel flag.
    #[error("operation cancelled")]
    Cancelled,

    /// Stack recycler failure.
    #[error(transparent)]
    Recycler(#[from] RecyclerError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LsmError {
    /// Whether the error is a protocol misuse (a caller bug) rather than a
    /// runtime condition.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::StateMisuse { .. } | Self::EmptyQueue)
    }
}
