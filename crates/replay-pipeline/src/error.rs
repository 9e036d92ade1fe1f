//! Pipeline error types

use replay_model::SnapshotError;

/// Rejections raised when a record cannot be admitted to the queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Too many sequences are still awaiting resources
    #[error("record queue saturated with {pending} pending sequences")]
    Backpressure {
        /// Pending sequence count at rejection time
        pending: usize,
    },

    /// The sequence number does not advance past the last accepted one
    #[error("sequence {sequence} does not advance past {last_accepted}")]
    SequenceRegression {
        /// Offending sequence
        sequence: u64,
        /// Highest sequence accepted so far
        last_accepted: u64,
    },

    /// The queue has been shut down
    #[error("record queue is shut down")]
    ShuttingDown,
}

/// Why a capture tick was dropped
///
/// Every variant is a per-tick rejection; the pipeline itself stays
/// healthy and accepts the next tick.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The snapshot violated a structural invariant
    #[error("snapshot rejected: {0}")]
    InvalidSnapshot(#[from] SnapshotError),

    /// The merge queue refused the record
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Opaque delivery failure reported by a [`crate::RecordSink`]
///
/// Logged and swallowed by the emitter; a failing sink never stalls the
/// capture side.
#[derive(Debug, Clone, thiserror::Error)]
#[error("sink delivery failed: {0}")]
pub struct SinkError(pub String);

impl SinkError {
    /// Create an error from any displayable cause
    #[must_use]
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}
