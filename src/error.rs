//! Error types for the parstor storage engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the parstor storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid array configuration (attach-time, fatal)
    #[error("Invalid array configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Data-path errors
    // =========================================================================
    /// Chunk buffer allocation failed
    #[error("Buffer allocation failed for size {size}: {reason}")]
    BufferAlloc { size: usize, reason: String },

    /// A device read or write failed
    #[error("Device I/O failed on {device}: {reason}")]
    DeviceIo { device: String, reason: String },

    /// Request falls outside the logical volume
    #[error("Request out of range: sector {sector} + {sectors} sectors exceeds capacity {capacity}")]
    OutOfRange {
        sector: u64,
        sectors: u64,
        capacity: u64,
    },

    /// Splitting a request into per-chunk sub-requests failed
    #[error("Request split failed at sector {sector}: {reason}")]
    SplitFailed { sector: u64, reason: String },

    /// A verify-path read could not complete
    #[error("Verify stage failed on {device}: {reason}")]
    VerifyRead { device: String, reason: String },

    // =========================================================================
    // Offload protocol errors
    // =========================================================================
    /// Mailbox contract violation: an illegal or skipped state transition,
    /// or a job that does not fit the single-chunk staging area. Unrecoverable
    /// and never retried, unlike ordinary device I/O errors.
    #[error("Offload protocol violation: {0}")]
    Protocol(String),

    /// The accelerator did not complete a submitted job within the
    /// configured deadline
    #[error("Offload job timed out after {waited_ms} ms")]
    OffloadTimeout { waited_ms: u64 },

    /// The parity engine has shut down and can accept no more jobs
    #[error("Parity engine stopped")]
    EngineStopped,
}

impl Error {
    /// Whether this error is an unrecoverable protocol violation rather
    /// than an ordinary I/O failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}
