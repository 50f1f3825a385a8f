//! Error types for log operations.

use std::path::PathBuf;

/// Errors that can occur while appending to or replaying a log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// IO error during a write, flush, or delete.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload too large to ever fit in a segment.
    ///
    /// Fatal for the offending append; never retried. The caller must
    /// reduce the payload size or reconfigure `segment_capacity_bytes`.
    #[error("payload of {payload_len} bytes exceeds the segment payload limit of {max_payload} bytes")]
    CapacityExceeded {
        /// Length of the rejected payload.
        payload_len: usize,
        /// Largest payload a single segment can hold under the current
        /// configuration.
        max_payload: usize,
    },

    /// Checksum mismatch in a frame that is not part of the crash tail.
    ///
    /// The log is inconsistent; replay aborts at the first bad offset
    /// rather than skipping past it.
    #[error("integrity violation at offset {offset} in segment {segment_id}: {reason}")]
    IntegrityViolation {
        /// Offset of the first record that failed validation.
        offset: u64,
        /// Segment containing the corrupt frame.
        segment_id: u64,
        /// Description of the failed check.
        reason: String,
    },

    /// The log directory is already locked by another process.
    #[error("log directory {path} is locked by another process")]
    Locked {
        /// The contended directory.
        path: PathBuf,
    },

    /// A segment file on disk has an unusable header.
    #[error("invalid segment file {path}: {reason}")]
    InvalidSegment {
        /// Path of the offending file.
        path: PathBuf,
        /// What made the header unusable.
        reason: String,
    },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation on a log that has been closed.
    #[error("log is closed")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type WalResult<T> = Result<T, WalError>;
