//! Error taxonomy for device setup, streaming and decoding.

use thiserror::Error;

use crate::traits::FourCC;

/// Error type for capture operations.
///
/// Setup-phase variants (open through allocation) are fatal to the pipeline.
/// Steady-state variants are classified by [`CaptureError::is_fatal`].
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node could not be opened or is not a capture device.
    #[error("failed to open {path}: {reason}")]
    OpenFailed {
        /// Device node path.
        path: String,
        /// Underlying cause.
        reason: String,
    },
    /// Capability query failed or reported an unusable device.
    #[error("capability query failed: {0}")]
    QueryFailed(String),
    /// Reading the active format failed.
    #[error("format query failed: {0}")]
    FormatQueryFailed(String),
    /// Re-applying the format failed.
    #[error("format set failed: {0}")]
    FormatSetFailed(String),
    /// The negotiated format cannot be used for capture.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// Buffer request, query or mapping failed.
    #[error("buffer allocation failed: {0}")]
    AllocFailed(String),
    /// Queuing the initial buffers or the stream-on command failed.
    #[error("stream on failed: {0}")]
    StreamOnFailed(String),
    /// Waiting for a completed buffer failed.
    #[error("dequeue failed: {0}")]
    DequeueFailed(String),
    /// Returning a buffer to the device failed.
    #[error("requeue of buffer {index} failed: {reason}")]
    RequeueFailed {
        /// Index of the buffer that is still application-owned.
        index: u32,
        /// Underlying cause.
        reason: String,
    },
    /// The pixel encoding is outside the supported set.
    #[error("unsupported pixel encoding {0}")]
    UnsupportedEncoding(FourCC),
    /// The buffer is missing, empty, too short or owned by the device.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),
    /// A capture call was made while the stream is idle.
    #[error("stream is not running")]
    NotStreaming,
}

impl CaptureError {
    /// Whether a capture loop must stop after this error.
    ///
    /// Requeue and per-frame decode failures leave the other buffers usable.
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::RequeueFailed { .. } | Self::UnsupportedEncoding(_) | Self::InvalidBuffer(_)
        )
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
