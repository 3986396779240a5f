use thiserror::Error;

/// Errors surfaced by camera, recording, and conversion operations.
///
/// Backend/SDK failures are converted into these variants at the
/// `DeviceBackend` trait boundary; no raw device-layer error ever crosses
/// into the orchestration layer or its callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("device not available")]
    DeviceNotAvailable,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("recording session conflict: {0}")]
    SessionConflict(String),

    #[error("commit barrier broken or timed out")]
    BarrierBroken,

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("conversion job not found")]
    JobNotFound,

    #[error("timeout")]
    Timeout,

    #[error("unknown error: {0}")]
    Unknown(String),
}
