use thiserror::Error;

/// Bump tracker error types
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Session not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures reported by a [`crate::store::RecordStore`] or map sink.
/// None of these abort a session; the reconciler logs and moves on.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("write failed: {0}")]
    Write(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;
