use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PagecastError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("System error: {message}")]
    System { message: String },
}

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Failed to open connection to {address}: {details}")]
    OpenFailed { address: String, details: String },

    #[error("Connection is not ready")]
    NotReady,

    #[error("Connection has been closed")]
    Closed,

    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Send failed: {details}")]
    SendFailed { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Capture timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Capture failed: {details}")]
    Failed { details: String },

    #[error("Source {source_id} does not support screencast")]
    ScreencastUnsupported { source_id: String },

    #[error("Acknowledgment of frame {frame_index} failed: {details}")]
    AckFailed { frame_index: u64, details: String },

    #[error("Capture source is no longer available")]
    SourceUnavailable,

    #[error("Frame encoding failed: {details}")]
    Encoding { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Session {session_id} already exists")]
    AlreadyRunning { session_id: String },

    #[error("Session {session_id} not found")]
    NotFound { session_id: String },

    #[error("No capture source available for session {session_id}")]
    NoSource { session_id: String },
}

impl PagecastError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Transient capture, acknowledgment and connection faults degrade the
    /// stream instead of ending it. Everything else is fatal to the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Capture(CaptureError::SourceUnavailable) => false,
            Self::Capture(CaptureError::ScreencastUnsupported { .. }) => false,
            Self::Capture(_) => true,
            Self::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PagecastError>;
