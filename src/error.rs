use crate::xps::protocol::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlyError {
    #[error("IO error: {context}: {source}")]
    Transport {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection timeout")]
    Timeout,
    #[error("Gave up waiting: {0}")]
    WaitTimeout(String),
    #[error("Device error {code} on {command}: {message}")]
    Device {
        code: StatusCode,
        command: String,
        message: String,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid parameters: {0}")]
    Validation(String),
    #[error("Unknown axis: {0}")]
    UnknownAxis(String),
    #[error("Unknown or unusable group: {0}")]
    UnknownGroup(String),
    #[error("File transfer failed: {0}")]
    Transfer(String),
    #[error("Trajectory verification failed for {file}: {message}")]
    Verify { file: String, message: String },
    #[error("Trajectory not defined/verified")]
    NotVerified,
    #[error("A trajectory leg is already running")]
    AlreadyRunning,
    #[error("Unable to complete the scan due to hardware issues")]
    IncompleteRun,
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
    #[error("Hardware fault: {0}")]
    HardwareFault(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Detector error: {0}")]
    Detector(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlyError {
    /// Whether the error came from the socket rather than the controller.
    ///
    /// Transport errors may be retried; device errors generally may not.
    /// [`FlyError::WaitTimeout`] is a logical deadline and never counts.
    pub fn is_transport(&self) -> bool {
        matches!(self, FlyError::Transport { .. } | FlyError::Timeout)
    }

    pub(crate) fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        if matches!(
            source.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return FlyError::Timeout;
        }
        FlyError::Transport {
            source,
            context: context.into(),
        }
    }
}

impl From<std::io::Error> for FlyError {
    fn from(source: std::io::Error) -> Self {
        FlyError::io(source, "socket I/O")
    }
}

impl From<config::ConfigError> for FlyError {
    fn from(e: config::ConfigError) -> Self {
        FlyError::Config(e.to_string())
    }
}
