//! Core Error Types

use thiserror::Error;

/// Errors that can occur in the SoundBridge transport core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("No audio devices found")]
    NoDevicesFound,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to play audio stream: {0}")]
    StreamPlayError(String),

    #[error("Invalid audio configuration: {0}")]
    ConfigError(String),

    #[error("Unsupported sample format tag: {0}")]
    UnsupportedDtype(u32),

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NoDevicesFound;
        assert!(err.to_string().contains("No audio devices"));

        let err = CoreError::DeviceNotFound("Test Device".into());
        assert!(err.to_string().contains("Test Device"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Socket(_)));
    }
}
