//! Workspace-wide error type.

use thiserror::Error;

/// Errors shared by configuration loading and process setup.
///
/// Job-level failures live in `hopper_jobs::JobError`; this type covers
/// the things that go wrong before any job is dispatched.
#[derive(Error, Debug)]
pub enum HopperError {
    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem error while reading configuration or sources.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tracing subscriber could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HopperError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors that must abort process startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Telemetry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_is_fatal() {
        let err = HopperError::configuration("no queues defined");
        assert!(err.is_fatal());
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("no queues defined"));
    }

    #[test]
    fn test_io_error_is_not_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = HopperError::from(io);
        assert!(!err.is_fatal());
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_serialization_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = HopperError::from(serde_err);
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }
}
