//! Error types for the mediaflow runtime core

use std::os::fd::RawFd;
use thiserror::Error;

/// Main error type for scheduler and event loop operations
///
/// The delay queue itself never fails: stale handles and unknown tokens are
/// no-ops. Errors only come from the operating system side of the loop and
/// from invalid configuration.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// I/O error not tied to a specific descriptor
    #[error("I/O error: {source}")]
    Io {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },

    /// The readiness wait failed for a reason other than interruption
    #[error("Readiness wait failed: {source}")]
    Wait {
        /// Underlying error
        source: std::io::Error,
    },

    /// A descriptor could not be registered with the multiplexer
    #[error("Failed to register descriptor {descriptor}: {source}")]
    Registration {
        /// Descriptor that failed
        descriptor: RawFd,
        /// Underlying error
        source: std::io::Error,
    },

    /// All event trigger slots are in use
    #[error("Event trigger limit exceeded: {limit}")]
    TriggerLimitExceeded {
        /// Maximum number of triggers
        limit: usize,
    },

    /// Invalid configuration value
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration {
        /// Offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            RuntimeError::Io { .. } => "IO_ERROR".to_string(),
            RuntimeError::Wait { .. } => "WAIT_FAILED".to_string(),
            RuntimeError::Registration { .. } => "REGISTRATION_FAILED".to_string(),
            RuntimeError::TriggerLimitExceeded { .. } => "TRIGGER_LIMIT_EXCEEDED".to_string(),
            RuntimeError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = RuntimeError::TriggerLimitExceeded { limit: 32 };
        assert_eq!(err.error_code(), "TRIGGER_LIMIT_EXCEEDED");
        assert_eq!(err.to_string(), "Event trigger limit exceeded: 32");
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::Other, "poller gone");
        let err = RuntimeError::from(io_error);
        assert!(matches!(err, RuntimeError::Io { .. }));
        assert_eq!(err.error_code(), "IO_ERROR");
    }
}
