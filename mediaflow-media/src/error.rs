//! Media pipeline error types and handling
//!
//! Errors here are reported to the immediate caller only. Failures that
//! happen while a frame request is outstanding never cross the data-flow
//! boundary as errors: producers turn them into a `Closed` notification.

use mediaflow_core::RuntimeError;
use thiserror::Error;

/// Main error type for media pipeline operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Scheduler operation failed
    #[error("Scheduler error: {source}")]
    Runtime {
        #[from]
        source: RuntimeError,
    },

    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// A frame was requested while an earlier request is still outstanding
    #[error("Read already in progress on {source_name}")]
    ReadInProgress {
        /// Name of the source
        source_name: String,
    },

    /// A sink was started while already playing
    #[error("Sink {sink_name} is already playing")]
    AlreadyPlaying {
        /// Name of the sink
        sink_name: String,
    },

    /// An interleaved unit header did not start with the marker byte
    #[error("Invalid interleaved header: expected '$', got {found:#04x}")]
    InvalidInterleavedHeader {
        /// Byte found in the marker position
        found: u8,
    },

    /// Frame does not fit the packet format
    #[error("Frame too large: {size} bytes exceeds {limit}")]
    FrameTooLarge {
        /// Frame size in bytes
        size: usize,
        /// Largest size the format allows
        limit: usize,
    },

    /// Invalid state for operation
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MediaError::Io { .. } => true,
            MediaError::ReadInProgress { .. } => true,
            MediaError::AlreadyPlaying { .. } => true,
            MediaError::FrameTooLarge { .. } => true,
            MediaError::Runtime { .. } => false,
            MediaError::InvalidConfiguration { .. } => false,
            MediaError::InvalidInterleavedHeader { .. } => false,
            MediaError::InvalidState { .. } => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::Io { .. } => ErrorCategory::System,
            MediaError::Runtime { .. } => ErrorCategory::Scheduler,
            MediaError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            MediaError::ReadInProgress { .. } => ErrorCategory::State,
            MediaError::AlreadyPlaying { .. } => ErrorCategory::State,
            MediaError::InvalidInterleavedHeader { .. } => ErrorCategory::Format,
            MediaError::FrameTooLarge { .. } => ErrorCategory::Format,
            MediaError::InvalidState { .. } => ErrorCategory::State,
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            MediaError::Io { .. } => "IO_ERROR".to_string(),
            MediaError::Runtime { source } => source.error_code(),
            MediaError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION".to_string(),
            MediaError::ReadInProgress { .. } => "READ_IN_PROGRESS".to_string(),
            MediaError::AlreadyPlaying { .. } => "ALREADY_PLAYING".to_string(),
            MediaError::InvalidInterleavedHeader { .. } => "INVALID_INTERLEAVED_HEADER".to_string(),
            MediaError::FrameTooLarge { .. } => "FRAME_TOO_LARGE".to_string(),
            MediaError::InvalidState { .. } => "INVALID_STATE".to_string(),
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// System-level errors (I/O, permissions, etc.)
    System,
    /// Event loop and descriptor registration errors
    Scheduler,
    /// Configuration and parameter errors
    Configuration,
    /// Wire format errors
    Format,
    /// State management errors
    State,
}
