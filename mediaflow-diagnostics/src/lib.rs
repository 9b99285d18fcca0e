//! # mediaflow Diagnostics
//!
//! Logging initialisation and event-loop profiling for mediaflow.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod debug_logger;
pub mod loop_profiler;

// Re-export main types
pub use debug_logger::{init_logging, DebugLogger, DEFAULT_LOG_FILTER};
pub use loop_profiler::{LoopProfiler, LoopSample, ProfilerConfig};
