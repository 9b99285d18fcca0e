//! Structured logging setup

use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor a configured filter is present
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Filter used when debug logging is requested without an explicit filter
const DEBUG_LOG_FILTER: &str = "mediaflow=debug,mediaflow_core=debug,mediaflow_media=debug,info";

/// Builder for the process-wide `tracing` subscriber
#[derive(Debug, Clone, Default)]
pub struct DebugLogger {
    filter: Option<String>,
    debug: bool,
    with_target: bool,
}

impl DebugLogger {
    /// Create new debug logger
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `filter` (an `EnvFilter` directive string) unless `RUST_LOG` is set
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Raise the default level of the mediaflow crates to `debug`
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Include event targets in the output
    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    /// Directive string applied when `RUST_LOG` is unset
    pub fn directives(&self) -> &str {
        match &self.filter {
            Some(filter) => filter,
            None if self.debug => DEBUG_LOG_FILTER,
            None => DEFAULT_LOG_FILTER,
        }
    }

    /// Build the filter; `RUST_LOG` wins over the configured directives
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
            EnvFilter::builder().from_env_lossy()
        } else {
            EnvFilter::builder().parse_lossy(self.directives())
        }
    }

    /// Install the subscriber
    ///
    /// Returns `false` if a global subscriber was already installed, in
    /// which case the existing one is left alone.
    pub fn init(&self) -> bool {
        let installed = tracing_subscriber::fmt()
            .with_target(self.with_target)
            .with_env_filter(self.env_filter())
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!(filter = self.directives(), "logging initialised");
        }
        installed
    }
}

/// Initialize logging with an optional filter, keeping any existing subscriber
pub fn init_logging(filter: Option<&str>, debug: bool) -> bool {
    let mut logger = DebugLogger::new().with_debug(debug);
    if let Some(filter) = filter {
        logger = logger.with_filter(filter);
    }
    logger.init()
}
