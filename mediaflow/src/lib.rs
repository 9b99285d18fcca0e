//! # mediaflow - Cooperative Media Streaming Runtime
//!
//! mediaflow runs media pipelines on a single-threaded event loop. Producers
//! and consumers exchange frames through an asynchronous request and
//! notification contract, timers and descriptor readiness are dispatched by
//! one [`TaskScheduler`], and packetizing sinks aggregate and fragment frames
//! through an [`OutPacketBuffer`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mediaflow::{ByteStreamConfig, ByteStreamSource, FileSink, MediaRuntime};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut runtime = MediaRuntime::init()?;
//!
//!     let input = std::fs::File::open("input.ts")?;
//!     let source = ByteStreamSource::new("file", input, ByteStreamConfig::default());
//!     let sink = FileSink::new("copy", std::fs::File::create("copy.ts")?, 100_000, false);
//!
//!     runtime.play_to_end(&sink, source)?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use mediaflow_core::{
    Clock, ConditionSet, CooperativeLock, DelayQueue, Descriptor, EventTrigger, EventTriggerId, Instant,
    Interval, ManualClock, RuntimeError, RuntimeResult, SchedulerConfig, SchedulerStats, StopFlag,
    SystemClock, Task, TaskHandle, TaskScheduler, Token,
};

pub use mediaflow_media::{
    encode_interleaved_header, fire, parse_interleaved_header, write_interleaved_unit, AfterPlaying,
    ByteStreamConfig, ByteStreamSource, Completion, DeliveredFrame, DescriptorSource, FileSink, FrameEvent,
    FrameRequest, FrameState, FramedSource, InterleavedFramer, InterleavedPacketSink, InterleavedPacketSinkConfig,
    MediaError, MediaResult, MediaSink, OutPacketBuffer, OutPacketBufferConfig, Playback, SharedSource,
    UnitQueueSource, INTERLEAVED_HEADER_LEN,
};

pub use mediaflow_diagnostics::{init_logging, DebugLogger, LoopProfiler, LoopSample, ProfilerConfig};

// Public API modules
pub mod bridge;
pub mod config;

// Re-export main API types
pub use bridge::{ChannelSink, ForwardedFrame, FrameReceiver};
pub use config::RuntimeConfig;

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::rc::Rc;
use tracing::{debug, info};

/// Main entry point for mediaflow
///
/// Owns the event loop. Everything built on it stays on the thread that
/// created the runtime; [`EventTrigger`], [`StopFlag`] and
/// [`FrameReceiver`] are the ways in and out from other threads.
pub struct MediaRuntime {
    scheduler: TaskScheduler,
    config: RuntimeConfig,
    profiler: Option<Rc<RefCell<LoopProfiler>>>,
}

impl MediaRuntime {
    /// Initialize mediaflow with default settings
    ///
    /// # Example
    /// ```rust,no_run
    /// use mediaflow::MediaRuntime;
    ///
    /// let runtime = MediaRuntime::init()?;
    /// # Ok::<(), mediaflow::MediaError>(())
    /// ```
    pub fn init() -> MediaResult<Self> {
        Self::init_with(RuntimeConfig::default())
    }

    /// Initialize with custom global configuration
    ///
    /// Installs the logging subscriber unless one is already present.
    pub fn init_with(config: RuntimeConfig) -> MediaResult<Self> {
        config.validate()?;
        init_logging(config.log_filter.as_deref(), config.debug_logging);

        let mut scheduler = TaskScheduler::with_config(config.scheduler.clone())?;
        let profiler = config.profiler.clone().map(|profiler_config| {
            let profiler = LoopProfiler::new(profiler_config);
            profiler.borrow_mut().start(&mut scheduler);
            profiler
        });
        info!(
            granularity_us = config.scheduler.max_granularity_us,
            profiling = profiler.is_some(),
            "media runtime initialised"
        );

        Ok(Self {
            scheduler,
            config,
            profiler,
        })
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The event loop
    pub fn scheduler(&mut self) -> &mut TaskScheduler {
        &mut self.scheduler
    }

    /// The loop profiler, if enabled
    pub fn profiler(&self) -> Option<&Rc<RefCell<LoopProfiler>>> {
        self.profiler.as_ref()
    }

    /// Packetizing sink sized by the runtime's packet configuration
    pub fn packet_sink<W: Write + 'static>(
        &self,
        name: impl Into<String>,
        writer: W,
        channel: u8,
    ) -> MediaResult<Rc<RefCell<InterleavedPacketSink<W>>>> {
        InterleavedPacketSink::new(
            name,
            writer,
            InterleavedPacketSinkConfig {
                channel,
                packet: self.config.packet.clone(),
                ..Default::default()
            },
        )
    }

    /// Start `sink` on `source` and run the loop until the source closes
    pub fn play_to_end<S: MediaSink + 'static>(
        &mut self,
        sink: &Rc<RefCell<S>>,
        source: SharedSource,
    ) -> MediaResult<()> {
        let done = StopFlag::new();
        let flag = done.clone();
        let after_playing: AfterPlaying = Box::new(move |_| flag.set());
        sink.borrow_mut()
            .start_playing(&mut self.scheduler, source, after_playing)?;
        self.run_until(&done)
    }

    /// Run the loop until `stop` is set
    pub fn run_until(&mut self, stop: &StopFlag) -> MediaResult<()> {
        self.scheduler.do_event_loop(Some(stop))?;
        debug!(stats = ?self.scheduler.stats(), "event loop stopped");
        Ok(())
    }
}

impl fmt::Debug for MediaRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaRuntime")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("profiling", &self.profiler.is_some())
            .finish()
    }
}

impl Drop for MediaRuntime {
    fn drop(&mut self) {
        if let Some(profiler) = &self.profiler {
            profiler.borrow_mut().stop(&mut self.scheduler);
        }
    }
}
