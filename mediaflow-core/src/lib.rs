//! # Mediaflow Core
//!
//! Time primitives, the delta-encoded delay queue, the cooperative alarm lock
//! and the single-threaded task scheduler the rest of the mediaflow runtime
//! runs on. Every callback in the runtime is invoked from
//! [`TaskScheduler::single_step`] on one thread.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod delay_queue;
pub mod error;
pub mod lock;
pub mod scheduler;
pub mod time;

// Re-export main types
pub use delay_queue::{DelayQueue, EntryHandle, FiredEntry, Token};
pub use error::{RuntimeError, RuntimeResult};
pub use lock::{CooperativeLock, ReadGuard, WriteGuard};
pub use scheduler::{
    ConditionSet, Descriptor, EventTrigger, EventTriggerId, SchedulerConfig, SchedulerStats,
    StopFlag, Task, TaskHandle, TaskScheduler, MAX_EVENT_TRIGGERS,
};
pub use time::{Clock, Instant, Interval, ManualClock, SystemClock};
