//! Event-loop profiling
//!
//! A [`LoopProfiler`] runs as a periodic delayed task on the scheduler it
//! observes. Each tick samples [`SchedulerStats`], logs the deltas since the
//! previous tick at `info`, and keeps a bounded history that can be exported
//! as JSON.

use mediaflow_core::{Instant, SchedulerStats, TaskHandle, TaskScheduler};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use tracing::{debug, info};

/// Profiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Time between samples in microseconds
    pub interval_us: u64,
    /// Number of samples kept
    pub history: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            interval_us: 1_000_000,
            history: 60,
        }
    }
}

/// One profiler tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopSample {
    /// Scheduler time of the sample
    pub at: Instant,
    /// Microseconds covered since the previous sample
    pub window_us: u64,
    /// Loop iterations in the window
    pub iterations: u64,
    /// Descriptor handlers run in the window
    pub descriptor_dispatches: u64,
    /// Trigger handlers run in the window
    pub trigger_dispatches: u64,
    /// Delayed tasks run in the window
    pub timer_dispatches: u64,
    /// Delayed tasks queued at sample time
    pub pending_tasks: u64,
    /// Descriptors registered at sample time
    pub registered_descriptors: u64,
}

impl LoopSample {
    /// Loop iterations per second over the window
    pub fn iterations_per_sec(&self) -> f64 {
        if self.window_us == 0 {
            return 0.0;
        }
        self.iterations as f64 * 1_000_000.0 / self.window_us as f64
    }
}

/// Periodic sampler of scheduler counters
pub struct LoopProfiler {
    config: ProfilerConfig,
    history: VecDeque<LoopSample>,
    last: Option<(Instant, SchedulerStats)>,
    task: Option<TaskHandle>,
    self_ref: Weak<RefCell<Self>>,
}

impl LoopProfiler {
    /// Create a stopped profiler
    pub fn new(config: ProfilerConfig) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                history: VecDeque::with_capacity(config.history),
                config,
                last: None,
                task: None,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Start sampling every `interval_us`
    pub fn start(&mut self, sched: &mut TaskScheduler) {
        if self.task.is_some() {
            return;
        }
        debug!(interval_us = self.config.interval_us, "loop profiler started");
        self.last = Some((sched.now(), sched.stats()));
        self.schedule_tick(sched);
    }

    /// Stop sampling; the history is kept
    pub fn stop(&mut self, sched: &mut TaskScheduler) {
        if let Some(task) = self.task.take() {
            sched.unschedule_delayed_task(task);
            debug!(samples = self.history.len(), "loop profiler stopped");
        }
    }

    /// Whether a tick is scheduled
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Take a sample now
    pub fn sample(&mut self, sched: &TaskScheduler) -> LoopSample {
        let now = sched.now();
        let stats = sched.stats();
        let (since, before) = self.last.unwrap_or((now, SchedulerStats::default()));
        let sample = LoopSample {
            at: now,
            window_us: (now - since).as_micros(),
            iterations: stats.iterations - before.iterations,
            descriptor_dispatches: stats.descriptor_dispatches - before.descriptor_dispatches,
            trigger_dispatches: stats.trigger_dispatches - before.trigger_dispatches,
            timer_dispatches: stats.timer_dispatches - before.timer_dispatches,
            pending_tasks: stats.pending_tasks,
            registered_descriptors: stats.registered_descriptors,
        };
        self.last = Some((now, stats));

        if self.config.history > 0 {
            if self.history.len() == self.config.history {
                self.history.pop_front();
            }
            self.history.push_back(sample);
        }
        info!(
            iterations = sample.iterations,
            per_sec = sample.iterations_per_sec(),
            timers = sample.timer_dispatches,
            descriptors = sample.descriptor_dispatches,
            triggers = sample.trigger_dispatches,
            pending = sample.pending_tasks,
            "event loop sample"
        );
        sample
    }

    /// Retained samples, oldest first
    pub fn history(&self) -> impl Iterator<Item = &LoopSample> {
        self.history.iter()
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&LoopSample> {
        self.history.back()
    }

    /// Retained samples as a JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.history)
    }

    fn schedule_tick(&mut self, sched: &mut TaskScheduler) {
        let weak = self.self_ref.clone();
        let delay = i64::try_from(self.config.interval_us).unwrap_or(i64::MAX);
        self.task = Some(sched.schedule_delayed_task(delay, move |sched| {
            let Some(profiler) = weak.upgrade() else {
                return;
            };
            let mut profiler = profiler.borrow_mut();
            profiler.task = None;
            profiler.sample(sched);
            profiler.schedule_tick(sched);
        }));
    }
}
