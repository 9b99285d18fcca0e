//! Single-threaded cooperative task scheduler
//!
//! The scheduler owns the delay queue for timed tasks and a `polling`
//! multiplexer for descriptor readiness. Each loop iteration waits once, for
//! at most the time until the next timed task, then runs at most one
//! callback: a ready descriptor handler, else a pending event trigger, else
//! the next due timed task. Everything that happens in the runtime happens
//! inside one of those callbacks.

use crate::delay_queue::{DelayQueue, EntryHandle, Token};
use crate::error::{RuntimeError, RuntimeResult};
use crate::time::{Clock, Instant, Interval, SystemClock};
use polling::{Event, Events, Poller};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::BitOr;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Descriptor type accepted for background handling
pub type Descriptor = RawFd;

/// Maximum number of concurrently registered event triggers
pub const MAX_EVENT_TRIGGERS: usize = 32;

/// Deferred unit of work run on the loop thread
pub type Task = Box<dyn FnOnce(&mut TaskScheduler)>;

type BackgroundHandler = Box<dyn FnMut(&mut TaskScheduler, ConditionSet)>;
type TriggerHandler = Box<dyn FnMut(&mut TaskScheduler)>;

/// Set of readiness conditions for a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConditionSet(u8);

impl ConditionSet {
    /// No conditions
    pub const NONE: ConditionSet = ConditionSet(0);
    /// Descriptor is readable
    pub const READABLE: ConditionSet = ConditionSet(1);
    /// Descriptor is writable
    pub const WRITABLE: ConditionSet = ConditionSet(1 << 1);
    /// Error or hang-up reported without read or write readiness
    pub const EXCEPTION: ConditionSet = ConditionSet(1 << 2);

    /// Whether every condition in `other` is present
    pub fn contains(&self, other: ConditionSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no condition is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ConditionSet {
    type Output = ConditionSet;

    fn bitor(self, rhs: ConditionSet) -> ConditionSet {
        ConditionSet(self.0 | rhs.0)
    }
}

/// Handle to a scheduled delayed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(EntryHandle);

impl TaskHandle {
    /// Token of the underlying delay queue entry
    pub fn token(&self) -> Token {
        self.0.token()
    }
}

/// Identifier of a registered event trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTriggerId(usize);

impl EventTriggerId {
    fn mask(&self) -> u32 {
        1 << self.0
    }
}

/// Thread-safe handle that fires an event trigger and wakes the loop
///
/// The trigger's handler still runs on the loop thread, during a later
/// iteration.
#[derive(Clone)]
pub struct EventTrigger {
    id: EventTriggerId,
    pending: Arc<AtomicU32>,
    poller: Arc<Poller>,
}

impl EventTrigger {
    /// Mark the trigger pending and interrupt the current wait
    pub fn fire(&self) {
        self.pending.fetch_or(self.id.mask(), Ordering::AcqRel);
        if let Err(e) = self.poller.notify() {
            warn!("Failed to wake event loop for trigger {:?}: {}", self.id, e);
        }
    }

    /// Trigger this handle fires
    pub fn id(&self) -> EventTriggerId {
        self.id
    }
}

impl fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTrigger").field("id", &self.id).finish()
    }
}

/// Flag that ends [`TaskScheduler::do_event_loop`]
///
/// Clones share the flag; it may be set from any thread. The loop notices it
/// within one scheduler granularity.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
}

impl StopFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Reset so the flag can be reused
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on a single wait in microseconds (0 = bounded only by timers)
    pub max_granularity_us: u64,
    /// Capacity of the readiness event buffer per wait
    pub max_events_per_wait: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_granularity_us: 10_000,
            max_events_per_wait: 64,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for values the loop cannot run with
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_events_per_wait == 0 {
            return Err(RuntimeError::InvalidConfiguration {
                field: "max_events_per_wait".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn granularity(&self) -> Option<Interval> {
        (self.max_granularity_us > 0).then(|| Interval::from_micros(self.max_granularity_us))
    }
}

/// Event loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Loop iterations run
    pub iterations: u64,
    /// Descriptor handlers invoked
    pub descriptor_dispatches: u64,
    /// Event trigger handlers invoked
    pub trigger_dispatches: u64,
    /// Delayed tasks run
    pub timer_dispatches: u64,
    /// Delayed tasks currently queued
    pub pending_tasks: u64,
    /// Descriptors with background handling
    pub registered_descriptors: u64,
}

struct HandlerRecord {
    conditions: ConditionSet,
    handler: Option<BackgroundHandler>,
    generation: u64,
}

struct TriggerRecord {
    handler: Option<TriggerHandler>,
    generation: u64,
}

/// Cooperative scheduler driving every callback in the runtime
pub struct TaskScheduler {
    queue: DelayQueue<Task>,
    poller: Arc<Poller>,
    events: Events,
    handlers: BTreeMap<Descriptor, HandlerRecord>,
    last_handled: Option<Descriptor>,
    descriptor_ran_last: bool,
    triggers: Vec<Option<TriggerRecord>>,
    pending_triggers: Arc<AtomicU32>,
    last_trigger: usize,
    next_generation: u64,
    config: SchedulerConfig,
    stats: SchedulerStats,
}

impl TaskScheduler {
    /// Create a scheduler with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with custom configuration
    pub fn with_config(config: SchedulerConfig) -> RuntimeResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a scheduler whose timers follow `clock`
    pub fn with_clock(config: SchedulerConfig, clock: impl Clock + 'static) -> RuntimeResult<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_events_per_wait).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            queue: DelayQueue::with_clock(clock),
            poller: Arc::new(Poller::new()?),
            events: Events::with_capacity(capacity),
            handlers: BTreeMap::new(),
            last_handled: None,
            descriptor_ran_last: false,
            triggers: (0..MAX_EVENT_TRIGGERS).map(|_| None).collect(),
            pending_triggers: Arc::new(AtomicU32::new(0)),
            last_trigger: MAX_EVENT_TRIGGERS - 1,
            next_generation: 1,
            config,
            stats: SchedulerStats::default(),
        })
    }

    /// Current time on the scheduler's clock
    pub fn now(&self) -> Instant {
        self.queue.now()
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Snapshot of the loop counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending_tasks: self.queue.len() as u64,
            registered_descriptors: self.handlers.len() as u64,
            ..self.stats
        }
    }

    // ------------------------------------------------------------------
    // Delayed tasks
    // ------------------------------------------------------------------

    /// Run `task` once, `delay_us` microseconds from now
    ///
    /// Negative delays are treated as zero.
    pub fn schedule_delayed_task(
        &mut self,
        delay_us: i64,
        task: impl FnOnce(&mut TaskScheduler) + 'static,
    ) -> TaskHandle {
        let handle = self
            .queue
            .add_entry(Interval::from_signed_micros(delay_us), Box::new(task));
        trace!(token = %handle.token(), delay_us, "scheduled delayed task");
        TaskHandle(handle)
    }

    /// Cancel a delayed task; returns `false` if it already ran or was cancelled
    pub fn unschedule_delayed_task(&mut self, handle: TaskHandle) -> bool {
        self.queue.remove_entry(handle.0).is_some()
    }

    /// Cancel the task in `slot` (if any) and schedule `task` in its place
    pub fn reschedule_delayed_task(
        &mut self,
        slot: &mut Option<TaskHandle>,
        delay_us: i64,
        task: impl FnOnce(&mut TaskScheduler) + 'static,
    ) {
        if let Some(previous) = slot.take() {
            self.unschedule_delayed_task(previous);
        }
        *slot = Some(self.schedule_delayed_task(delay_us, task));
    }

    /// Whether a delayed task is still waiting to run
    pub fn is_task_pending(&self, handle: TaskHandle) -> bool {
        self.queue.time_remaining(handle.0).is_some()
    }

    /// Time until the next delayed task is due
    pub fn time_to_next_task(&self) -> Interval {
        self.queue.time_to_next_alarm()
    }

    // ------------------------------------------------------------------
    // Background descriptor handling
    // ------------------------------------------------------------------

    /// Call `handler` whenever `descriptor` meets any of `conditions`
    ///
    /// Replaces an existing registration for the descriptor. An empty
    /// condition set disables handling.
    pub fn set_background_handling(
        &mut self,
        descriptor: Descriptor,
        conditions: ConditionSet,
        handler: impl FnMut(&mut TaskScheduler, ConditionSet) + 'static,
    ) -> RuntimeResult<()> {
        if conditions.is_empty() {
            self.disable_background_handling(descriptor);
            return Ok(());
        }

        let interest = interest_event(descriptor, conditions);
        let result = if self.handlers.contains_key(&descriptor) {
            self.poller.modify(borrow_descriptor(descriptor), interest)
        } else {
            // SAFETY: the caller keeps the descriptor open until it turns
            // background handling off again.
            unsafe { self.poller.add(descriptor, interest) }
        };
        result.map_err(|source| RuntimeError::Registration { descriptor, source })?;

        let generation = self.next_generation();
        self.handlers.insert(
            descriptor,
            HandlerRecord {
                conditions,
                handler: Some(Box::new(handler)),
                generation,
            },
        );
        debug!(descriptor, ?conditions, "background handling enabled");
        Ok(())
    }

    /// Stop monitoring `descriptor`; a no-op if it is not registered
    pub fn disable_background_handling(&mut self, descriptor: Descriptor) {
        if self.handlers.remove(&descriptor).is_none() {
            return;
        }
        if let Err(e) = self.poller.delete(borrow_descriptor(descriptor)) {
            // Closing a descriptor removes it from the poller on its own.
            trace!(descriptor, "poller delete failed: {}", e);
        }
        debug!(descriptor, "background handling disabled");
    }

    /// Call `handler` whenever `descriptor` becomes readable
    pub fn turn_on_background_read_handling(
        &mut self,
        descriptor: Descriptor,
        handler: impl FnMut(&mut TaskScheduler, ConditionSet) + 'static,
    ) -> RuntimeResult<()> {
        self.set_background_handling(descriptor, ConditionSet::READABLE, handler)
    }

    /// Stop read handling for `descriptor`
    pub fn turn_off_background_read_handling(&mut self, descriptor: Descriptor) {
        self.disable_background_handling(descriptor);
    }

    /// Transfer the registration of `old` (handler and conditions) to `new`
    pub fn move_socket_handling(&mut self, old: Descriptor, new: Descriptor) -> RuntimeResult<()> {
        let Some(record) = self.handlers.remove(&old) else {
            return Ok(());
        };
        if let Err(e) = self.poller.delete(borrow_descriptor(old)) {
            trace!(descriptor = old, "poller delete failed: {}", e);
        }
        if let Some(previous) = self.handlers.remove(&new) {
            drop(previous);
            if let Err(e) = self.poller.delete(borrow_descriptor(new)) {
                trace!(descriptor = new, "poller delete failed: {}", e);
            }
        }

        // SAFETY: as for `set_background_handling`.
        unsafe { self.poller.add(new, interest_event(new, record.conditions)) }
            .map_err(|source| RuntimeError::Registration {
                descriptor: new,
                source,
            })?;
        if self.last_handled == Some(old) {
            self.last_handled = Some(new);
        }
        self.handlers.insert(new, record);
        debug!(old, new, "background handling moved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event triggers
    // ------------------------------------------------------------------

    /// Register a handler run on the loop thread each time the trigger fires
    pub fn create_event_trigger(
        &mut self,
        handler: impl FnMut(&mut TaskScheduler) + 'static,
    ) -> RuntimeResult<EventTriggerId> {
        let start = self.last_trigger;
        for offset in 1..=MAX_EVENT_TRIGGERS {
            let index = (start + offset) % MAX_EVENT_TRIGGERS;
            if self.triggers[index].is_none() {
                let generation = self.next_generation();
                self.triggers[index] = Some(TriggerRecord {
                    handler: Some(Box::new(handler)),
                    generation,
                });
                self.last_trigger = index;
                debug!(trigger = index, "event trigger created");
                return Ok(EventTriggerId(index));
            }
        }
        Err(RuntimeError::TriggerLimitExceeded {
            limit: MAX_EVENT_TRIGGERS,
        })
    }

    /// Remove a trigger and discard it if pending
    pub fn delete_event_trigger(&mut self, id: EventTriggerId) {
        self.pending_triggers.fetch_and(!id.mask(), Ordering::AcqRel);
        if self.triggers[id.0].take().is_some() {
            debug!(trigger = id.0, "event trigger deleted");
        }
    }

    /// Fire a trigger from the loop thread
    pub fn trigger_event(&self, id: EventTriggerId) {
        self.pending_triggers.fetch_or(id.mask(), Ordering::AcqRel);
    }

    /// Handle for firing `id` from another thread
    pub fn event_trigger(&self, id: EventTriggerId) -> Option<EventTrigger> {
        self.triggers[id.0].as_ref().map(|_| EventTrigger {
            id,
            pending: self.pending_triggers.clone(),
            poller: self.poller.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Run iterations until `stop` is set; forever when `stop` is `None`
    pub fn do_event_loop(&mut self, stop: Option<&StopFlag>) -> RuntimeResult<()> {
        debug!("entering event loop");
        while !stop.is_some_and(StopFlag::is_set) {
            self.single_step(None)?;
        }
        debug!(iterations = self.stats.iterations, "event loop stopped");
        Ok(())
    }

    /// Wait once and run at most one callback
    ///
    /// Ready descriptors come first, then event triggers, then the due
    /// delayed task. When a descriptor ran on the previous iteration and a
    /// task is already due, the task runs instead. `max_delay` further
    /// bounds the wait.
    pub fn single_step(&mut self, max_delay: Option<Interval>) -> RuntimeResult<()> {
        self.stats.iterations += 1;

        let mut timeout = self.queue.time_to_next_alarm();
        if let Some(granularity) = self.config.granularity() {
            timeout = timeout.min(granularity);
        }
        if let Some(max_delay) = max_delay {
            timeout = timeout.min(max_delay);
        }
        if self.pending_triggers.load(Ordering::Acquire) != 0 {
            timeout = Interval::ZERO;
        }

        self.events.clear();
        match self.poller.wait(&mut self.events, timeout.as_timeout()) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(source) => return Err(RuntimeError::Wait { source }),
        }

        let ready = self.collect_ready();
        if let Some((descriptor, conditions)) = self.next_ready(&ready) {
            // A due timer takes every other turn from a descriptor that
            // stays ready, so it cannot be starved.
            let timer_due = self.queue.time_to_next_alarm().is_zero();
            if self.descriptor_ran_last && timer_due && self.dispatch_timer() {
                return Ok(());
            }
            self.dispatch_descriptor(descriptor, conditions);
            return Ok(());
        }
        if self.dispatch_trigger() {
            return Ok(());
        }
        self.dispatch_timer();
        Ok(())
    }

    fn dispatch_timer(&mut self) -> bool {
        let Some(entry) = self.queue.handle_alarm() else {
            return false;
        };
        self.descriptor_ran_last = false;
        self.stats.timer_dispatches += 1;
        trace!(token = %entry.token, "running delayed task");
        (entry.payload)(self);
        true
    }

    /// Map reported events onto registrations and re-arm them
    fn collect_ready(&mut self) -> Vec<(Descriptor, ConditionSet)> {
        let reported: Vec<(Descriptor, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.key as Descriptor, event.readable, event.writable))
            .collect();

        let mut ready = Vec::with_capacity(reported.len());
        for (descriptor, readable, writable) in reported {
            let Some(record) = self.handlers.get(&descriptor) else {
                continue;
            };
            let interest = record.conditions;
            let mut conditions = ConditionSet::NONE;
            if readable && interest.contains(ConditionSet::READABLE) {
                conditions = conditions | ConditionSet::READABLE;
            }
            if writable && interest.contains(ConditionSet::WRITABLE) {
                conditions = conditions | ConditionSet::WRITABLE;
            }
            if conditions.is_empty() && interest.contains(ConditionSet::EXCEPTION) {
                conditions = ConditionSet::EXCEPTION;
            }

            // Interest is one-shot; re-arm so the descriptor is reported
            // again while it stays ready.
            if let Err(e) = self
                .poller
                .modify(borrow_descriptor(descriptor), interest_event(descriptor, interest))
            {
                warn!(descriptor, "Failed to re-arm descriptor: {}", e);
            }
            if !conditions.is_empty() {
                ready.push((descriptor, conditions));
            }
        }
        ready
    }

    /// Pick the first ready descriptor after the one handled last
    fn next_ready(&self, ready: &[(Descriptor, ConditionSet)]) -> Option<(Descriptor, ConditionSet)> {
        let after_last = |fd: &Descriptor| self.last_handled.map_or(true, |last| *fd > last);
        ready
            .iter()
            .filter(|(fd, _)| after_last(fd))
            .min_by_key(|(fd, _)| *fd)
            .or_else(|| ready.iter().min_by_key(|(fd, _)| *fd))
            .copied()
    }

    fn dispatch_descriptor(&mut self, descriptor: Descriptor, conditions: ConditionSet) {
        let Some(record) = self.handlers.get_mut(&descriptor) else {
            return;
        };
        let Some(mut handler) = record.handler.take() else {
            return;
        };
        let generation = record.generation;

        self.last_handled = Some(descriptor);
        self.descriptor_ran_last = true;
        self.stats.descriptor_dispatches += 1;
        trace!(descriptor, ?conditions, "running background handler");
        handler(self, conditions);

        // Put the handler back unless it replaced or removed its own
        // registration; a moved registration keeps its generation.
        if let Some(record) = self
            .handlers
            .values_mut()
            .find(|record| record.generation == generation)
        {
            if record.handler.is_none() {
                record.handler = Some(handler);
            }
        }
    }

    fn dispatch_trigger(&mut self) -> bool {
        let pending = self.pending_triggers.load(Ordering::Acquire);
        if pending == 0 {
            return false;
        }

        for offset in 1..=MAX_EVENT_TRIGGERS {
            let index = (self.last_trigger + offset) % MAX_EVENT_TRIGGERS;
            let mask = 1u32 << index;
            if pending & mask == 0 {
                continue;
            }
            self.pending_triggers.fetch_and(!mask, Ordering::AcqRel);

            let Some(record) = self.triggers[index].as_mut() else {
                continue;
            };
            let Some(mut handler) = record.handler.take() else {
                continue;
            };
            let generation = record.generation;

            self.last_trigger = index;
            self.descriptor_ran_last = false;
            self.stats.trigger_dispatches += 1;
            trace!(trigger = index, "running event trigger");
            handler(self);

            if let Some(record) = self.triggers[index].as_mut() {
                if record.generation == generation && record.handler.is_none() {
                    record.handler = Some(handler);
                }
            }
            return true;
        }
        false
    }

    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending_tasks", &self.queue.len())
            .field("descriptors", &self.handlers.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

fn interest_event(descriptor: Descriptor, conditions: ConditionSet) -> Event {
    Event::new(
        descriptor as usize,
        conditions.contains(ConditionSet::READABLE),
        conditions.contains(ConditionSet::WRITABLE),
    )
}

fn borrow_descriptor(descriptor: Descriptor) -> BorrowedFd<'static> {
    // SAFETY: only called for descriptors registered through this scheduler,
    // which the registrant keeps open while registered; the borrow does not
    // outlive the poller call it is passed to.
    unsafe { BorrowedFd::borrow_raw(descriptor) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_condition_set() {
        let both = ConditionSet::READABLE | ConditionSet::WRITABLE;
        assert!(both.contains(ConditionSet::READABLE));
        assert!(both.contains(ConditionSet::WRITABLE));
        assert!(!both.contains(ConditionSet::EXCEPTION));
        assert!(ConditionSet::NONE.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let config = SchedulerConfig {
            max_events_per_wait: 0,
            ..Default::default()
        };
        let err = TaskScheduler::with_config(config).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_delayed_tasks_run_in_deadline_order() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay, name) in [(3_000, "c"), (1_000, "a"), (2_000, "b")] {
            let order = order.clone();
            scheduler.schedule_delayed_task(delay, move |_| order.borrow_mut().push(name));
        }

        while order.borrow().len() < 3 {
            scheduler.single_step(None).unwrap();
        }
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.stats().timer_dispatches, 3);
    }

    #[test]
    fn test_unscheduled_task_never_runs() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let handle = scheduler.schedule_delayed_task(0, move |_| flag.set(true));

        assert!(scheduler.is_task_pending(handle));
        assert!(scheduler.unschedule_delayed_task(handle));
        assert!(!scheduler.unschedule_delayed_task(handle));
        scheduler.single_step(Some(Interval::from_millis(2))).unwrap();
        assert!(!ran.get());
    }

    #[test]
    fn test_reschedule_replaces_previous_task() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut slot = None;

        let first = log.clone();
        scheduler.reschedule_delayed_task(&mut slot, 0, move |_| first.borrow_mut().push("first"));
        let second = log.clone();
        scheduler.reschedule_delayed_task(&mut slot, 0, move |_| second.borrow_mut().push("second"));

        while log.borrow().is_empty() {
            scheduler.single_step(None).unwrap();
        }
        scheduler.single_step(Some(Interval::from_millis(1))).unwrap();
        assert_eq!(*log.borrow(), vec!["second"]);
    }

    #[test]
    fn test_task_can_schedule_another() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let count = Rc::new(Cell::new(0));

        let outer = count.clone();
        scheduler.schedule_delayed_task(0, move |sched| {
            outer.set(outer.get() + 1);
            let inner = outer.clone();
            sched.schedule_delayed_task(0, move |_| inner.set(inner.get() + 1));
        });

        while count.get() < 2 {
            scheduler.single_step(None).unwrap();
        }
        assert_eq!(scheduler.stats().pending_tasks, 0);
    }

    #[test]
    fn test_event_trigger_runs_handler() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let id = scheduler
            .create_event_trigger(move |_| counter.set(counter.get() + 1))
            .unwrap();

        scheduler.trigger_event(id);
        scheduler.single_step(None).unwrap();
        assert_eq!(hits.get(), 1);

        // Not pending any more.
        scheduler.single_step(Some(Interval::ZERO)).unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(scheduler.stats().trigger_dispatches, 1);
    }

    #[test]
    fn test_deleted_trigger_does_not_run() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let id = scheduler
            .create_event_trigger(move |_| counter.set(counter.get() + 1))
            .unwrap();

        scheduler.trigger_event(id);
        scheduler.delete_event_trigger(id);
        scheduler.single_step(Some(Interval::ZERO)).unwrap();
        assert_eq!(hits.get(), 0);
        assert!(scheduler.event_trigger(id).is_none());
    }

    #[test]
    fn test_trigger_limit() {
        let mut scheduler = TaskScheduler::new().unwrap();
        for _ in 0..MAX_EVENT_TRIGGERS {
            scheduler.create_event_trigger(|_| {}).unwrap();
        }
        let err = scheduler.create_event_trigger(|_| {}).unwrap_err();
        assert!(matches!(err, RuntimeError::TriggerLimitExceeded { limit: 32 }));
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let mut scheduler = TaskScheduler::new().unwrap();
        let stop = StopFlag::new();
        let setter = stop.clone();
        scheduler.schedule_delayed_task(1_000, move |_| setter.set());

        scheduler.do_event_loop(Some(&stop)).unwrap();
        assert!(stop.is_set());
        assert!(scheduler.stats().iterations >= 1);
    }
}
