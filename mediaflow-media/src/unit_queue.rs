//! Frame source delivering a queue of discrete units

use crate::error::MediaResult;
use crate::source::{fire, micros_until, Completion, FrameRequest, FrameState, FramedSource, SourceStats};
use bytes::Bytes;
use mediaflow_core::{Instant, Interval, TaskHandle, TaskScheduler};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Delivers pushed units one per request
///
/// Each unit is one frame; a unit larger than the request is truncated and
/// the next request starts at the following unit. Units are paced by their
/// duration. Once the queue is drained the source closes, unless it was
/// created open, in which case it waits for [`UnitQueueSource::push_unit`].
pub struct UnitQueueSource {
    name: String,
    units: VecDeque<(Bytes, u64)>,
    default_duration_us: u64,
    close_when_drained: bool,
    state: FrameState,
    task: Option<TaskHandle>,
    next_presentation: Option<Instant>,
    self_ref: Weak<RefCell<Self>>,
}

impl UnitQueueSource {
    /// Source over `units`, closing once they are delivered
    pub fn new(
        name: impl Into<String>,
        units: impl IntoIterator<Item = Bytes>,
        duration_us: u64,
    ) -> Rc<RefCell<Self>> {
        Self::build(name.into(), units, duration_us, true)
    }

    /// Source that stays open and waits for more units when drained
    pub fn open(name: impl Into<String>, duration_us: u64) -> Rc<RefCell<Self>> {
        Self::build(name.into(), Vec::new(), duration_us, false)
    }

    fn build(
        name: String,
        units: impl IntoIterator<Item = Bytes>,
        duration_us: u64,
        close_when_drained: bool,
    ) -> Rc<RefCell<Self>> {
        let units = units.into_iter().map(|unit| (unit, duration_us)).collect();
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name,
                units,
                default_duration_us: duration_us,
                close_when_drained,
                state: FrameState::new(),
                task: None,
                next_presentation: None,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Queue a unit with the default duration
    pub fn push_unit(&mut self, sched: &mut TaskScheduler, unit: Bytes) {
        self.push_unit_with_duration(sched, unit, self.default_duration_us);
    }

    /// Queue a unit with its own duration
    pub fn push_unit_with_duration(&mut self, sched: &mut TaskScheduler, unit: Bytes, duration_us: u64) {
        self.units.push_back((unit, duration_us));
        self.schedule_delivery(sched);
    }

    /// Close once the queued units are delivered
    pub fn finish(&mut self, sched: &mut TaskScheduler) {
        self.close_when_drained = true;
        self.schedule_delivery(sched);
    }

    /// Units not yet delivered
    pub fn queued_units(&self) -> usize {
        self.units.len()
    }

    /// Delivery counters
    pub fn stats(&self) -> SourceStats {
        self.state.stats()
    }

    fn schedule_delivery(&mut self, sched: &mut TaskScheduler) {
        if self.task.is_some() || !self.state.is_awaiting() {
            return;
        }
        if self.units.is_empty() && !self.close_when_drained {
            return;
        }

        let delay = self.next_presentation.map_or(0, |due| micros_until(sched, due));
        let weak = self.self_ref.clone();
        self.task = Some(sched.schedule_delayed_task(delay, move |sched| {
            let Some(source) = weak.upgrade() else {
                return;
            };
            let completion = source.borrow_mut().deliver(sched);
            fire(completion, sched);
        }));
    }

    fn deliver(&mut self, sched: &TaskScheduler) -> Option<Completion> {
        self.task = None;
        match self.units.pop_front() {
            Some((unit, duration_us)) => {
                let presentation_time = self.next_presentation.unwrap_or_else(|| sched.now());
                self.next_presentation = Some(presentation_time + Interval::from_micros(duration_us));
                self.state.complete(&unit, presentation_time, duration_us)
            }
            None => {
                debug!(source = %self.name, frames = self.state.stats().frames, "unit queue drained");
                self.state.close()
            }
        }
    }
}

impl FramedSource for UnitQueueSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_next_frame(&mut self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()> {
        self.state.begin(&self.name, request)?;
        self.schedule_delivery(sched);
        Ok(())
    }

    fn stop_getting_frames(&mut self, sched: &mut TaskScheduler) {
        if let Some(task) = self.task.take() {
            sched.unschedule_delayed_task(task);
        }
        self.state.cancel();
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.state.is_awaiting()
    }

    fn max_frame_size(&self) -> usize {
        self.units.iter().map(|(unit, _)| unit.len()).max().unwrap_or(0)
    }
}
