//! Frame source driven by descriptor readiness

use crate::error::MediaResult;
use crate::source::{fire, Completion, FrameRequest, FrameState, FramedSource, SourceStats};
use mediaflow_core::{ConditionSet, Descriptor, TaskScheduler};
use std::cell::RefCell;
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Reads from a non-blocking descriptor when the scheduler reports it readable
///
/// Background read handling is on only while a request is outstanding.
/// `WouldBlock` keeps waiting; end of stream and errors close the source.
/// The reader must already be in non-blocking mode.
pub struct DescriptorSource<R> {
    name: String,
    reader: R,
    descriptor: Descriptor,
    state: FrameState,
    registered: bool,
    self_ref: Weak<RefCell<Self>>,
}

impl<R: Read + AsRawFd + 'static> DescriptorSource<R> {
    /// Create a shared source over `reader`
    pub fn new(name: impl Into<String>, reader: R) -> Rc<RefCell<Self>> {
        let descriptor = reader.as_raw_fd();
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name: name.into(),
                reader,
                descriptor,
                state: FrameState::new(),
                registered: false,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Delivery counters
    pub fn stats(&self) -> SourceStats {
        self.state.stats()
    }

    fn unregister(&mut self, sched: &mut TaskScheduler) {
        if self.registered {
            sched.turn_off_background_read_handling(self.descriptor);
            self.registered = false;
        }
    }

    fn on_readable(&mut self, sched: &mut TaskScheduler) -> Option<Completion> {
        if !self.state.is_awaiting() {
            self.unregister(sched);
            return None;
        }

        let mut chunk = vec![0u8; self.state.max_size()];
        match self.reader.read(&mut chunk) {
            Ok(0) => {
                debug!(source = %self.name, "descriptor reached end of stream");
                self.unregister(sched);
                self.state.close()
            }
            Ok(n) => {
                self.unregister(sched);
                let now = sched.now();
                self.state.complete(&chunk[..n], now, 0)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                trace!(source = %self.name, "spurious readiness");
                None
            }
            Err(e) => {
                warn!(source = %self.name, "descriptor read failed, closing: {}", e);
                self.unregister(sched);
                self.state.close()
            }
        }
    }
}

impl<R: Read + AsRawFd + 'static> FramedSource for DescriptorSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_next_frame(&mut self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()> {
        self.state.begin(&self.name, request)?;

        let weak = self.self_ref.clone();
        let registered = sched.turn_on_background_read_handling(
            self.descriptor,
            move |sched, _conditions: ConditionSet| {
                let Some(source) = weak.upgrade() else {
                    return;
                };
                let completion = source.borrow_mut().on_readable(sched);
                fire(completion, sched);
            },
        );
        if let Err(e) = registered {
            self.state.cancel();
            return Err(e.into());
        }
        self.registered = true;
        Ok(())
    }

    fn stop_getting_frames(&mut self, sched: &mut TaskScheduler) {
        self.unregister(sched);
        self.state.cancel();
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.state.is_awaiting()
    }
}
