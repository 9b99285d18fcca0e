//! Cooperative lock for a single thread of control
//!
//! The only asynchronous entry point into shared runtime state is the alarm.
//! Holding a guard works like masking that alarm: an alarm raised while any
//! guard is alive is queued and delivered, in arrival order, when the
//! outermost guard drops. Handlers themselves run with delivery blocked, so
//! an alarm raised inside a handler waits until that handler returns.
//!
//! Read and write acquisition block identically. They are kept apart so that
//! callers state their intent and so the type can be swapped for a real
//! reader-writer lock if the scheduler ever runs on more than one thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

type AlarmHandler = Box<dyn FnOnce()>;

#[derive(Default)]
struct LockState {
    readers: Cell<u32>,
    writers: Cell<u32>,
    delivering: Cell<bool>,
    pending: RefCell<VecDeque<AlarmHandler>>,
}

impl LockState {
    fn depth(&self) -> u32 {
        self.readers.get() + self.writers.get()
    }

    fn is_blocked(&self) -> bool {
        self.depth() > 0 || self.delivering.get()
    }

    fn release(&self) {
        if self.depth() == 0 && !self.delivering.get() {
            self.drain();
        }
    }

    fn drain(&self) {
        self.delivering.set(true);
        let _unmask = UnmaskOnExit(self);
        loop {
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(handler) => handler(),
                None => break,
            }
        }
    }
}

/// Clears the delivering flag even when a handler unwinds
struct UnmaskOnExit<'a>(&'a LockState);

impl Drop for UnmaskOnExit<'_> {
    fn drop(&mut self) {
        self.0.delivering.set(false);
    }
}

/// Alarm-masking lock shared between the delay queue and its alarm source
///
/// Cloning yields another handle to the same lock.
#[derive(Clone, Default)]
pub struct CooperativeLock {
    state: Rc<LockState>,
}

impl CooperativeLock {
    /// Create an unheld lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire for reading
    pub fn read(&self) -> ReadGuard {
        self.state.readers.set(self.state.readers.get() + 1);
        ReadGuard {
            state: self.state.clone(),
        }
    }

    /// Acquire for writing
    pub fn write(&self) -> WriteGuard {
        self.state.writers.set(self.state.writers.get() + 1);
        WriteGuard {
            state: self.state.clone(),
        }
    }

    /// Run `handler` now if delivery is unblocked, otherwise queue it
    ///
    /// Returns `true` if the handler ran before this call returned.
    pub fn deliver_or_defer(&self, handler: impl FnOnce() + 'static) -> bool {
        self.state.pending.borrow_mut().push_back(Box::new(handler));
        if self.state.is_blocked() {
            trace!(
                pending = self.pending_alarms(),
                "alarm deferred while lock is held"
            );
            false
        } else {
            self.state.drain();
            true
        }
    }

    /// Whether alarm delivery is currently blocked
    pub fn is_blocked(&self) -> bool {
        self.state.is_blocked()
    }

    /// Number of live read guards
    pub fn readers(&self) -> u32 {
        self.state.readers.get()
    }

    /// Number of live write guards
    pub fn writers(&self) -> u32 {
        self.state.writers.get()
    }

    /// Alarms waiting for the lock to be released
    pub fn pending_alarms(&self) -> usize {
        self.state.pending.borrow().len()
    }
}

impl fmt::Debug for CooperativeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeLock")
            .field("readers", &self.readers())
            .field("writers", &self.writers())
            .field("pending_alarms", &self.pending_alarms())
            .finish()
    }
}

/// Scoped read acquisition; releases on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard {
    state: Rc<LockState>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.state.readers.set(self.state.readers.get() - 1);
        self.state.release();
    }
}

/// Scoped write acquisition; releases on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    state: Rc<LockState>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.state.writers.set(self.state.writers.get() - 1);
        self.state.release();
    }
}
