//! Delay queue of pending timed events
//!
//! Entries are kept in firing order, each storing only the time between the
//! previous entry's deadline and its own. The sum of deltas from the head up
//! to an entry is that entry's remaining time as of the last
//! resynchronisation against the clock, so insertion and removal touch only
//! the nodes before the insertion point and the immediate successor.
//!
//! Nodes live in a slab arena linked by index. An [`EntryHandle`] pairs the
//! slot with the entry's [`Token`]; tokens are never reused, so a handle to an
//! entry that already fired (even if its slot now holds a newer entry) is
//! recognised as stale and ignored.

use crate::lock::CooperativeLock;
use crate::time::{Clock, Instant, Interval, SystemClock};
use slab::Slab;
use std::fmt;
use tracing::trace;

/// Unique identifier of a queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl Token {
    /// Raw token value; always greater than zero
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle returned by [`DelayQueue::add_entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    key: usize,
    token: Token,
}

impl EntryHandle {
    /// Token of the entry this handle refers to
    pub fn token(&self) -> Token {
        self.token
    }
}

/// Entry removed from the queue because its deadline passed
#[derive(Debug)]
pub struct FiredEntry<T> {
    /// Token the entry was created with
    pub token: Token,
    /// Payload handed over to the caller
    pub payload: T,
}

struct Node<T> {
    delta: Interval,
    token: Token,
    prev: Option<usize>,
    next: Option<usize>,
    payload: T,
}

/// Ordered queue of timed events keyed by relative deltas
pub struct DelayQueue<T> {
    entries: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    last_sync: Instant,
    next_token: u64,
    clock: Box<dyn Clock>,
    lock: CooperativeLock,
}

impl<T> DelayQueue<T> {
    /// Create an empty queue driven by the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty queue driven by `clock`
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        let last_sync = clock.now();
        Self {
            entries: Slab::new(),
            head: None,
            tail: None,
            last_sync,
            next_token: 1,
            clock: Box::new(clock),
            lock: CooperativeLock::new(),
        }
    }

    /// Current reading of the queue's clock
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Lock guarding this queue against alarm reentry
    pub fn alarm_lock(&self) -> CooperativeLock {
        self.lock.clone()
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `payload` to fire `delay` from now
    pub fn add_entry(&mut self, delay: Interval, payload: T) -> EntryHandle {
        let _guard = self.lock.write();
        let token = Token(self.next_token);
        self.next_token += 1;
        let key = self.entries.insert(Node {
            delta: Interval::ZERO,
            token,
            prev: None,
            next: None,
            payload,
        });
        self.link(key, delay);
        trace!(%token, %delay, depth = self.entries.len(), "delay queue entry added");
        EntryHandle { key, token }
    }

    /// Cancel the entry behind `handle`, returning its payload
    ///
    /// Stale handles are ignored.
    pub fn remove_entry(&mut self, handle: EntryHandle) -> Option<T> {
        let _guard = self.lock.write();
        let key = self.resolve(handle)?;
        self.unlink(key);
        trace!(token = %handle.token, "delay queue entry removed");
        Some(self.entries.remove(key).payload)
    }

    /// Cancel the entry with `token`, returning its payload
    pub fn remove_entry_by_token(&mut self, token: Token) -> Option<T> {
        let handle = self.find_by_token(token)?;
        self.remove_entry(handle)
    }

    /// Move the entry behind `handle` so it fires `new_delay` from now
    ///
    /// The entry keeps its token. Returns `false` for stale handles.
    pub fn update_entry(&mut self, handle: EntryHandle, new_delay: Interval) -> bool {
        let _guard = self.lock.write();
        let Some(key) = self.resolve(handle) else {
            return false;
        };
        self.unlink(key);
        self.link(key, new_delay);
        trace!(token = %handle.token, %new_delay, "delay queue entry updated");
        true
    }

    /// Move the entry with `token`; see [`DelayQueue::update_entry`]
    pub fn update_entry_by_token(&mut self, token: Token, new_delay: Interval) -> bool {
        match self.find_by_token(token) {
            Some(handle) => self.update_entry(handle, new_delay),
            None => false,
        }
    }

    /// Handle for the entry with `token`, if it is still queued
    pub fn find_by_token(&self, token: Token) -> Option<EntryHandle> {
        let _guard = self.lock.read();
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &self.entries[key];
            if node.token == token {
                return Some(EntryHandle { key, token });
            }
            cursor = node.next;
        }
        None
    }

    /// Whether an entry with `token` is queued
    pub fn contains(&self, token: Token) -> bool {
        self.find_by_token(token).is_some()
    }

    /// Process one alarm tick
    ///
    /// Resynchronises the deltas against the clock and, if the head entry is
    /// due, unlinks and returns it. At most one entry is returned per call;
    /// the caller runs its handler after the queue's guard has been released
    /// and calls again to collect further due entries.
    pub fn handle_alarm(&mut self) -> Option<FiredEntry<T>> {
        let _guard = self.lock.write();
        self.synchronize();

        let head = self.head?;
        if !self.entries[head].delta.is_zero() {
            return None;
        }
        self.unlink(head);
        let node = self.entries.remove(head);
        trace!(token = %node.token, depth = self.entries.len(), "delay queue entry fired");
        Some(FiredEntry {
            token: node.token,
            payload: node.payload,
        })
    }

    /// Time until the head entry is due
    ///
    /// `ZERO` if it is already overdue, `INFINITE` when the queue is empty.
    pub fn time_to_next_alarm(&self) -> Interval {
        let _guard = self.lock.read();
        match self.head {
            Some(head) => self.entries[head].delta - self.elapsed_since_sync(),
            None => Interval::INFINITE,
        }
    }

    /// Time until the entry behind `handle` is due
    pub fn time_remaining(&self, handle: EntryHandle) -> Option<Interval> {
        let _guard = self.lock.read();
        let target = self.resolve(handle)?;
        let mut total = Interval::ZERO;
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &self.entries[key];
            total += node.delta;
            if key == target {
                break;
            }
            cursor = node.next;
        }
        Some(total - self.elapsed_since_sync())
    }

    /// Iterate `(token, delta)` pairs in firing order
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    fn elapsed_since_sync(&self) -> Interval {
        self.clock.now() - self.last_sync
    }

    fn resolve(&self, handle: EntryHandle) -> Option<usize> {
        match self.entries.get(handle.key) {
            Some(node) if node.token == handle.token => Some(handle.key),
            _ => None,
        }
    }

    /// Splice an unlinked node into the list so it fires `delay` from now
    fn link(&mut self, key: usize, delay: Interval) {
        // Deltas are relative to the last sync; bring the request onto that
        // time base before comparing.
        let mut requested = delay + self.elapsed_since_sync();
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let delta = self.entries[current].delta;
            if requested < delta {
                break;
            }
            requested -= delta;
            cursor = self.entries[current].next;
        }

        self.entries[key].delta = requested;
        match cursor {
            Some(successor) => {
                self.entries[successor].delta -= requested;
                let prev = self.entries[successor].prev;
                self.entries[key].prev = prev;
                self.entries[key].next = Some(successor);
                self.entries[successor].prev = Some(key);
                match prev {
                    Some(prev) => self.entries[prev].next = Some(key),
                    None => self.head = Some(key),
                }
            }
            None => {
                self.entries[key].prev = self.tail;
                self.entries[key].next = None;
                match self.tail {
                    Some(tail) => self.entries[tail].next = Some(key),
                    None => self.head = Some(key),
                }
                self.tail = Some(key);
            }
        }
    }

    /// Detach a node, folding its delta into the successor
    fn unlink(&mut self, key: usize) {
        let (prev, next, delta) = {
            let node = &self.entries[key];
            (node.prev, node.next, node.delta)
        };
        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => {
                self.entries[next].prev = prev;
                self.entries[next].delta += delta;
            }
            None => self.tail = prev,
        }
        let node = &mut self.entries[key];
        node.prev = None;
        node.next = None;
        node.delta = Interval::ZERO;
    }

    /// Charge the time elapsed since the last sync against the head entries
    fn synchronize(&mut self) {
        let now = self.clock.now();
        if now < self.last_sync {
            self.last_sync = now;
            return;
        }
        let mut elapsed = now - self.last_sync;
        self.last_sync = now;

        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &mut self.entries[key];
            if elapsed < node.delta {
                node.delta -= elapsed;
                break;
            }
            elapsed -= node.delta;
            node.delta = Interval::ZERO;
            cursor = node.next;
        }
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DelayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayQueue")
            .field("len", &self.entries.len())
            .field("last_sync", &self.last_sync)
            .field("next_token", &self.next_token)
            .field("entries", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

/// Iterator over queued entries in firing order
pub struct Iter<'a, T> {
    queue: &'a DelayQueue<T>,
    cursor: Option<usize>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = (Token, Interval);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = &self.queue.entries[key];
        self.cursor = node.next;
        Some((node.token, node.delta))
    }
}
