//! Time primitives for the event loop
//!
//! [`Instant`] is an absolute `(seconds, microseconds)` sample and [`Interval`]
//! a non-negative duration with the same resolution. All arithmetic saturates
//! instead of wrapping, and subtraction clamps at zero, so delay bookkeeping
//! never goes negative.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Absolute monotonic timestamp
///
/// Always normalized so that `micros < 1_000_000`. Ordering is lexicographic
/// on `(secs, micros)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Instant {
    secs: u64,
    micros: u32,
}

impl Instant {
    /// The zero instant
    pub const ZERO: Instant = Instant { secs: 0, micros: 0 };

    /// Create an instant, carrying excess microseconds into seconds
    pub fn new(secs: u64, micros: u64) -> Self {
        let secs = secs.saturating_add(micros / MICROS_PER_SECOND);
        Self {
            secs,
            micros: (micros % MICROS_PER_SECOND) as u32,
        }
    }

    /// Create an instant from a microsecond count
    pub fn from_micros(micros: u64) -> Self {
        Self::new(0, micros)
    }

    /// Whole seconds part
    pub fn secs(&self) -> u64 {
        self.secs
    }

    /// Sub-second microseconds part
    pub fn subsec_micros(&self) -> u32 {
        self.micros
    }

    /// Total microseconds, saturating at `u64::MAX`
    pub fn as_micros(&self) -> u64 {
        self.secs
            .saturating_mul(MICROS_PER_SECOND)
            .saturating_add(self.micros as u64)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn saturating_duration_since(&self, earlier: Instant) -> Interval {
        *self - earlier
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

/// Non-negative duration with microsecond resolution
///
/// Subtraction clamps to [`Interval::ZERO`]. [`Interval::INFINITE`] is the
/// largest representable value and stands for "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Interval {
    secs: u64,
    micros: u32,
}

impl Interval {
    /// Empty interval
    pub const ZERO: Interval = Interval { secs: 0, micros: 0 };
    /// One millisecond
    pub const ONE_MILLISECOND: Interval = Interval { secs: 0, micros: 1_000 };
    /// One second
    pub const ONE_SECOND: Interval = Interval { secs: 1, micros: 0 };
    /// Sentinel for "no deadline"
    pub const INFINITE: Interval = Interval {
        secs: u64::MAX,
        micros: (MICROS_PER_SECOND - 1) as u32,
    };

    /// Create an interval, carrying excess microseconds into seconds
    pub fn new(secs: u64, micros: u64) -> Self {
        let secs = secs.saturating_add(micros / MICROS_PER_SECOND);
        Self {
            secs,
            micros: (micros % MICROS_PER_SECOND) as u32,
        }
    }

    /// Interval of `micros` microseconds
    pub fn from_micros(micros: u64) -> Self {
        Self::new(0, micros)
    }

    /// Interval from a signed microsecond count; negative values clamp to zero
    pub fn from_signed_micros(micros: i64) -> Self {
        if micros <= 0 {
            Self::ZERO
        } else {
            Self::from_micros(micros as u64)
        }
    }

    /// Interval of `millis` milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self::from_micros(millis.saturating_mul(1_000))
    }

    /// Interval of `secs` seconds
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, micros: 0 }
    }

    /// Whole seconds part
    pub fn secs(&self) -> u64 {
        self.secs
    }

    /// Sub-second microseconds part
    pub fn subsec_micros(&self) -> u32 {
        self.micros
    }

    /// Total microseconds, saturating at `u64::MAX`
    pub fn as_micros(&self) -> u64 {
        self.secs
            .saturating_mul(MICROS_PER_SECOND)
            .saturating_add(self.micros as u64)
    }

    /// Whether this is the zero interval
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whether this is the "never" sentinel
    pub fn is_infinite(&self) -> bool {
        *self == Self::INFINITE
    }

    /// Convert to a wait timeout; `INFINITE` means wait without bound
    pub fn as_timeout(&self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::new(self.secs, self.micros * 1_000))
        }
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::new(duration.as_secs(), duration.subsec_micros() as u64)
    }
}

impl From<Interval> for Duration {
    fn from(interval: Interval) -> Self {
        Duration::new(interval.secs, interval.micros * 1_000)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{}.{:06}s", self.secs, self.micros)
        }
    }
}

fn add_parts(a: (u64, u32), b: (u64, u32)) -> (u64, u32) {
    let mut micros = a.1 + b.1;
    let mut carry = 0;
    if micros as u64 >= MICROS_PER_SECOND {
        micros -= MICROS_PER_SECOND as u32;
        carry = 1;
    }
    match a.0.checked_add(b.0).and_then(|secs| secs.checked_add(carry)) {
        Some(secs) => (secs, micros),
        None => (u64::MAX, (MICROS_PER_SECOND - 1) as u32),
    }
}

fn sub_parts(a: (u64, u32), b: (u64, u32)) -> (u64, u32) {
    if a <= b {
        return (0, 0);
    }
    let (mut secs, mut micros) = (a.0 - b.0, a.1 as i64 - b.1 as i64);
    if micros < 0 {
        micros += MICROS_PER_SECOND as i64;
        secs -= 1;
    }
    (secs, micros as u32)
}

impl Add for Interval {
    type Output = Interval;

    fn add(self, rhs: Interval) -> Interval {
        let (secs, micros) = add_parts((self.secs, self.micros), (rhs.secs, rhs.micros));
        Interval { secs, micros }
    }
}

impl AddAssign for Interval {
    fn add_assign(&mut self, rhs: Interval) {
        *self = *self + rhs;
    }
}

impl Sub for Interval {
    type Output = Interval;

    fn sub(self, rhs: Interval) -> Interval {
        let (secs, micros) = sub_parts((self.secs, self.micros), (rhs.secs, rhs.micros));
        Interval { secs, micros }
    }
}

impl SubAssign for Interval {
    fn sub_assign(&mut self, rhs: Interval) {
        *self = *self - rhs;
    }
}

impl Mul<u32> for Interval {
    type Output = Interval;

    fn mul(self, rhs: u32) -> Interval {
        let total = (self.micros as u64).saturating_mul(rhs as u64);
        let secs = self
            .secs
            .saturating_mul(rhs as u64)
            .saturating_add(total / MICROS_PER_SECOND);
        if secs == u64::MAX {
            return Interval::INFINITE;
        }
        Interval {
            secs,
            micros: (total % MICROS_PER_SECOND) as u32,
        }
    }
}

impl Add<Interval> for Instant {
    type Output = Instant;

    fn add(self, rhs: Interval) -> Instant {
        let (secs, micros) = add_parts((self.secs, self.micros), (rhs.secs, rhs.micros));
        Instant { secs, micros }
    }
}

impl AddAssign<Interval> for Instant {
    fn add_assign(&mut self, rhs: Interval) {
        *self = *self + rhs;
    }
}

impl Sub<Interval> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Interval) -> Instant {
        let (secs, micros) = sub_parts((self.secs, self.micros), (rhs.secs, rhs.micros));
        Instant { secs, micros }
    }
}

impl Sub for Instant {
    type Output = Interval;

    fn sub(self, rhs: Instant) -> Interval {
        let (secs, micros) = sub_parts((self.secs, self.micros), (rhs.secs, rhs.micros));
        Interval { secs, micros }
    }
}

/// Source of the current time
pub trait Clock {
    /// Current instant; successive readings never go backwards
    fn now(&self) -> Instant;
}

/// Monotonic clock anchored to the wall clock
///
/// The first reading in the process pins a wall-clock origin; later readings
/// add monotonic elapsed time to it, so values are comparable with wall-clock
/// timestamps but never jump backwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

struct ClockAnchor {
    monotonic: std::time::Instant,
    wall: Instant,
}

fn anchor() -> &'static ClockAnchor {
    static ANCHOR: OnceLock<ClockAnchor> = OnceLock::new();
    ANCHOR.get_or_init(|| {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        ClockAnchor {
            monotonic: std::time::Instant::now(),
            wall: Instant::new(since_epoch.as_secs(), since_epoch.subsec_micros() as u64),
        }
    })
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let anchor = anchor();
        anchor.wall + Interval::from(anchor.monotonic.elapsed())
    }
}

/// Manually advanced clock
///
/// Clones share the same reading, so a test can keep one handle and give
/// another to the queue under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    /// Clock starting at `start`
    pub fn new(start: Instant) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Interval) {
        self.now.set(self.now.get() + by);
    }

    /// Jump to `to` if it is later than the current reading
    pub fn set(&self, to: Instant) {
        if to > self.now.get() {
            self.now.set(to);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}
