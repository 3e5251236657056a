//! Time utilities: clocks, deadlines, and the shared timer thread.
//!
//! This module provides:
//!
//! - [`Clock`] to choose between monotonic time and wall-clock time
//! - [`Deadline`], a point in time measured on either clock
//! - the timer driver behind [`Timer`](crate::source::Timer) and
//!   [`Queue::dispatch_after`](crate::Queue::dispatch_after)
//!
//! # Example: Delayed dispatch
//!
//! ```ignore
//! use dispatchq::{Queue, time::Clock};
//! use std::time::Duration;
//!
//! Queue::serial("work").dispatch_after(Duration::from_millis(100), Clock::Monotonic, || {
//!     println!("100ms later");
//! });
//! ```
//!
//! Wall-clock deadlines follow adjustments of the system clock: a deadline
//! one hour ahead on the wall clock fires immediately if the clock jumps
//! forward by an hour.

pub(crate) mod driver;

pub(crate) use driver::{TimerId, driver};

use std::time::{Duration, Instant, SystemTime};

/// Longest a wait on a wall-clock deadline sleeps before re-reading the clock.
pub(crate) const WALL_CLOCK_RECHECK: Duration = Duration::from_millis(250);

/// Which clock a delay or timeout is measured on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Clock {
    /// Monotonic time. Unaffected by system clock changes, stops while the
    /// machine sleeps on some platforms.
    #[default]
    Monotonic,
    /// Wall-clock time. Follows system clock adjustments.
    WallTime,
}

/// A point in time on a specific clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    Monotonic(Instant),
    Wall(SystemTime),
}

impl Deadline {
    /// Deadline `delay` from now on `clock`.
    pub fn after(delay: Duration, clock: Clock) -> Self {
        match clock {
            Clock::Monotonic => Deadline::Monotonic(Instant::now() + delay),
            Clock::WallTime => Deadline::Wall(SystemTime::now() + delay),
        }
    }

    /// Deadline at an absolute wall-clock time.
    pub fn at(time: SystemTime) -> Self {
        Deadline::Wall(time)
    }

    /// The clock the deadline is measured on.
    pub fn clock(&self) -> Clock {
        match self {
            Deadline::Monotonic(_) => Clock::Monotonic,
            Deadline::Wall(_) => Clock::WallTime,
        }
    }

    /// Time left until the deadline, zero if it passed.
    pub fn remaining(&self) -> Duration {
        match self {
            Deadline::Monotonic(at) => at.saturating_duration_since(Instant::now()),
            Deadline::Wall(at) => at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO),
        }
    }

    /// How long ago the deadline passed, zero if it lies ahead.
    pub fn overdue(&self) -> Duration {
        match self {
            Deadline::Monotonic(at) => Instant::now().saturating_duration_since(*at),
            Deadline::Wall(at) => SystemTime::now().duration_since(*at).unwrap_or(Duration::ZERO),
        }
    }

    /// Checks if the deadline passed.
    pub fn has_passed(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The same deadline moved later by `by`.
    pub fn offset(&self, by: Duration) -> Self {
        match self {
            Deadline::Monotonic(at) => Deadline::Monotonic(*at + by),
            Deadline::Wall(at) => Deadline::Wall(*at + by),
        }
    }

    /// How long a single blocking wait on this deadline may sleep.
    pub(crate) fn wait_slice(&self) -> Duration {
        match self {
            Deadline::Monotonic(_) => self.remaining(),
            Deadline::Wall(_) => self.remaining().min(WALL_CLOCK_RECHECK),
        }
    }
}
