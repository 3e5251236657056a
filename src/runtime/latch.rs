//! One-shot and counting latches used to block a caller until a block ran.

use parking_lot::{Condvar, Mutex};
use std::any::Any;

/// A flag that starts unset and can be set once; waiters block until it is.
pub(crate) struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }
}

/// Counts down a fixed number of completions and remembers the first panic.
pub(crate) struct Countdown {
    state: Mutex<CountdownState>,
    cond: Condvar,
}

struct CountdownState {
    remaining: usize,
    panic: Option<Box<dyn Any + Send>>,
}

impl Countdown {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(CountdownState {
                remaining: count,
                panic: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, outcome: std::thread::Result<()>) {
        let mut state = self.state.lock();
        if let Err(payload) = outcome {
            if state.panic.is_none() {
                state.panic = Some(payload);
            }
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until every completion arrived and returns the first panic.
    pub(crate) fn wait(&self) -> Option<Box<dyn Any + Send>> {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.cond.wait(&mut state);
        }
        state.panic.take()
    }
}
