//! Thread-safe, priority-tiered job queue feeding worker threads.
//!
//! Provides a FIFO per priority tier. Workers pop from the highest non-empty
//! tier. The queue also keeps count of parked workers so a producer can tell
//! whether its job will be picked up or a new worker is needed.

use crate::queue::Priority;

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// A unit of work run by a worker thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

const TIERS: usize = 4;

struct State {
    tiers: [VecDeque<Job>; TIERS],
    // Workers currently parked in `pop`.
    idle: usize,
    // Wake-ups issued to parked workers that have not been consumed yet.
    notified: usize,
}

impl State {
    fn pop(&mut self) -> Option<Job> {
        self.tiers.iter_mut().find_map(|tier| tier.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.tiers.iter().all(|tier| tier.is_empty())
    }
}

/// A thread-safe, tiered FIFO queue of jobs.
///
/// Uses a Mutex-wrapped array of VecDeques (one per [`Priority`]) and a
/// Condvar to park idle consumers.
pub(crate) struct JobQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl JobQueue {
    /// Creates a new empty job queue.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tiers: Default::default(),
                idle: 0,
                notified: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues a job at the back of its priority tier.
    ///
    /// # Returns
    /// `true` if a parked consumer was woken for this job, `false` if every
    /// consumer is busy and the caller should consider adding one.
    pub(crate) fn push(&self, priority: Priority, job: Job) -> bool {
        let mut state = self.state.lock();
        state.tiers[priority.tier()].push_back(job);

        if state.idle > state.notified {
            state.notified += 1;
            self.available.notify_one();
            true
        } else {
            false
        }
    }

    /// Dequeues the next job, parking up to `timeout` while the queue is empty.
    ///
    /// # Returns
    /// `None` if no job arrived within `timeout`.
    pub(crate) fn pop(&self, timeout: Option<Duration>) -> Option<Job> {
        let mut state = self.state.lock();

        loop {
            if let Some(job) = state.pop() {
                return Some(job);
            }
            state.idle += 1;
            let timed_out = match timeout {
                Some(timeout) => self.available.wait_for(&mut state, timeout).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            state.idle -= 1;

            if state.notified > 0 {
                state.notified -= 1;
            } else if timed_out && state.is_empty() {
                return None;
            }
        }
    }
}
