//! Shared timer thread firing callbacks at their deadlines.
//!
//! Every timed operation of the crate (timer sources, delayed dispatch) is
//! registered here. A single `dispatchq-timer` thread sleeps until the
//! earliest deadline plus its leeway and fires every entry that became due,
//! so timers whose leeway windows overlap fire together.
//!
//! Callbacks run on the timer thread and must stay short: they only merge
//! source data or enqueue a block.

use crate::time::{Deadline, WALL_CLOCK_RECHECK};

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Callback of a registered timer.
///
/// Returns the next deadline for repeating timers, `None` to unregister.
pub(crate) type TimerCallback = Box<dyn FnMut(Instant) -> Option<Deadline> + Send>;

/// Handle of a registered timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

static DRIVER: OnceLock<TimerDriver> = OnceLock::new();

/// Returns the process-wide timer driver, starting its thread on first use.
pub(crate) fn driver() -> &'static TimerDriver {
    DRIVER.get_or_init(TimerDriver::start)
}

struct Entry {
    deadline: Deadline,
    leeway: Duration,
    callback: Arc<Mutex<TimerCallback>>,
}

#[derive(Default)]
struct State {
    timers: HashMap<u64, Entry>,
    next_id: u64,
}

impl State {
    // Earliest `deadline + leeway`; sleeping until then lets every timer
    // whose window overlaps fire in one batch.
    fn next_wakeup(&self) -> Option<Duration> {
        self.timers
            .values()
            .map(|entry| {
                let slice = entry.deadline.wait_slice() + entry.leeway;
                match entry.deadline {
                    Deadline::Wall(_) => slice.min(WALL_CLOCK_RECHECK),
                    Deadline::Monotonic(_) => slice,
                }
            })
            .min()
    }

    fn take_expired(&mut self) -> Vec<(u64, Arc<Mutex<TimerCallback>>)> {
        self.timers
            .iter()
            .filter(|(_, entry)| entry.deadline.has_passed())
            .map(|(id, entry)| (*id, entry.callback.clone()))
            .collect()
    }
}

/// Manages registered timers and fires them when their deadline is reached.
pub(crate) struct TimerDriver {
    state: Arc<Mutex<State>>,
    changed: Arc<Condvar>,
}

impl TimerDriver {
    fn start() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let changed = Arc::new(Condvar::new());

        let thread_state = state.clone();
        let thread_changed = changed.clone();
        let spawned = thread::Builder::new()
            .name("dispatchq-timer".into())
            .spawn(move || run(thread_state, thread_changed));
        if let Err(err) = spawned {
            tracing::error!("failed to spawn timer thread: {}", err);
        }

        Self { state, changed }
    }

    /// Registers `callback` to fire at `deadline`, within `leeway`.
    pub(crate) fn register(
        &self,
        deadline: Deadline,
        leeway: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.insert(
            id,
            Entry {
                deadline,
                leeway,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        self.changed.notify_one();

        tracing::trace!(timer = id, ?deadline, ?leeway, "timer registered");
        TimerId(id)
    }

    /// Moves an existing timer to a new deadline and leeway.
    ///
    /// # Returns
    /// `false` if the timer already fired for the last time or was cancelled.
    pub(crate) fn reschedule(&self, id: TimerId, deadline: Deadline, leeway: Duration) -> bool {
        let mut state = self.state.lock();
        match state.timers.get_mut(&id.0) {
            Some(entry) => {
                entry.deadline = deadline;
                entry.leeway = leeway;
                self.changed.notify_one();
                true
            }
            None => false,
        }
    }

    /// Unregisters a timer. A callback already running finishes normally.
    pub(crate) fn cancel(&self, id: TimerId) {
        if self.state.lock().timers.remove(&id.0).is_some() {
            tracing::trace!(timer = id.0, "timer cancelled");
        }
    }

    /// Registers a block to run once at `deadline`.
    pub(crate) fn run_at(&self, deadline: Deadline, job: impl FnOnce() + Send + 'static) -> TimerId {
        let mut job = Some(job);
        self.register(
            deadline,
            Duration::ZERO,
            Box::new(move |_| {
                if let Some(job) = job.take() {
                    job();
                }
                None
            }),
        )
    }
}

fn run(state: Arc<Mutex<State>>, changed: Arc<Condvar>) {
    tracing::debug!("timer thread started");

    loop {
        let expired = {
            let mut state = state.lock();
            loop {
                let expired = state.take_expired();
                if !expired.is_empty() {
                    break expired;
                }
                match state.next_wakeup() {
                    Some(wait) => {
                        let _ = changed.wait_for(&mut state, wait);
                    }
                    None => changed.wait(&mut state),
                }
            }
        };

        for (id, callback) in expired {
            let now = Instant::now();
            let next = {
                let mut callback = callback.lock();
                (*callback)(now)
            };

            let mut state = state.lock();
            // The callback's timer may have been cancelled or rescheduled
            // meanwhile; only advance entries still holding this callback.
            let still_current = state
                .timers
                .get(&id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.callback, &callback));
            if !still_current {
                continue;
            }
            match next {
                Some(deadline) => {
                    if let Some(entry) = state.timers.get_mut(&id) {
                        // A reschedule during the callback wins over the
                        // callback's own next deadline.
                        if entry.deadline.has_passed() {
                            entry.deadline = deadline;
                        }
                    }
                }
                None => {
                    let due = state
                        .timers
                        .get(&id)
                        .is_some_and(|entry| entry.deadline.has_passed());
                    if due {
                        state.timers.remove(&id);
                    }
                }
            }
        }
    }
}
