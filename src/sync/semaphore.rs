//! Counting semaphores aware of the queue dependency graph.

use crate::graph::{NodeId, NodeKind, QueueGraph};
use crate::time::{Clock, Deadline};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct State {
    // Negative while threads wait: the number of waiters.
    value: i64,
    // Signals handed to waiters that have not woken up yet.
    wakeups: usize,
}

struct Inner {
    id: NodeId,
    state: Mutex<State>,
    signalled: Condvar,
    excluded: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        QueueGraph::shared().unregister(self.id);
    }
}

/// A counting semaphore.
///
/// A wait inside a queue block records an edge from that queue to the
/// semaphore for as long as it blocks. Semaphores used for ordinary
/// producer/consumer hand-off, which never deadlock a queue, can opt out with
/// [`set_excluded_from_graph`](Semaphore::set_excluded_from_graph).
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Semaphore {
    /// Creates a semaphore with an initial count.
    pub fn new(value: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: QueueGraph::shared().register(NodeKind::Semaphore, None),
                state: Mutex::new(State {
                    value: i64::from(value),
                    wakeups: 0,
                }),
                signalled: Condvar::new(),
                excluded: AtomicBool::new(false),
            }),
        }
    }

    /// Node of this semaphore in the [`QueueGraph`].
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Stops recording wait edges for this semaphore.
    pub fn set_excluded_from_graph(&self, excluded: bool) {
        self.inner.excluded.store(excluded, Ordering::Relaxed);
    }

    /// Increments the count, waking one waiter if any.
    ///
    /// # Returns
    /// `true` if a waiting thread was woken.
    pub fn signal(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.value += 1;
        if state.value <= 0 {
            state.wakeups += 1;
            self.inner.signalled.notify_one();
            true
        } else {
            false
        }
    }

    /// Decrements the count, blocking while it is zero.
    pub fn wait_forever(&self) {
        let _edge = self.edge();
        let mut state = self.inner.state.lock();
        state.value -= 1;
        if state.value >= 0 {
            return;
        }
        while state.wakeups == 0 {
            self.inner.signalled.wait(&mut state);
        }
        state.wakeups -= 1;
    }

    /// Alias of [`wait_forever`](Self::wait_forever).
    pub fn wait(&self) {
        self.wait_forever();
    }

    /// Decrements the count, blocking for at most `timeout` on `clock`.
    ///
    /// # Returns
    /// `true` if the semaphore was acquired, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration, clock: Clock) -> bool {
        let deadline = Deadline::after(timeout, clock);
        let _edge = self.edge();
        let mut state = self.inner.state.lock();
        state.value -= 1;
        if state.value >= 0 {
            return true;
        }

        loop {
            if state.wakeups > 0 {
                state.wakeups -= 1;
                return true;
            }
            if deadline.has_passed() {
                state.value += 1;
                return false;
            }
            let _ = self.inner.signalled.wait_for(&mut state, deadline.wait_slice());
        }
    }

    fn edge(&self) -> Option<crate::graph::EdgeGuard> {
        if self.inner.excluded.load(Ordering::Relaxed) {
            return None;
        }
        QueueGraph::shared().add_edge_from_current(self.inner.id)
    }
}
