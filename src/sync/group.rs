//! Groups of outstanding work that can be waited on as a whole.

use crate::graph::{NodeId, NodeKind, QueueGraph};
use crate::queue::Queue;
use crate::runtime::Job;
use crate::time::{Clock, Deadline};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct State {
    outstanding: usize,
    notify: Vec<(Queue, Job)>,
}

struct Inner {
    id: NodeId,
    state: Mutex<State>,
    empty: Condvar,
}

impl Drop for Inner {
    fn drop(&mut self) {
        QueueGraph::shared().unregister(self.id);
    }
}

/// Counts outstanding work; waiters unblock once the count drops to zero.
///
/// Work joins with [`enter`](Group::enter) or
/// [`Queue::dispatch_async_in_group`](crate::Queue::dispatch_async_in_group)
/// and leaves with [`leave`](Group::leave).
///
/// # Example
/// ```ignore
/// let group = Group::new();
/// queue.dispatch_async_in_group(&group, || step_one());
/// queue.dispatch_async_in_group(&group, || step_two());
/// group.notify(&Queue::main(), || println!("both done"));
/// ```
#[derive(Clone)]
pub struct Group {
    inner: Arc<Inner>,
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Group {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: QueueGraph::shared().register(NodeKind::Group, None),
                state: Mutex::new(State {
                    outstanding: 0,
                    notify: Vec::new(),
                }),
                empty: Condvar::new(),
            }),
        }
    }

    /// Node of this group in the [`QueueGraph`].
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn enter(&self) {
        self.inner.state.lock().outstanding += 1;
    }

    /// Balances one [`enter`](Self::enter). The last leave wakes every waiter
    /// and dispatches the pending notifications.
    pub fn leave(&self) {
        let notify = {
            let mut state = self.inner.state.lock();
            dispatch_assert!(state.outstanding > 0, "group leave without matching enter");
            if state.outstanding == 0 {
                return;
            }
            state.outstanding -= 1;
            if state.outstanding > 0 {
                return;
            }
            self.inner.empty.notify_all();
            std::mem::take(&mut state.notify)
        };

        for (queue, job) in notify {
            queue.inner.enqueue(job, false);
        }
    }

    pub(crate) fn leave_guard(&self) -> LeaveGuard {
        LeaveGuard(self.clone())
    }

    /// Number of entered but not yet left work items.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Blocks until the group is empty.
    pub fn wait_forever(&self) {
        let _edge = QueueGraph::shared().add_edge_from_current(self.inner.id);
        let mut state = self.inner.state.lock();
        while state.outstanding > 0 {
            self.inner.empty.wait(&mut state);
        }
    }

    /// Blocks until the group is empty or `timeout` elapsed on `clock`.
    ///
    /// # Returns
    /// `true` if the group became empty.
    pub fn wait_timeout(&self, timeout: Duration, clock: Clock) -> bool {
        let deadline = Deadline::after(timeout, clock);
        let _edge = QueueGraph::shared().add_edge_from_current(self.inner.id);
        let mut state = self.inner.state.lock();
        while state.outstanding > 0 {
            if deadline.has_passed() {
                return false;
            }
            let _ = self.inner.empty.wait_for(&mut state, deadline.wait_slice());
        }
        true
    }

    /// Dispatches `block` to `queue` once the group is empty. Runs right
    /// away if it already is.
    pub fn notify<F>(&self, queue: &Queue, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.outstanding == 0 {
            drop(state);
            queue.dispatch_async(block);
        } else {
            state.notify.push((queue.clone(), Box::new(block)));
        }
    }
}

/// Leaves the group when dropped.
pub(crate) struct LeaveGuard(Group);

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}
