//! Dispatch queues: serial, concurrent, main and global.
//!
//! A [`Queue`] executes blocks in FIFO order. Every flavor supports the same
//! dispatch entry points:
//!
//! - [`Queue::dispatch_async`] enqueues a block and returns immediately
//! - [`Queue::dispatch_sync`] blocks the caller until the block ran
//! - [`Queue::dispatch_dynamic`] runs inline if the queue is already current
//!   on this thread, otherwise dispatches asynchronously
//!
//! Serial queues run one block at a time. [`ConcurrentQueue`] runs blocks in
//! parallel and adds barriers. The main queue runs every block on one
//! dedicated thread. Global queues are concurrent queues that ignore
//! suspension.
//!
//! Synchronous dispatch runs the block on the calling thread and records a
//! wait edge in the [`QueueGraph`](crate::QueueGraph), so deadlocks can be
//! detected while the program runs. A synchronous dispatch to a queue that is
//! already current on this thread runs inline instead of deadlocking.
//!
//! # Example
//!
//! ```ignore
//! use dispatchq::Queue;
//!
//! let queue = Queue::serial("com.example.worker");
//! queue.dispatch_async(|| println!("later"));
//! let answer = queue.dispatch_sync(|| 42);
//! assert_eq!(answer, 42);
//! ```

mod concurrent;
pub(crate) mod exec;
pub(crate) mod main;

pub use concurrent::ConcurrentQueue;
pub use main::is_main_thread;

use crate::error::{DispatchError, Result};
use crate::graph::{NodeId, QueueGraph};
use crate::runtime::{Countdown, context, erase_lifetime};
use crate::sync::Group;
use crate::time::{self, Clock, Deadline};

use exec::QueueInner;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

/// Scheduling priority of a global queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    #[default]
    Default,
    Low,
    Background,
}

impl Priority {
    pub(crate) fn tier(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Priority::High => "dispatchq.global.high",
            Priority::Default => "dispatchq.global.default",
            Priority::Low => "dispatchq.global.low",
            Priority::Background => "dispatchq.global.background",
        }
    }
}

/// Flavor of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Serial,
    Concurrent,
    Main,
    Global(Priority),
}

/// How [`Queue::dispatch_with_kind`] dispatches a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchKind {
    #[default]
    Async,
    Sync,
    /// Inline if the queue is current on this thread, asynchronous otherwise.
    Dynamic,
}

/// Handle to a dispatch queue.
///
/// Cheap to clone. Two handles are equal when they refer to the same queue.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

impl Queue {
    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self { inner }
    }

    /// Creates a serial queue. An empty label leaves the queue unlabelled.
    pub fn serial(label: impl Into<String>) -> Self {
        Self::from_inner(QueueInner::new(QueueKind::Serial, Some(label.into())))
    }

    /// Returns the main queue, served by a single dedicated thread.
    pub fn main() -> Queue {
        main::main_queue().clone()
    }

    /// Returns the global concurrent queue of `priority`.
    pub fn global(priority: Priority) -> Queue {
        static GLOBALS: OnceLock<[Queue; 4]> = OnceLock::new();

        let globals = GLOBALS.get_or_init(|| {
            [
                Priority::High,
                Priority::Default,
                Priority::Low,
                Priority::Background,
            ]
            .map(|priority| {
                Queue::from_inner(QueueInner::new(
                    QueueKind::Global(priority),
                    Some(priority.label().to_owned()),
                ))
            })
        });
        globals[priority.tier()].clone()
    }

    /// The innermost queue current on this thread, if any.
    pub fn current() -> Option<Queue> {
        context::innermost()
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// Node of this queue in the [`QueueGraph`].
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Checks if this thread currently runs a block for this queue, directly
    /// or through a synchronous dispatch.
    pub fn is_current(&self) -> bool {
        context::is_current(self.inner.id)
    }

    /// Enqueues `block` and returns immediately.
    pub fn dispatch_async<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::trace!(queue = ?self.label(), "dispatch async");
        self.inner.enqueue(Box::new(block), false);
    }

    /// Runs `block` on this queue and waits for its result.
    ///
    /// Runs inline if the queue is already current on this thread. A panic
    /// inside the block propagates to the caller.
    pub fn dispatch_sync<F, R>(&self, block: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        tracing::trace!(queue = ?self.label(), "dispatch sync");
        exec::run_sync(self, false, block)
    }

    /// Runs `block` inline if this queue is current, asynchronously otherwise.
    pub fn dispatch_dynamic<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            block();
        } else {
            self.dispatch_async(block);
        }
    }

    /// Dispatches `block` the way `kind` selects.
    pub fn dispatch_with_kind<F>(&self, kind: DispatchKind, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match kind {
            DispatchKind::Async => self.dispatch_async(block),
            DispatchKind::Sync => self.dispatch_sync(block),
            DispatchKind::Dynamic => self.dispatch_dynamic(block),
        }
    }

    /// Dispatches `block` after `delay`, measured on `clock`.
    pub fn dispatch_after<F>(&self, delay: Duration, clock: Clock, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.clone();
        time::driver().run_at(Deadline::after(delay, clock), move || queue.dispatch_async(block));
    }

    /// Dispatches `block` once the wall clock reaches `when`.
    pub fn dispatch_at<F>(&self, when: SystemTime, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.clone();
        time::driver().run_at(Deadline::at(when), move || queue.dispatch_async(block));
    }

    /// Dispatches `block` as a member of `group`.
    ///
    /// The group counts the block as outstanding until it returned.
    pub fn dispatch_async_in_group<F>(&self, group: &Group, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        group.enter();
        // Waiting on the group depends on this queue running the block.
        let edge = match self.kind() {
            QueueKind::Serial | QueueKind::Main => QueueGraph::shared().add_edge(group.id(), self.id()),
            _ => None,
        };
        let leave = group.leave_guard();
        self.dispatch_async(move || {
            let _leave = leave;
            let _edge = edge;
            block();
        });
    }

    /// Runs `block(index)` for every index in `0..iterations` and waits for
    /// all of them. Concurrent queues run iterations in parallel.
    pub fn dispatch_apply<F>(&self, iterations: usize, block: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        if iterations == 0 {
            return;
        }

        let parallel = matches!(self.kind(), QueueKind::Concurrent | QueueKind::Global(_));
        if !parallel || self.is_current() {
            let block = &block;
            self.dispatch_sync(move || (0..iterations).for_each(block));
            return;
        }

        let _edge = QueueGraph::shared().add_edge_from_current(self.id());
        let countdown = Arc::new(Countdown::new(iterations));
        for index in 0..iterations {
            let block = &block;
            let countdown = countdown.clone();
            let job: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| block(index)));
                countdown.complete(outcome);
            });
            // SAFETY: `countdown.wait()` below returns only after every job
            // completed, and completing is each job's last use of `block`.
            let job = unsafe { erase_lifetime(job) };
            self.inner.enqueue(job, false);
        }

        if let Some(payload) = countdown.wait() {
            panic::resume_unwind(payload);
        }
    }

    /// Runs `block` on this thread with this queue marked as current.
    pub fn perform_as_current<F, R>(&self, block: F) -> R
    where
        F: FnOnce() -> R,
    {
        context::with_current(self, block)
    }

    /// Suspends the queue. Blocks already running continue; queued blocks
    /// wait until every suspend was balanced by a [`resume`](Self::resume).
    ///
    /// Has no effect on global queues.
    pub fn suspend(&self) {
        if self.is_global() {
            return;
        }
        self.inner.suspend();
    }

    pub fn resume(&self) {
        if self.is_global() {
            return;
        }
        self.inner.resume();
    }

    /// Pauses the queue until [`enable`](Self::enable). Does not nest.
    ///
    /// Has no effect on global queues.
    pub fn disable(&self) {
        if self.is_global() {
            return;
        }
        self.inner.disable();
    }

    pub fn enable(&self) {
        if self.is_global() {
            return;
        }
        self.inner.enable();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.is_suspended()
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_disabled()
    }

    /// The queue this queue forwards its blocks to, if any.
    pub fn target(&self) -> Option<Queue> {
        self.inner.target()
    }

    /// Forwards this queue's blocks to `target`, or stops forwarding.
    ///
    /// Blocks keep this queue's ordering and additionally run under the
    /// target's exclusion.
    ///
    /// # Errors
    /// - [`DispatchError::InvalidTarget`] unless this is a serial queue
    /// - [`DispatchError::TargetCycle`] if `target` forwards back to this queue
    pub fn set_target(&self, target: Option<&Queue>) -> Result<()> {
        match self.kind() {
            QueueKind::Serial => {}
            QueueKind::Concurrent => return Err(DispatchError::InvalidTarget("a concurrent queue")),
            QueueKind::Main => return Err(DispatchError::InvalidTarget("the main queue")),
            QueueKind::Global(_) => return Err(DispatchError::InvalidTarget("a global queue")),
        }

        let mut cursor = target.cloned();
        while let Some(queue) = cursor {
            if queue == *self {
                return Err(DispatchError::TargetCycle);
            }
            cursor = queue.target();
        }

        self.inner.set_target(target.cloned());
        tracing::debug!(queue = ?self.label(), target = ?target.and_then(Queue::label), "target queue set");
        Ok(())
    }

    fn is_global(&self) -> bool {
        matches!(self.kind(), QueueKind::Global(_))
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Queue {}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("label", &self.label())
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}
