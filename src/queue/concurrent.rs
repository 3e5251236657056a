//! Concurrent queues with barrier support.

use crate::queue::{Queue, QueueKind, exec, exec::QueueInner};

use std::ops::Deref;

/// A queue running its blocks in parallel.
///
/// Blocks start in FIFO order. A barrier waits until every earlier block
/// finished, runs alone, and holds back every later block until it returned.
///
/// Derefs to [`Queue`] for the common dispatch API.
///
/// # Example
/// ```ignore
/// let queue = ConcurrentQueue::new("com.example.cache");
/// queue.dispatch_async(|| read_cache());
/// queue.dispatch_barrier_async(|| write_cache());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcurrentQueue {
    queue: Queue,
}

impl ConcurrentQueue {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            queue: Queue::from_inner(QueueInner::new(QueueKind::Concurrent, Some(label.into()))),
        }
    }

    /// Enqueues `block` as a barrier and returns immediately.
    pub fn dispatch_barrier_async<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::trace!(queue = ?self.label(), "dispatch barrier async");
        self.queue.inner.enqueue(Box::new(block), true);
    }

    /// Runs `block` as a barrier on the calling thread and waits for it.
    ///
    /// If the queue is already current on this thread, the block runs inline
    /// without barrier semantics.
    pub fn dispatch_barrier_sync<F, R>(&self, block: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        tracing::trace!(queue = ?self.label(), "dispatch barrier sync");
        exec::run_sync(&self.queue, true, block)
    }

    pub fn as_queue(&self) -> &Queue {
        &self.queue
    }
}

impl Deref for ConcurrentQueue {
    type Target = Queue;

    fn deref(&self) -> &Queue {
        &self.queue
    }
}

impl From<ConcurrentQueue> for Queue {
    fn from(queue: ConcurrentQueue) -> Queue {
        queue.queue
    }
}
