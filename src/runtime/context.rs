//! Thread-local tracking of the queues a thread is currently running blocks for.
//!
//! Every time a block starts executing on behalf of a queue, that queue is
//! pushed onto the executing thread's stack and popped again when the block
//! returns (or unwinds). A synchronous dispatch that runs on the caller's
//! thread pushes the target on top of the caller's frames, so the stack holds
//! every queue the thread is logically "inside".
//!
//! # Purpose
//!
//! - Answers "is this queue current?" for self-sync and dynamic dispatch.
//! - Provides the innermost queue, which is the source node of dependency
//!   graph edges.
//! - Lets the main-queue thread inherit a blocked caller's frames.
//!
//! # Example
//!
//! ```ignore
//! let _current = context::enter(&queue);
//! assert!(context::is_current(queue.id()));
//! ```

use crate::graph::NodeId;
use crate::queue::Queue;

use std::cell::RefCell;
use std::fmt::Write as _;

thread_local! {
    /// Stack of queues entered on this thread, innermost last.
    static CURRENT_QUEUES: RefCell<Vec<Queue>> = const { RefCell::new(Vec::new()) };
}

/// Pops the frames pushed by [`enter`] or [`enter_all`] when dropped.
#[must_use = "the queue stops being current as soon as the guard is dropped"]
pub(crate) struct CurrentGuard {
    depth: usize,
    pushed: usize,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        // Frames released after the pop so that dropping the last queue handle
        // does not happen while the stack is borrowed.
        let popped = CURRENT_QUEUES.with(|stack| {
            let mut stack = stack.borrow_mut();
            let len = stack.len();
            debug_assert_eq!(len, self.depth + self.pushed, "unbalanced queue stack");
            stack.split_off(self.depth.min(len))
        });
        drop(popped);
    }
}

/// Marks `queue` as current on this thread until the returned guard drops.
pub(crate) fn enter(queue: &Queue) -> CurrentGuard {
    CURRENT_QUEUES.with(|stack| {
        let mut stack = stack.borrow_mut();
        let depth = stack.len();
        stack.push(queue.clone());
        CurrentGuard { depth, pushed: 1 }
    })
}

/// Pushes every frame of `frames`, outermost first.
pub(crate) fn enter_all(frames: &[Queue]) -> CurrentGuard {
    CURRENT_QUEUES.with(|stack| {
        let mut stack = stack.borrow_mut();
        let depth = stack.len();
        stack.extend(frames.iter().cloned());
        CurrentGuard {
            depth,
            pushed: frames.len(),
        }
    })
}

/// Runs `function` with `queue` pushed as the innermost current queue.
pub(crate) fn with_current<F, R>(queue: &Queue, function: F) -> R
where
    F: FnOnce() -> R,
{
    let _current = enter(queue);
    function()
}

/// Checks if the queue identified by `id` is anywhere on this thread's stack.
pub(crate) fn is_current(id: NodeId) -> bool {
    CURRENT_QUEUES.with(|stack| stack.borrow().iter().any(|queue| queue.id() == id))
}

/// Returns the innermost current queue of this thread.
pub fn innermost() -> Option<Queue> {
    CURRENT_QUEUES.with(|stack| stack.borrow().last().cloned())
}

/// Node id of the innermost current queue, if any.
pub(crate) fn innermost_id() -> Option<NodeId> {
    CURRENT_QUEUES.with(|stack| stack.borrow().last().map(Queue::id))
}

/// Copies this thread's stack, outermost first.
pub(crate) fn snapshot() -> Vec<Queue> {
    CURRENT_QUEUES.with(|stack| stack.borrow().clone())
}

/// Renders this thread's current queues, innermost first.
///
/// Intended for debugging output, e.g. `tracing::debug!("{}", dump_current_queues())`.
pub fn dump_current_queues() -> String {
    CURRENT_QUEUES.with(|stack| {
        let stack = stack.borrow();
        let mut out = String::new();

        if stack.is_empty() {
            out.push_str("no current queues");
            return out;
        }

        for (level, queue) in stack.iter().rev().enumerate() {
            let _ = writeln!(out, "#{} {:?}", level, queue);
        }
        out
    })
}
