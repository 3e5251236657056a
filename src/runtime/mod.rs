//! Runtime subsystem modules.

pub(crate) mod context;
pub(crate) mod latch;
pub(crate) mod pool;
pub(crate) mod queue;

pub use context::{dump_current_queues, innermost as current_queue};
pub(crate) use latch::{Countdown, Latch};
pub(crate) use pool::{panic_message, pool, run_job};
pub(crate) use queue::{Job, JobQueue};

/// Extends the lifetime of a boxed block to `'static`.
///
/// # Safety
/// The caller must not return before the job ran to completion and every
/// borrow it holds was released, e.g. by blocking on a [`Latch`] set as the
/// job's last action.
pub(crate) unsafe fn erase_lifetime<'a>(job: Box<dyn FnOnce() + Send + 'a>) -> Job {
    // SAFETY: only the lifetime changes; the caller upholds it.
    unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + 'a>, Job>(job) }
}
