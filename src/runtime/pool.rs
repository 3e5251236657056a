//! Elastic worker pool executing jobs for every non-main queue.
//!
//! The pool keeps `min_threads` workers parked while idle and grows on
//! demand up to `max_threads`: whenever a job is pushed and no parked worker
//! picks it up, a new worker is started. Threads blocked in a synchronous
//! dispatch therefore never starve the jobs they wait for. Surplus workers
//! exit after `idle_timeout` without work.

use crate::config::{self, DispatchConfig};
use crate::queue::Priority;
use crate::runtime::queue::{Job, JobQueue};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

static POOL: OnceLock<WorkerPool> = OnceLock::new();

/// Returns the process-wide pool, starting it on first use.
pub(crate) fn pool() -> &'static WorkerPool {
    POOL.get_or_init(|| WorkerPool::new(config::get()))
}

/// Shared worker pool state.
pub(crate) struct WorkerPool {
    jobs: Arc<JobQueue>,
    threads: Arc<AtomicUsize>,
    spawned: AtomicUsize,
    min_threads: usize,
    max_threads: usize,
    idle_timeout: std::time::Duration,
}

impl WorkerPool {
    fn new(config: &DispatchConfig) -> Self {
        tracing::debug!(
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            "starting worker pool"
        );

        Self {
            jobs: Arc::new(JobQueue::new()),
            threads: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
            min_threads: config.min_threads,
            max_threads: config.max_threads.max(1),
            idle_timeout: config.idle_timeout,
        }
    }

    /// Queues `job` for execution at `priority`.
    pub(crate) fn spawn(&self, priority: Priority, job: Job) {
        if !self.jobs.push(priority, job) {
            self.grow();
        }
    }

    // Starts one more worker unless the pool is at its limit.
    fn grow(&self) {
        let reserved = self
            .threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_threads).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::trace!(max_threads = self.max_threads, "worker pool at capacity");
            return;
        }

        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let jobs = self.jobs.clone();
        let threads = self.threads.clone();
        let min_threads = self.min_threads;
        let idle_timeout = self.idle_timeout;

        let spawned = thread::Builder::new()
            .name(format!("dispatchq-worker-{}", index))
            .spawn(move || worker_loop(jobs, threads, min_threads, idle_timeout));

        if let Err(err) = spawned {
            self.threads.fetch_sub(1, Ordering::AcqRel);
            tracing::error!("failed to spawn worker thread: {}", err);
        }
    }
}

fn worker_loop(
    jobs: Arc<JobQueue>,
    threads: Arc<AtomicUsize>,
    min_threads: usize,
    idle_timeout: std::time::Duration,
) {
    tracing::debug!("worker started");

    loop {
        match jobs.pop(Some(idle_timeout)) {
            Some(job) => run_job(job),
            None => {
                let retired = threads
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n > min_threads).then(|| n - 1)
                    })
                    .is_ok();
                if retired {
                    break;
                }
            }
        }
    }

    tracing::debug!("worker exiting after idle timeout");
}

/// Runs a job, logging instead of propagating a panic.
pub(crate) fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!("dispatched block panicked: {}", panic_message(&*payload));
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
