//! The main queue and the thread serving it.
//!
//! The main queue is a serial queue whose blocks always run on one dedicated
//! `dispatchq-main` thread, started on first use. Synchronous dispatch from
//! another thread hops to that thread and waits there for the result.

use crate::queue::{Priority, Queue, QueueKind, exec::QueueInner};
use crate::runtime::{Job, JobQueue, run_job};

use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

static MAIN_QUEUE: OnceLock<Queue> = OnceLock::new();
static MAIN_THREAD: OnceLock<MainThread> = OnceLock::new();

pub(crate) fn main_queue() -> &'static Queue {
    MAIN_QUEUE.get_or_init(|| {
        Queue::from_inner(QueueInner::new(
            QueueKind::Main,
            Some("dispatchq.main".to_owned()),
        ))
    })
}

pub(crate) fn main_thread() -> &'static MainThread {
    MAIN_THREAD.get_or_init(MainThread::start)
}

/// Checks if the calling thread is the one serving the main queue.
pub fn is_main_thread() -> bool {
    MAIN_THREAD
        .get()
        .and_then(|main| main.thread)
        .is_some_and(|id| id == thread::current().id())
}

pub(crate) struct MainThread {
    jobs: Arc<JobQueue>,
    thread: Option<ThreadId>,
}

impl MainThread {
    fn start() -> Self {
        let jobs = Arc::new(JobQueue::new());
        let thread_jobs = jobs.clone();

        let spawned = thread::Builder::new()
            .name("dispatchq-main".into())
            .spawn(move || {
                tracing::debug!("main queue thread started");
                while let Some(job) = thread_jobs.pop(None) {
                    run_job(job);
                }
            });

        let thread = match spawned {
            Ok(handle) => Some(handle.thread().id()),
            Err(err) => {
                tracing::error!("failed to spawn main queue thread: {}", err);
                None
            }
        };

        Self { jobs, thread }
    }

    pub(crate) fn push(&self, job: Job) {
        self.jobs.push(Priority::High, job);
    }
}
