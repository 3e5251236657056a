//! Execution core shared by every queue flavor.
//!
//! Each queue owns a FIFO of items. An item is either an asynchronous job or
//! the reservation of a synchronous caller. Items flagged `exclusive` (every
//! item of a serial queue, barriers on a concurrent queue) run alone: they
//! start only once nothing else runs, and nothing starts while they run.
//! Non-exclusive items start as soon as they reach the head of the FIFO.
//!
//! Jobs that start are handed to the queue's executor: the worker pool, the
//! main thread, or the target queue. Synchronous reservations are granted by
//! waking the caller, which then runs its block on its own thread.

use crate::graph::{NodeId, NodeKind, QueueGraph};
use crate::object::PauseState;
use crate::queue::{Priority, Queue, QueueKind, main};
use crate::runtime::{Job, Latch, context, erase_lifetime, panic_message, pool};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

enum Item {
    Async { job: Job, exclusive: bool },
    Sync { grant: Arc<Latch>, exclusive: bool },
}

impl Item {
    fn exclusive(&self) -> bool {
        match self {
            Item::Async { exclusive, .. } | Item::Sync { exclusive, .. } => *exclusive,
        }
    }
}

struct State {
    items: VecDeque<Item>,
    pause: PauseState,
    running: usize,
    exclusive_running: bool,
    target: Option<Queue>,
}

pub(crate) struct QueueInner {
    pub(crate) id: NodeId,
    pub(crate) label: Option<String>,
    pub(crate) kind: QueueKind,
    state: Mutex<State>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        QueueGraph::shared().unregister(self.id);
        tracing::trace!(label = ?self.label, "queue dropped");
    }
}

// Marks a started item as finished when dropped, also while unwinding.
pub(crate) struct Finish {
    inner: Arc<QueueInner>,
    exclusive: bool,
}

impl Drop for Finish {
    fn drop(&mut self) {
        self.inner.finish(self.exclusive);
    }
}

impl QueueInner {
    pub(crate) fn new(kind: QueueKind, label: Option<String>) -> Arc<Self> {
        let label = label.filter(|label| !label.is_empty());
        let id = QueueGraph::shared().register(NodeKind::Queue, label.as_deref());
        tracing::debug!(?kind, label = ?label, %id, "queue created");

        Arc::new(Self {
            id,
            label,
            kind,
            state: Mutex::new(State {
                items: VecDeque::new(),
                pause: PauseState::default(),
                running: 0,
                exclusive_running: false,
                target: None,
            }),
        })
    }

    fn is_exclusive(&self, barrier: bool) -> bool {
        match self.kind {
            QueueKind::Serial | QueueKind::Main => true,
            QueueKind::Concurrent => barrier,
            QueueKind::Global(_) => false,
        }
    }

    /// Enqueues an asynchronous job.
    pub(crate) fn enqueue(self: &Arc<Self>, job: Job, barrier: bool) {
        if let QueueKind::Global(priority) = self.kind {
            let queue = Queue::from_inner(self.clone());
            pool().spawn(
                priority,
                Box::new(move || {
                    let _current = context::enter(&queue);
                    job();
                }),
            );
            return;
        }

        let exclusive = self.is_exclusive(barrier);
        self.state.lock().items.push_back(Item::Async { job, exclusive });
        self.pump();
    }

    /// Blocks until a synchronous reservation reaches its turn.
    ///
    /// The queue counts the caller as running until the returned guard drops.
    pub(crate) fn acquire(self: &Arc<Self>, barrier: bool) -> Finish {
        let exclusive = self.is_exclusive(barrier);
        let grant = Arc::new(Latch::new());
        self.state.lock().items.push_back(Item::Sync {
            grant: grant.clone(),
            exclusive,
        });
        self.pump();
        grant.wait();

        Finish {
            inner: self.clone(),
            exclusive,
        }
    }

    // Starts every item allowed to run now.
    fn pump(self: &Arc<Self>) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            while !state.pause.is_paused() && !state.exclusive_running {
                let Some(front) = state.items.front() else {
                    break;
                };
                if front.exclusive() {
                    if state.running > 0 {
                        break;
                    }
                    state.exclusive_running = true;
                } else {
                    state.running += 1;
                }
                if let Some(item) = state.items.pop_front() {
                    let exclusive = item.exclusive();
                    ready.push(item);
                    if exclusive {
                        break;
                    }
                }
            }
        }

        for item in ready {
            self.start(item);
        }
    }

    fn finish(self: &Arc<Self>, exclusive: bool) {
        {
            let mut state = self.state.lock();
            if exclusive {
                state.exclusive_running = false;
            } else {
                state.running = state.running.saturating_sub(1);
            }
        }
        self.pump();
    }

    fn start(self: &Arc<Self>, item: Item) {
        match item {
            Item::Sync { grant, .. } => grant.set(),
            Item::Async { job, exclusive } => {
                let queue = Queue::from_inner(self.clone());
                let finish = Finish {
                    inner: self.clone(),
                    exclusive,
                };
                self.submit(Box::new(move || {
                    let _finish = finish;
                    let _current = context::enter(&queue);
                    job();
                }));
            }
        }
    }

    // Hands a started job to whatever executes this queue's blocks.
    fn submit(self: &Arc<Self>, job: Job) {
        let target = self.state.lock().target.clone();
        match (self.kind, target) {
            (QueueKind::Main, _) => main::main_thread().push(job),
            (_, Some(target)) => target.inner.enqueue(job, false),
            (QueueKind::Global(priority), None) => pool().spawn(priority, job),
            _ => pool().spawn(Priority::Default, job),
        }
    }

    pub(crate) fn suspend(&self) {
        self.state.lock().pause.suspend();
    }

    pub(crate) fn resume(self: &Arc<Self>) {
        let balanced = self.state.lock().pause.resume();
        dispatch_assert!(balanced, "resume of queue {:?} without matching suspend", self.label);
        self.pump();
    }

    pub(crate) fn disable(&self) {
        self.state.lock().pause.disable();
    }

    pub(crate) fn enable(self: &Arc<Self>) {
        self.state.lock().pause.enable();
        self.pump();
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.state.lock().pause.is_suspended()
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.state.lock().pause.is_disabled()
    }

    pub(crate) fn target(&self) -> Option<Queue> {
        self.state.lock().target.clone()
    }

    pub(crate) fn set_target(&self, target: Option<Queue>) {
        self.state.lock().target = target;
    }
}

/// Runs `function` on `queue` and blocks until it returned.
///
/// The block runs on the calling thread, except for the main queue whose
/// blocks always run on the main-queue thread.
pub(crate) fn run_sync<F, R>(queue: &Queue, barrier: bool, function: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    if queue.is_current() {
        tracing::trace!(queue = ?queue.label(), "synchronous dispatch to current queue runs inline");
        return function();
    }

    let _edge = QueueGraph::shared().add_edge_from_current(queue.id());

    match queue.inner.kind {
        QueueKind::Global(_) => context::with_current(queue, function),
        QueueKind::Main => run_on_main(queue, function),
        QueueKind::Serial | QueueKind::Concurrent => {
            let _finish = queue.inner.acquire(barrier);
            match queue.inner.target() {
                Some(target) => run_on_target(queue, &target, function),
                None => context::with_current(queue, function),
            }
        }
    }
}

// Holding `queue`, also acquires its target. `queue` is entered first so the
// wait is recorded as `queue -> target`. The block is boxed so that walking a
// target chain reuses one instantiation of `run_sync`.
fn run_on_target<F, R>(queue: &Queue, target: &Queue, function: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let mut result = None;
    {
        let result = &mut result;
        let job: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
            *result = Some(context::with_current(queue, function));
        });
        let _holding = context::enter(queue);
        run_sync(target, false, job);
    }

    match result {
        Some(value) => value,
        None => unreachable!("target queue returned without running the block"),
    }
}

// Hops to the main-queue thread. The block inherits the caller's current
// queues so that re-entrant dispatches back to them run inline.
fn run_on_main<F, R>(queue: &Queue, function: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let frames = context::snapshot();
    let done = Arc::new(Latch::new());
    let slot = Arc::new(Mutex::new(None));

    let job: Box<dyn FnOnce() + Send + '_> = {
        let done = done.clone();
        let slot = slot.clone();
        let main = queue.clone();
        Box::new(move || {
            let outcome = {
                let _inherited = context::enter_all(&frames);
                let _main = context::enter(&main);
                panic::catch_unwind(AssertUnwindSafe(function))
            };
            *slot.lock() = Some(outcome);
            drop(slot);
            drop(frames);
            done.set();
        })
    };

    // SAFETY: the job's borrows end before it sets `done`, and this
    // function does not return before `done` is set.
    let job = unsafe { erase_lifetime(job) };
    queue.inner.enqueue(job, false);
    done.wait();

    let outcome = slot.lock().take();
    match outcome {
        Some(Ok(value)) => value,
        Some(Err(payload)) => {
            tracing::error!("synchronous block panicked on the main queue: {}", panic_message(&*payload));
            panic::resume_unwind(payload)
        }
        None => panic!("main queue finished a synchronous block without a result"),
    }
}
