//! Event sources: timers, file-system, signal, process and memory observers.
//!
//! An event source turns OS events into blocks on a [`Queue`]. Events arriving
//! faster than the handler runs are coalesced: their data is merged (summed
//! for counts, or-ed for event masks) and the handler runs once with the
//! merged value, which it reads through [`EventSource::data`] or the typed
//! accessor of the concrete source.
//!
//! Sources are created disabled. Events are recorded from creation on but the
//! handler only runs once [`enable`](EventSource::enable) was called.
//! [`cancel`](EventSource::cancel) stops delivery for good and schedules the
//! cancel handler exactly once.
//!
//! Keep a handle to a source while it should stay active: dropping the last
//! handle deregisters it without running the cancel handler. Handlers that
//! capture a handle of their own source keep it alive until it is cancelled.
//!
//! # Example
//!
//! ```ignore
//! use dispatchq::{Queue, source::Timer, time::Clock};
//! use std::time::Duration;
//!
//! let timer = Timer::repeating(Duration::from_millis(10), Duration::ZERO, Clock::Monotonic, &Queue::serial("tick"));
//! let handle = timer.clone();
//! timer.set_event_handler(move || println!("fired {} times", handle.fire_count()));
//! timer.enable();
//! ```

mod file;
mod memory;
mod path;
mod process;
mod reader;
mod signal;
mod timer;

pub use file::FileObserver;
pub use memory::MemoryPressureObserver;
pub use path::PathObserver;
pub use process::ProcessObserver;
pub use reader::FileReader;
pub use signal::SignalObserver;
pub use timer::Timer;

use crate::error::Result;
use crate::object::PauseState;
use crate::queue::Queue;
use crate::reactor::{self, Interest, Token};

use parking_lot::Mutex;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, OnceLock, Weak};

bitflags::bitflags! {
    /// File-system events observable on a file or directory.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FileEvents: u64 {
        /// The file was deleted.
        const DELETE = 0x01;
        /// The file or directory contents changed.
        const WRITE = 0x02;
        /// The file grew.
        const EXTEND = 0x04;
        /// Metadata changed.
        const ATTRIB = 0x08;
        /// The link count changed.
        const LINK = 0x10;
        /// The file was renamed.
        const RENAME = 0x20;
        /// Access was revoked, e.g. the file system was unmounted.
        const REVOKE = 0x40;
    }
}

bitflags::bitflags! {
    /// Process lifecycle events.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ProcessEvents: u64 {
        const EXIT = 0x8000_0000;
        const FORK = 0x4000_0000;
        const EXEC = 0x2000_0000;
        const SIGNAL = 0x0800_0000;
    }
}

bitflags::bitflags! {
    /// Memory pressure levels.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryPressure: u64 {
        const NORMAL = 0x01;
        const WARN = 0x02;
        const CRITICAL = 0x04;
    }
}

/// How new event data combines with data not yet delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Merge {
    Add,
    Or,
    Replace,
}

/// Releases whatever delivers events to a source.
pub(crate) trait Backend: Send + Sync {
    fn deactivate(&self);

    /// Called after each delivery, for registrations that fire once per arm.
    fn rearm(&self) {}
}

type EventHandler = Arc<Mutex<Box<dyn FnMut() + Send>>>;
type CancelHandler = Box<dyn FnOnce() + Send>;

struct State {
    pause: PauseState,
    cancelled: bool,
    pending: u64,
    has_pending: bool,
    observed: u64,
    delivery_scheduled: bool,
    event_handler: Option<EventHandler>,
    cancel_handler: Option<CancelHandler>,
}

pub(crate) struct SourceCore {
    kind: &'static str,
    queue: Queue,
    merge: Merge,
    state: Mutex<State>,
    backend: OnceLock<Box<dyn Backend>>,
}

impl Drop for SourceCore {
    fn drop(&mut self) {
        if !self.state.get_mut().cancelled {
            if let Some(backend) = self.backend.get() {
                backend.deactivate();
            }
            tracing::debug!(kind = self.kind, "source dropped without cancel");
        }
    }
}

impl SourceCore {
    pub(crate) fn new(kind: &'static str, queue: &Queue, merge: Merge) -> Arc<Self> {
        Arc::new(Self {
            kind,
            queue: queue.clone(),
            merge,
            state: Mutex::new(State {
                pause: PauseState::disabled(),
                cancelled: false,
                pending: 0,
                has_pending: false,
                observed: 0,
                delivery_scheduled: false,
                event_handler: None,
                cancel_handler: None,
            }),
            backend: OnceLock::new(),
        })
    }

    pub(crate) fn set_backend(&self, backend: Box<dyn Backend>) {
        if self.backend.set(backend).is_err() {
            tracing::error!(kind = self.kind, "source backend installed twice");
        }
    }

    /// Records event data and schedules a delivery unless one is pending.
    pub(crate) fn merge_data(self: &Arc<Self>, data: u64) {
        let schedule = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.pending = match self.merge {
                Merge::Add => state.pending.saturating_add(data),
                Merge::Or => state.pending | data,
                Merge::Replace => data,
            };
            state.has_pending = true;
            Self::claim_delivery(&mut state)
        };
        if schedule {
            self.schedule_delivery();
        }
    }

    fn claim_delivery(state: &mut State) -> bool {
        if state.has_pending && !state.delivery_scheduled && !state.pause.is_paused() && !state.cancelled {
            state.delivery_scheduled = true;
            true
        } else {
            false
        }
    }

    fn schedule_delivery(self: &Arc<Self>) {
        let core = self.clone();
        self.queue.dispatch_async(move || core.deliver());
    }

    fn deliver(self: &Arc<Self>) {
        let handler = {
            let mut state = self.state.lock();
            state.delivery_scheduled = false;
            if state.cancelled || !state.has_pending || state.pause.is_paused() {
                return;
            }
            state.observed = std::mem::take(&mut state.pending);
            state.has_pending = false;
            state.event_handler.clone()
        };

        if let Some(handler) = handler {
            tracing::trace!(kind = self.kind, "delivering source event");
            let mut handler = handler.lock();
            (*handler)();
        }
        if self.is_cancelled() {
            return;
        }
        if let Some(backend) = self.backend.get() {
            backend.rearm();
        }
    }

    // Schedules a delivery held back while the source was paused.
    fn unpaused(self: &Arc<Self>) {
        let schedule = Self::claim_delivery(&mut self.state.lock());
        if schedule {
            self.schedule_delivery();
        }
    }

    pub(crate) fn data(&self) -> u64 {
        self.state.lock().observed
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn set_event_handler(&self, handler: EventHandler) {
        let previous = {
            let mut state = self.state.lock();
            let cancelled = state.cancelled;
            dispatch_assert!(!cancelled, "event handler set on a cancelled {} source", self.kind);
            if cancelled {
                return;
            }
            state.event_handler.replace(handler)
        };
        drop(previous);
    }

    fn set_cancel_handler(&self, handler: CancelHandler) {
        let previous = {
            let mut state = self.state.lock();
            let cancelled = state.cancelled;
            dispatch_assert!(!cancelled, "cancel handler set on a cancelled {} source", self.kind);
            if cancelled {
                return;
            }
            state.cancel_handler.replace(handler)
        };
        drop(previous);
    }

    pub(crate) fn cancel(self: &Arc<Self>) {
        let (event_handler, cancel_handler) = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.has_pending = false;
            (state.event_handler.take(), state.cancel_handler.take())
        };
        drop(event_handler);

        if let Some(backend) = self.backend.get() {
            backend.deactivate();
        }
        if let Some(handler) = cancel_handler {
            self.queue.dispatch_async(handler);
        }
        tracing::debug!(kind = self.kind, "source cancelled");
    }
}

/// Behaviour shared by every event source.
#[derive(Clone)]
pub struct EventSource {
    pub(crate) core: Arc<SourceCore>,
}

impl EventSource {
    pub(crate) fn new(core: Arc<SourceCore>) -> Self {
        Self { core }
    }

    /// Sets the block run on the source's queue for every (coalesced) event.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.core.set_event_handler(Arc::new(Mutex::new(Box::new(handler))));
    }

    /// Sets the block run once on the source's queue after cancellation.
    pub fn set_cancel_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.set_cancel_handler(Box::new(handler));
    }

    /// Starts or restarts delivery. Undoes any number of [`disable`](Self::disable) calls.
    pub fn enable(&self) {
        self.core.state.lock().pause.enable();
        self.core.unpaused();
    }

    /// Holds back delivery until [`enable`](Self::enable). Does not nest.
    pub fn disable(&self) {
        self.core.state.lock().pause.disable();
    }

    /// Holds back delivery until balanced by [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.core.state.lock().pause.suspend();
    }

    pub fn resume(&self) {
        let balanced = self.core.state.lock().pause.resume();
        dispatch_assert!(balanced, "resume of {} source without matching suspend", self.core.kind);
        self.core.unpaused();
    }

    /// Stops delivery and schedules the cancel handler. Later calls do nothing.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Data merged from the events of the current delivery.
    pub fn data(&self) -> u64 {
        self.core.data()
    }

    pub fn queue(&self) -> &Queue {
        &self.core.queue
    }
}

/// Reactor registrations owned by a source, released on cancel.
pub(crate) struct Registered {
    tokens: Mutex<Vec<Token>>,
    retained: Mutex<Vec<OwnedFd>>,
}

impl Registered {
    pub(crate) fn new() -> Self {
        Self {
            tokens: Mutex::new(Vec::new()),
            retained: Mutex::new(Vec::new()),
        }
    }

    /// Keeps `fd` open until the source is cancelled.
    pub(crate) fn retain(&self, fd: OwnedFd) {
        self.retained.lock().push(fd);
    }

    /// Registers `interest`; each event merges `map(data)` into `core`.
    pub(crate) fn register<M>(&self, core: &Arc<SourceCore>, interest: Interest, map: M) -> Result<()>
    where
        M: Fn(u64) -> u64 + Send + Sync + 'static,
    {
        let weak: Weak<SourceCore> = Arc::downgrade(core);
        let token = reactor::reactor()?.register(
            interest,
            Arc::new(move |data| {
                if let Some(core) = weak.upgrade() {
                    core.merge_data(map(data));
                }
            }),
        )?;
        self.tokens.lock().push(token);
        Ok(())
    }
}

impl Backend for Registered {
    fn deactivate(&self) {
        let tokens = std::mem::take(&mut *self.tokens.lock());
        if let Ok(reactor) = reactor::reactor() {
            for token in tokens {
                reactor.deregister(token);
            }
        }
        self.retained.lock().clear();
    }

    fn rearm(&self) {
        let tokens = self.tokens.lock().clone();
        if let Ok(reactor) = reactor::reactor() {
            for token in tokens {
                reactor.rearm(token);
            }
        }
    }
}

/// Registers `interest` for a new source and installs the registration as
/// its backend, keeping `retained` open until cancellation.
pub(crate) fn activate<M>(core: &Arc<SourceCore>, interest: Interest, retained: Option<OwnedFd>, map: M) -> Result<()>
where
    M: Fn(u64) -> u64 + Send + Sync + 'static,
{
    let registered = Registered::new();
    if let Some(fd) = retained {
        registered.retain(fd);
    }
    registered.register(core, interest, map)?;
    core.set_backend(Box::new(registered));
    Ok(())
}
