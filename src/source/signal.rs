//! Signal observation through a self-pipe.
//!
//! The first observer of a signal installs a process-wide handler that writes
//! the signal number to a non-blocking pipe. The reactor drains the pipe and
//! merges one count per received signal into every observer of that signal.
//! The previous disposition is restored when the last observer goes away.

use crate::error::Result;
use crate::queue::Queue;
use crate::reactor::{self, Interest, cvt, errno_location};
use crate::source::{Backend, EventSource, Merge, SourceCore};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static HUB: OnceLock<std::result::Result<SignalHub, (io::ErrorKind, String)>> = OnceLock::new();

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let errno = errno_location();
    // SAFETY: write(2) is async-signal-safe; errno is restored for the
    // interrupted code.
    unsafe {
        let saved = if errno.is_null() { 0 } else { *errno };
        let byte = signo as u8;
        libc::write(fd, (&byte as *const u8).cast(), 1);
        if !errno.is_null() {
            *errno = saved;
        }
    }
}

struct Slot {
    previous: libc::sigaction,
    observers: Vec<(u64, Weak<SourceCore>)>,
}

struct SignalHub {
    _read: OwnedFd,
    _write: OwnedFd,
    slots: Mutex<HashMap<i32, Slot>>,
    next_id: AtomicU64,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

fn hub() -> io::Result<&'static SignalHub> {
    let hub = HUB
        .get_or_init(|| SignalHub::new().map_err(|err| (err.kind(), err.to_string())))
        .as_ref()
        .map_err(|(kind, message)| io::Error::new(*kind, message.clone()))?;
    Ok(hub)
}

impl SignalHub {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(read.as_raw_fd())?;
        set_nonblocking(write.as_raw_fd())?;

        let read_fd = read.as_raw_fd();
        reactor::reactor()?.register(
            Interest::Readable {
                fd: read_fd,
                oneshot: false,
            },
            Arc::new(move |_| drain(read_fd)),
        )?;
        WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        tracing::debug!("signal pipe installed");
        Ok(Self {
            _read: read,
            _write: write,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn observe(&self, signo: i32, core: Weak<SourceCore>) -> io::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();

        if !slots.contains_key(&signo) {
            // SAFETY: zeroed sigaction is a valid "default" value to fill in.
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            unsafe { libc::sigemptyset(&mut action.sa_mask) };

            let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
            cvt(unsafe { libc::sigaction(signo, &action, &mut previous) })?;
            slots.insert(
                signo,
                Slot {
                    previous,
                    observers: Vec::new(),
                },
            );
            tracing::debug!(signo, "signal handler installed");
        }

        if let Some(slot) = slots.get_mut(&signo) {
            slot.observers.push((id, core));
        }
        Ok(id)
    }

    fn forget(&self, signo: i32, id: u64) {
        let mut slots = self.slots.lock();
        let emptied = match slots.get_mut(&signo) {
            Some(slot) => {
                slot.observers.retain(|(observer, _)| *observer != id);
                slot.observers.is_empty()
            }
            None => false,
        };
        if emptied {
            if let Some(slot) = slots.remove(&signo) {
                unsafe { libc::sigaction(signo, &slot.previous, std::ptr::null_mut()) };
                tracing::debug!(signo, "signal handler restored");
            }
        }
    }

    fn notify(&self, counts: &HashMap<i32, u64>) {
        let targets: Vec<(Arc<SourceCore>, u64)> = {
            let slots = self.slots.lock();
            counts
                .iter()
                .filter_map(|(signo, count)| slots.get(signo).map(|slot| (slot, *count)))
                .flat_map(|(slot, count)| {
                    slot.observers
                        .iter()
                        .filter_map(move |(_, core)| core.upgrade().map(|core| (core, count)))
                })
                .collect()
        };
        for (core, count) in targets {
            core.merge_data(count);
        }
    }
}

// Reactor callback: counts the signal numbers written to the pipe.
fn drain(fd: RawFd) {
    let mut counts: HashMap<i32, u64> = HashMap::new();
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
        for signo in &buf[..n as usize] {
            *counts.entry(i32::from(*signo)).or_default() += 1;
        }
    }
    if counts.is_empty() {
        return;
    }
    if let Ok(hub) = hub() {
        hub.notify(&counts);
    }
}

struct SignalBackend {
    signo: i32,
    id: u64,
}

impl Backend for SignalBackend {
    fn deactivate(&self) {
        if let Ok(hub) = hub() {
            hub.forget(self.signo, self.id);
        }
    }
}

/// Observes deliveries of a signal. Its data is the number of signals
/// received since the last delivery.
///
/// Observing a signal replaces its disposition for the whole process while
/// any observer of it exists.
#[derive(Clone)]
pub struct SignalObserver {
    source: EventSource,
    signo: i32,
}

impl SignalObserver {
    /// Observes signal `signo`, delivering to `queue`.
    ///
    /// # Errors
    /// Fails for signals that cannot be caught, such as `SIGKILL`.
    pub fn new(signo: i32, queue: &Queue) -> Result<Self> {
        let core = SourceCore::new("signal", queue, Merge::Add);
        let id = hub()?.observe(signo, Arc::downgrade(&core))?;
        core.set_backend(Box::new(SignalBackend { signo, id }));

        Ok(Self {
            source: EventSource::new(core),
            signo,
        })
    }

    pub fn signal(&self) -> i32 {
        self.signo
    }

    /// Signals received during the current delivery.
    pub fn count(&self) -> u64 {
        self.source.data()
    }
}

impl Deref for SignalObserver {
    type Target = EventSource;

    fn deref(&self) -> &EventSource {
        &self.source
    }
}
