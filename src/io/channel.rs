use crate::error::ChannelError;
use crate::io::handle::FileHandle;
use crate::io::{CloseMode, IoHandler, ReadLength};
use crate::queue::Queue;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const CHUNK: usize = 64 * 1024;

pub(crate) type Cleanup = Box<dyn FnOnce(Option<ChannelError>) + Send>;

#[derive(Clone, Copy)]
pub(crate) struct Settings {
    low_water: usize,
    high_water: usize,
    interval: Option<Duration>,
}

impl Settings {
    fn new() -> Self {
        Self {
            low_water: usize::MAX,
            high_water: usize::MAX,
            interval: None,
        }
    }

    // Hands out partial results once enough data accumulated, or when the
    // interval elapsed since the previous delivery.
    fn drain_partials(&self, pending: &mut BytesMut, last: &mut Instant, delivery: &Delivery) {
        while !pending.is_empty() && pending.len() >= self.low_water {
            let len = pending.len().min(self.high_water);
            delivery.send(false, pending.split_to(len).freeze(), None);
            *last = Instant::now();
        }
        if let Some(interval) = self.interval {
            if !pending.is_empty() && last.elapsed() >= interval {
                delivery.send(false, pending.split().freeze(), None);
                *last = Instant::now();
            }
        }
    }
}

/// Routes the results of one operation to its handler's queue.
#[derive(Clone)]
pub(crate) struct Delivery {
    queue: Queue,
    handler: Arc<Mutex<IoHandler>>,
}

impl Delivery {
    pub(crate) fn new(queue: &Queue, handler: IoHandler) -> Self {
        Self {
            queue: queue.clone(),
            handler: Arc::new(Mutex::new(handler)),
        }
    }

    pub(crate) fn send(&self, done: bool, data: Bytes, error: Option<ChannelError>) {
        let handler = self.handler.clone();
        self.queue.dispatch_async(move || {
            let mut handler = handler.lock();
            (*handler)(done, data, error);
        });
    }
}

/// State shared by the handles of one channel.
///
/// Operations run one after another on a private serial queue; their
/// results are dispatched to the queue given with each operation.
pub(crate) struct ChannelCore {
    kind: &'static str,
    handle: Mutex<Option<Arc<FileHandle>>>,
    ops: Queue,
    settings: Mutex<Settings>,
    cancelled: AtomicBool,
    // Set by `close`; new operations are rejected from then on.
    closing: AtomicBool,
    // Set right before the cleanup handler runs.
    closed: Arc<AtomicBool>,
    cleanup: Mutex<Option<(Queue, Cleanup)>>,
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        let cleanup = self.cleanup.get_mut().take();
        let handle = self.handle.get_mut().take();
        if let Some((queue, cleanup)) = cleanup {
            tracing::debug!(kind = self.kind, "channel dropped without close");
            queue.dispatch_async(move || {
                cleanup(None);
                drop(handle);
            });
        }
    }
}

impl ChannelCore {
    pub(crate) fn new(
        kind: &'static str,
        handle: std::result::Result<Arc<FileHandle>, ChannelError>,
        queue: &Queue,
        cleanup: Cleanup,
    ) -> Arc<Self> {
        let (handle, failure) = match handle {
            Ok(handle) => (Some(handle), None),
            Err(err) => (None, Some(err)),
        };
        let core = Arc::new(Self {
            kind,
            handle: Mutex::new(handle),
            ops: Queue::serial(format!("dispatchq.io.{kind}")),
            settings: Mutex::new(Settings::new()),
            cancelled: AtomicBool::new(false),
            closing: AtomicBool::new(failure.is_some()),
            closed: Arc::new(AtomicBool::new(failure.is_some())),
            cleanup: Mutex::new(None),
        });

        match failure {
            Some(err) => {
                tracing::debug!(kind, "channel failed to open: {}", err);
                queue.dispatch_async(move || cleanup(Some(err)));
            }
            None => {
                *core.cleanup.lock() = Some((queue.clone(), cleanup));
                tracing::debug!(kind, "channel opened");
            }
        }
        core
    }

    pub(crate) fn handle(&self) -> Option<Arc<FileHandle>> {
        self.handle.lock().clone()
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.handle.lock().as_ref().map(|handle| handle.raw())
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn cancelled(&self) -> &AtomicBool {
        &self.cancelled
    }

    pub(crate) fn set_low_water(&self, low_water: usize) {
        let mut settings = self.settings.lock();
        settings.low_water = low_water;
        if settings.high_water < low_water {
            settings.high_water = low_water.max(1);
        }
    }

    pub(crate) fn set_high_water(&self, high_water: usize) {
        let mut settings = self.settings.lock();
        settings.high_water = high_water.max(1);
        if settings.low_water > settings.high_water {
            settings.low_water = settings.high_water;
        }
    }

    pub(crate) fn set_interval(&self, interval: Option<Duration>) {
        self.settings.lock().interval = interval;
    }

    /// Queues `op` behind every earlier operation of the channel.
    pub(crate) fn submit<F>(self: &Arc<Self>, delivery: Delivery, op: F)
    where
        F: FnOnce(&ChannelCore, &FileHandle, &Delivery) + Send + 'static,
    {
        if self.closing.load(Ordering::Acquire) {
            delivery.send(true, Bytes::new(), Some(ChannelError::Closed));
            return;
        }
        let core = self.clone();
        self.ops.dispatch_async(move || {
            if core.cancelled.load(Ordering::Acquire) {
                delivery.send(true, Bytes::new(), Some(ChannelError::Cancelled));
                return;
            }
            match core.handle() {
                Some(handle) => op(&core, &handle, &delivery),
                None => delivery.send(true, Bytes::new(), Some(ChannelError::Closed)),
            }
        });
    }

    pub(crate) fn barrier<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ops.dispatch_async(block);
    }

    pub(crate) fn close(self: &Arc<Self>, mode: CloseMode) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if mode == CloseMode::Immediate {
            self.cancelled.store(true, Ordering::Release);
        }
        tracing::debug!(kind = self.kind, ?mode, "channel closing");

        let core = self.clone();
        self.ops.dispatch_async(move || {
            let handle = core.handle.lock().take();
            let cleanup = core.cleanup.lock().take();
            let closed = core.closed.clone();
            if let Some((queue, cleanup)) = cleanup {
                queue.dispatch_async(move || {
                    closed.store(true, Ordering::Release);
                    cleanup(None);
                    drop(handle);
                });
            }
        });
    }

    /// Reads up to `length` bytes through `read`, delivering partial results
    /// according to the water marks and the interval.
    pub(crate) fn read_with<R>(&self, length: ReadLength, delivery: &Delivery, mut read: R)
    where
        R: FnMut(&mut [u8]) -> io::Result<usize>,
    {
        let settings = *self.settings.lock();
        let mut remaining = match length {
            ReadLength::Exact(len) => Some(len),
            ReadLength::ToEnd => None,
        };
        let mut pending = BytesMut::new();
        let mut last = Instant::now();

        while remaining != Some(0) {
            if self.cancelled.load(Ordering::Acquire) {
                delivery.send(true, pending.freeze(), Some(ChannelError::Cancelled));
                return;
            }
            let want = remaining.unwrap_or(usize::MAX).min(CHUNK).min(settings.high_water);
            let start = pending.len();
            pending.resize(start + want, 0);
            match read(&mut pending[start..]) {
                Ok(0) => {
                    pending.truncate(start);
                    break;
                }
                Ok(n) => {
                    pending.truncate(start + n);
                    if let Some(remaining) = remaining.as_mut() {
                        *remaining -= n;
                    }
                }
                Err(err) => {
                    pending.truncate(start);
                    delivery.send(true, pending.freeze(), Some(self.error(err)));
                    return;
                }
            }
            settings.drain_partials(&mut pending, &mut last, delivery);
        }
        delivery.send(true, pending.freeze(), None);
    }

    /// Writes all of `data` through `write`. Partial results carry the data
    /// still to be written.
    pub(crate) fn write_with<W>(&self, mut data: Bytes, delivery: &Delivery, mut write: W)
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        let settings = *self.settings.lock();
        let mut since_report = 0;

        while !data.is_empty() {
            if self.cancelled.load(Ordering::Acquire) {
                delivery.send(true, data, Some(ChannelError::Cancelled));
                return;
            }
            let len = data.len().min(CHUNK).min(settings.high_water);
            match write(&data[..len]) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "write returned zero bytes");
                    delivery.send(true, data, Some(err.into()));
                    return;
                }
                Ok(written) => {
                    data.advance(written);
                    since_report += written;
                    if since_report >= settings.low_water && !data.is_empty() {
                        delivery.send(false, data.clone(), None);
                        since_report = 0;
                    }
                }
                Err(err) => {
                    delivery.send(true, data, Some(self.error(err)));
                    return;
                }
            }
        }
        delivery.send(true, Bytes::new(), None);
    }

    fn error(&self, err: io::Error) -> ChannelError {
        if self.cancelled.load(Ordering::Acquire) {
            ChannelError::Cancelled
        } else {
            err.into()
        }
    }
}

/// Operations common to every channel.
///
/// Channels deref to `IoChannel`, like event sources deref to
/// [`EventSource`](crate::source::EventSource).
#[derive(Clone)]
pub struct IoChannel {
    pub(crate) core: Arc<ChannelCore>,
}

impl IoChannel {
    /// Delivers partial results once at least `low_water` bytes are ready.
    /// Raises the high-water mark if needed.
    pub fn set_low_water(&self, low_water: usize) {
        self.core.set_low_water(low_water);
    }

    /// Caps the size of each delivery. Lowers the low-water mark if needed.
    pub fn set_high_water(&self, high_water: usize) {
        self.core.set_high_water(high_water);
    }

    /// Delivers whatever accumulated once `interval` passed since the previous
    /// delivery, regardless of the low-water mark.
    pub fn set_interval(&self, interval: Option<Duration>) {
        self.core.set_interval(interval);
    }

    /// Runs `block` once every operation submitted before it has completed.
    pub fn dispatch_barrier<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.barrier(block);
    }

    /// Descriptor of the channel, until it is closed.
    pub fn fd(&self) -> Option<RawFd> {
        self.core.fd()
    }

    /// Open until the cleanup handler runs, also while a drain is pending.
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Closes the channel. Later calls do nothing.
    pub fn close(&self, mode: CloseMode) {
        self.core.close(mode);
    }
}
