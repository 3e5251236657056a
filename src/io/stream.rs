use crate::error::ChannelError;
use crate::io::channel::{ChannelCore, Delivery, IoChannel};
use crate::io::handle::FileHandle;
use crate::io::{CloseMode, IoHandler, OutputStream, ReadLength};
use crate::queue::Queue;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::ops::Deref;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type Progress = Box<dyn FnMut(usize) + Send>;
type Completion = Box<dyn FnOnce(usize, Option<ChannelError>) + Send>;

/// A channel reading and writing sequentially, such as a pipe, socket or
/// terminal.
#[derive(Clone)]
pub struct StreamChannel {
    channel: IoChannel,
}

impl StreamChannel {
    /// Opens `path` with `open(2)` flags and creation mode. A failure is
    /// reported to `cleanup`, which otherwise runs once the channel is closed.
    pub fn open<F>(path: impl AsRef<Path>, flags: i32, mode: u32, queue: &Queue, cleanup: F) -> Self
    where
        F: FnOnce(Option<ChannelError>) + Send + 'static,
    {
        let handle = FileHandle::open(path.as_ref(), flags, mode)
            .map(Arc::new)
            .map_err(ChannelError::from);
        Self::with_core(ChannelCore::new("stream", handle, queue, Box::new(cleanup)))
    }

    /// Takes ownership of `fd`.
    pub fn from_fd<F>(fd: impl Into<OwnedFd>, queue: &Queue, cleanup: F) -> Self
    where
        F: FnOnce(Option<ChannelError>) + Send + 'static,
    {
        let handle = Arc::new(FileHandle::from_fd(fd.into()));
        Self::with_core(ChannelCore::new("stream", Ok(handle), queue, Box::new(cleanup)))
    }

    /// A new channel on the descriptor of `other`. The descriptor is released
    /// once both channels are closed.
    pub fn from_channel<F>(other: &IoChannel, queue: &Queue, cleanup: F) -> Self
    where
        F: FnOnce(Option<ChannelError>) + Send + 'static,
    {
        let handle = other.core.handle().ok_or(ChannelError::Closed);
        Self::with_core(ChannelCore::new("stream", handle, queue, Box::new(cleanup)))
    }

    fn with_core(core: Arc<ChannelCore>) -> Self {
        Self {
            channel: IoChannel { core },
        }
    }

    pub fn read<F>(&self, length: ReadLength, queue: &Queue, handler: F)
    where
        F: FnMut(bool, Bytes, Option<ChannelError>) + Send + 'static,
    {
        self.read_boxed(length, queue, Box::new(handler));
    }

    pub fn write<F>(&self, data: impl Into<Bytes>, queue: &Queue, handler: F)
    where
        F: FnMut(bool, Bytes, Option<ChannelError>) + Send + 'static,
    {
        self.write_boxed(data.into(), queue, Box::new(handler));
    }

    fn read_boxed(&self, length: ReadLength, queue: &Queue, handler: IoHandler) {
        self.channel
            .core
            .submit(Delivery::new(queue, handler), move |core, handle, delivery| {
                core.read_with(length, delivery, |buffer| handle.read(buffer, core.cancelled()));
            });
    }

    fn write_boxed(&self, data: Bytes, queue: &Queue, handler: IoHandler) {
        self.channel
            .core
            .submit(Delivery::new(queue, handler), move |core, handle, delivery| {
                core.write_with(data, delivery, |buffer| handle.write(buffer, core.cancelled()));
            });
    }

    /// Copies `length` bytes into `target` in chunks of `chunk_len`.
    ///
    /// Each chunk is read completely and written before the next one is
    /// read. `progress` receives the total copied after every chunk and
    /// `completion` the final total together with the first error. Both run on
    /// `queue`. The copy stops early at end of file.
    pub fn copy_to<T, P, C>(
        &self,
        length: ReadLength,
        chunk_len: usize,
        target: T,
        queue: &Queue,
        progress: P,
        completion: C,
    ) where
        T: OutputStream + 'static,
        P: FnMut(usize) + Send + 'static,
        C: FnOnce(usize, Option<ChannelError>) + Send + 'static,
    {
        if chunk_len == 0 {
            queue.dispatch_async(move || completion(0, Some(ChannelError::InvalidChunkLength)));
            return;
        }

        let copy = Arc::new(CopyJob {
            source: self.clone(),
            target: Box::new(target),
            queue: queue.clone(),
            remaining: Mutex::new(match length {
                ReadLength::Exact(len) => Some(len),
                ReadLength::ToEnd => None,
            }),
            chunk_len,
            copied: AtomicUsize::new(0),
            progress: Mutex::new(Box::new(progress)),
            completion: Mutex::new(Some(Box::new(completion))),
        });
        copy.next_chunk();
    }
}

struct CopyJob {
    source: StreamChannel,
    target: Box<dyn OutputStream>,
    queue: Queue,
    remaining: Mutex<Option<usize>>,
    chunk_len: usize,
    copied: AtomicUsize,
    progress: Mutex<Progress>,
    completion: Mutex<Option<Completion>>,
}

impl CopyJob {
    fn next_chunk(self: Arc<Self>) {
        let remaining = *self.remaining.lock();
        let want = remaining.unwrap_or(usize::MAX).min(self.chunk_len);
        if want == 0 {
            let queue = self.queue.clone();
            queue.dispatch_async(move || self.finish(None));
            return;
        }

        let this = self.clone();
        let mut chunk = BytesMut::new();
        self.source.read(ReadLength::Exact(want), &self.queue, move |done, data, error| {
            chunk.extend_from_slice(&data);
            if !done {
                return;
            }
            if let Some(error) = error {
                this.finish(Some(error));
                return;
            }
            if chunk.is_empty() {
                this.finish(None);
                return;
            }
            let data = std::mem::take(&mut chunk).freeze();
            this.clone().write_chunk(data, want);
        });
    }

    fn write_chunk(self: Arc<Self>, data: Bytes, wanted: usize) {
        let len = data.len();
        let this = self.clone();
        self.target.write(
            data,
            &self.queue,
            Box::new(move |done, _, error| {
                if !done {
                    return;
                }
                if let Some(error) = error {
                    this.finish(Some(error));
                    return;
                }
                let total = this.copied.fetch_add(len, Ordering::AcqRel) + len;
                if let Some(remaining) = this.remaining.lock().as_mut() {
                    *remaining = remaining.saturating_sub(len);
                }
                {
                    let mut progress = this.progress.lock();
                    (*progress)(total);
                }
                if len < wanted {
                    this.finish(None);
                } else {
                    this.clone().next_chunk();
                }
            }),
        );
    }

    fn finish(&self, error: Option<ChannelError>) {
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            completion(self.copied.load(Ordering::Acquire), error);
        }
    }
}

impl OutputStream for StreamChannel {
    fn write(&self, data: Bytes, queue: &Queue, handler: IoHandler) {
        self.write_boxed(data, queue, handler);
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    fn close(&self, mode: CloseMode) {
        self.channel.close(mode);
    }
}

impl Deref for StreamChannel {
    type Target = IoChannel;

    fn deref(&self) -> &IoChannel {
        &self.channel
    }
}
