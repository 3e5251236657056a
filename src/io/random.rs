use crate::error::ChannelError;
use crate::io::channel::{ChannelCore, Delivery, IoChannel};
use crate::io::handle::FileHandle;
use crate::io::ReadLength;
use crate::queue::Queue;

use bytes::Bytes;
use std::ops::Deref;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::Arc;

/// A channel reading and writing at explicit offsets.
#[derive(Clone)]
pub struct RandomAccessChannel {
    channel: IoChannel,
}

impl RandomAccessChannel {
    /// Opens `path` with `open(2)` flags and creation mode. A failure is
    /// reported to `cleanup`, which otherwise runs once the channel is closed.
    pub fn open<F>(path: impl AsRef<Path>, flags: i32, mode: u32, queue: &Queue, cleanup: F) -> Self
    where
        F: FnOnce(Option<ChannelError>) + Send + 'static,
    {
        let handle = FileHandle::open(path.as_ref(), flags, mode)
            .map(Arc::new)
            .map_err(ChannelError::from);
        Self::with_core(ChannelCore::new("random", handle, queue, Box::new(cleanup)))
    }

    /// Takes ownership of `fd`.
    pub fn from_fd<F>(fd: impl Into<OwnedFd>, queue: &Queue, cleanup: F) -> Self
    where
        F: FnOnce(Option<ChannelError>) + Send + 'static,
    {
        let handle = Arc::new(FileHandle::from_fd(fd.into()));
        Self::with_core(ChannelCore::new("random", Ok(handle), queue, Box::new(cleanup)))
    }

    /// A new channel on the descriptor of `other`. The descriptor is released
    /// once both channels are closed.
    pub fn from_channel<F>(other: &IoChannel, queue: &Queue, cleanup: F) -> Self
    where
        F: FnOnce(Option<ChannelError>) + Send + 'static,
    {
        let handle = other.core.handle().ok_or(ChannelError::Closed);
        Self::with_core(ChannelCore::new("random", handle, queue, Box::new(cleanup)))
    }

    fn with_core(core: Arc<ChannelCore>) -> Self {
        Self {
            channel: IoChannel { core },
        }
    }

    /// Reads `length` bytes starting at `offset`.
    pub fn read_at<F>(&self, offset: u64, length: ReadLength, queue: &Queue, handler: F)
    where
        F: FnMut(bool, Bytes, Option<ChannelError>) + Send + 'static,
    {
        let delivery = Delivery::new(queue, Box::new(handler));
        self.channel.core.submit(delivery, move |core, handle, delivery| {
            let mut position = offset;
            core.read_with(length, delivery, |buffer| {
                let read = handle.read_at(buffer, position)?;
                position += read as u64;
                Ok(read)
            });
        });
    }

    /// Writes `data` starting at `offset`.
    pub fn write_at<F>(&self, data: impl Into<Bytes>, offset: u64, queue: &Queue, handler: F)
    where
        F: FnMut(bool, Bytes, Option<ChannelError>) + Send + 'static,
    {
        let data = data.into();
        let delivery = Delivery::new(queue, Box::new(handler));
        self.channel.core.submit(delivery, move |core, handle, delivery| {
            let mut position = offset;
            core.write_with(data, delivery, |buffer| {
                let written = handle.write_at(buffer, position)?;
                position += written as u64;
                Ok(written)
            });
        });
    }
}

impl Deref for RandomAccessChannel {
    type Target = IoChannel;

    fn deref(&self) -> &IoChannel {
        &self.channel
    }
}
