//! Asynchronous file and stream channels.
//!
//! # Purpose
//!
//! A channel owns a descriptor and runs read and write operations on it in
//! the background. Each operation reports to a handler on a queue of the
//! caller's choice as `(done, data, error)`:
//!
//! - reads hand over the bytes read so far, in one or more partial deliveries
//!   bounded by the water marks, followed by a final one with `done` set;
//! - writes report the bytes still to be written, empty once complete.
//!
//! Errors never panic: they arrive as the handler's [`ChannelError`]. A
//! channel that failed to open reports the failure to its cleanup handler.
//!
//! [`RandomAccessChannel`] reads and writes at explicit offsets,
//! [`StreamChannel`] reads and writes sequentially and can copy into any
//! [`OutputStream`].
//!
//! # Example
//!
//! ```ignore
//! use dispatchq::Queue;
//! use dispatchq::io::{CloseMode, RandomAccessChannel, ReadLength};
//!
//! let queue = Queue::serial("io");
//! let channel = RandomAccessChannel::open("/tmp/data", libc::O_RDWR | libc::O_CREAT, 0o644, &queue, |err| {
//!     if let Some(err) = err {
//!         eprintln!("channel failed: {err}");
//!     }
//! });
//! channel.write_at(&b"hello"[..], 0, &queue, |_, _, _| {});
//! channel.read_at(0, ReadLength::Exact(5), &queue, |done, data, _| {
//!     if done {
//!         assert_eq!(&data[..], b"hello");
//!     }
//! });
//! channel.close(CloseMode::Drain);
//! ```

mod channel;
mod fifo;
mod handle;
mod random;
mod stream;

pub use channel::IoChannel;
pub use fifo::FifoBuffer;
pub use random::RandomAccessChannel;
pub use stream::StreamChannel;

use crate::error::ChannelError;
use crate::queue::Queue;

use bytes::Bytes;

/// Receives `(done, data, error)` for each delivery of an operation.
pub type IoHandler = Box<dyn FnMut(bool, Bytes, Option<ChannelError>) + Send>;

/// How much a read should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadLength {
    /// At most this many bytes; fewer at end of file.
    Exact(usize),
    /// Everything up to end of file.
    ToEnd,
}

/// What happens to outstanding operations when a channel is closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseMode {
    /// Outstanding operations complete first.
    #[default]
    Drain,
    /// Outstanding operations stop and report [`ChannelError::Cancelled`].
    Immediate,
}

/// A sink that [`StreamChannel::copy_to`] can write into.
pub trait OutputStream: Send + Sync {
    /// Writes `data`, reporting to `handler` on `queue` like
    /// [`StreamChannel::write`].
    fn write(&self, data: Bytes, queue: &Queue, handler: IoHandler);

    fn is_open(&self) -> bool;

    fn close(&self, mode: CloseMode);
}
