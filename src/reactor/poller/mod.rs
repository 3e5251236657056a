//! OS readiness backends.
//!
//! Every backend exposes the same `Poller` API:
//!
//! - `add` / `remove` / `rearm` a registration identified by a token
//! - `wait` for events, filling `PollEvent`s
//!
//! Linux uses epoll, with inotify for file-system events and pidfds for
//! process exit. macOS and iOS use kqueue.

use crate::source::{FileEvents, ProcessEvents};

use std::os::unix::io::RawFd;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) use kqueue::Poller;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
mod unsupported;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
pub(crate) use unsupported::Poller;

/// What a file-system registration watches.
#[derive(Clone, Debug)]
pub(crate) enum VnodeTarget {
    Fd(RawFd),
    Path(PathBuf),
}

/// Kind of readiness a registration waits for.
#[derive(Clone, Debug)]
pub(crate) enum Interest {
    /// Data available to read. A oneshot registration must be rearmed after
    /// each event.
    Readable { fd: RawFd, oneshot: bool },
    /// Urgent/priority condition, as raised by pressure stall triggers.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    Priority { fd: RawFd },
    Vnode {
        target: VnodeTarget,
        events: FileEvents,
    },
    Process { pid: i32, events: ProcessEvents },
}

/// A delivered event. `data` depends on the interest: event bits for vnode
/// and process registrations, a byte count estimate (at least 1) otherwise.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PollEvent {
    pub(crate) token: u64,
    pub(crate) data: u64,
}
