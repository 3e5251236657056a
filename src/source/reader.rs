use crate::error::Result;
use crate::queue::Queue;
use crate::reactor::Interest;
use crate::source::{EventSource, Merge, SourceCore, activate};

use std::ops::Deref;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

/// Fires when a descriptor has data to read.
///
/// The handler is expected to read from [`fd`](FileReader::fd). Each
/// delivery reports the bytes available at the time of the event; zero means
/// end of file. Readiness is re-armed after every delivery.
#[derive(Clone)]
pub struct FileReader {
    source: EventSource,
    fd: RawFd,
}

impl FileReader {
    /// Watches `fd` for readability. The descriptor stays open until the
    /// reader is cancelled or dropped.
    pub fn new(fd: impl Into<OwnedFd>, queue: &Queue) -> Result<Self> {
        let fd: OwnedFd = fd.into();
        let raw = fd.as_raw_fd();
        let core = SourceCore::new("reader", queue, Merge::Replace);
        activate(
            &core,
            Interest::Readable {
                fd: raw,
                oneshot: true,
            },
            Some(fd),
            move |_| available_bytes(raw),
        )?;

        Ok(Self {
            source: EventSource::new(core),
            fd: raw,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bytes available when the current delivery's event fired.
    pub fn available_bytes(&self) -> u64 {
        self.source.data()
    }
}

fn available_bytes(fd: RawFd) -> u64 {
    let mut available: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if ret < 0 { 0 } else { available.max(0) as u64 }
}

impl Deref for FileReader {
    type Target = EventSource;

    fn deref(&self) -> &EventSource {
        &self.source
    }
}
