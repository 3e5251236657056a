use crate::error::Result;
use crate::queue::Queue;
use crate::reactor::{Interest, VnodeTarget};
use crate::source::{EventSource, FileEvents, Merge, SourceCore, activate};

use std::ops::Deref;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Observes file-system events on one file or directory.
///
/// The observed file is identified when the observer is created; a later
/// rename keeps observing the same file. See
/// [`PathObserver`](crate::source::PathObserver) to follow a path instead.
#[derive(Clone)]
pub struct FileObserver {
    source: EventSource,
    mask: FileEvents,
    path: Option<Arc<PathBuf>>,
    fd: Option<RawFd>,
}

impl FileObserver {
    /// Observes the file at `path` for the events in `mask`.
    ///
    /// # Errors
    /// Fails if the file cannot be watched, e.g. because it does not exist.
    pub fn open(path: impl AsRef<Path>, mask: FileEvents, queue: &Queue) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let core = SourceCore::new("file", queue, Merge::Or);
        activate(
            &core,
            Interest::Vnode {
                target: VnodeTarget::Path(path.clone()),
                events: mask,
            },
            None,
            move |data| data & mask.bits(),
        )?;

        Ok(Self {
            source: EventSource::new(core),
            mask,
            path: Some(Arc::new(path)),
            fd: None,
        })
    }

    /// Observes the file behind `fd`. The descriptor stays open until the
    /// observer is cancelled or dropped.
    pub fn from_fd(fd: impl Into<OwnedFd>, mask: FileEvents, queue: &Queue) -> Result<Self> {
        let fd: OwnedFd = fd.into();
        let raw = fd.as_raw_fd();
        let core = SourceCore::new("file", queue, Merge::Or);
        activate(
            &core,
            Interest::Vnode {
                target: VnodeTarget::Fd(raw),
                events: mask,
            },
            Some(fd),
            move |data| data & mask.bits(),
        )?;

        Ok(Self {
            source: EventSource::new(core),
            mask,
            path: None,
            fd: Some(raw),
        })
    }

    /// Events observed by the current delivery.
    pub fn events(&self) -> FileEvents {
        FileEvents::from_bits_truncate(self.source.data())
    }

    pub fn mask(&self) -> FileEvents {
        self.mask
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }
}

impl Deref for FileObserver {
    type Target = EventSource;

    fn deref(&self) -> &EventSource {
        &self.source
    }
}
