//! Observation of a path rather than a single file.
//!
//! A [`FileObserver`] follows the file it was opened on, even after a rename.
//! A [`PathObserver`] follows whatever the path names: it watches every
//! existing segment from the root down to the target and rebuilds the chain
//! when a segment is deleted, renamed or replaced, or when a missing segment
//! appears.

use crate::error::{DispatchError, Result};
use crate::queue::Queue;
use crate::source::{FileEvents, FileObserver, SourceCore};

use parking_lot::Mutex;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

// Events that make a segment stop naming the same file.
const DETACH: FileEvents = FileEvents::DELETE.union(FileEvents::RENAME).union(FileEvents::REVOKE);

type PathHandler = Box<dyn FnMut(FileEvents) + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
struct Identity {
    dev: u64,
    ino: u64,
}

struct Segment {
    identity: Identity,
    observer: FileObserver,
}

struct State {
    segments: Vec<Segment>,
    enabled: bool,
    disposed: bool,
}

struct Inner {
    path: PathBuf,
    mask: FileEvents,
    queue: Queue,
    handler: Mutex<PathHandler>,
    state: Mutex<State>,
}

/// Observes a path, following it across renames and recreation of any of its
/// segments.
///
/// The handler runs on the observer's queue with the events that occurred,
/// limited to the mask. Events of the target file are reported as they
/// happen; a change of the file the path resolves to is reported with the
/// event of the segment that caused it.
#[derive(Clone)]
pub struct PathObserver {
    inner: Arc<Inner>,
}

impl PathObserver {
    /// Starts observing `path`. The observer is created disabled.
    ///
    /// # Errors
    /// Fails with [`DispatchError::InvalidPath`] for a relative path and with
    /// the OS error if the root cannot be watched.
    pub fn new<F>(path: impl AsRef<Path>, mask: FileEvents, queue: &Queue, handler: F) -> Result<Self>
    where
        F: FnMut(FileEvents) + Send + 'static,
    {
        let path = path.as_ref().to_path_buf();
        if !path.is_absolute() {
            return Err(DispatchError::InvalidPath(path.display().to_string()));
        }

        let inner = Arc::new(Inner {
            path,
            mask,
            queue: queue.clone(),
            handler: Mutex::new(Box::new(handler)),
            state: Mutex::new(State {
                segments: Vec::new(),
                enabled: false,
                disposed: false,
            }),
        });

        let segments = Inner::watch_chain(&inner)?;
        if segments.is_empty() {
            return Err(DispatchError::InvalidPath(inner.path.display().to_string()));
        }
        inner.state.lock().segments = segments;
        tracing::debug!(path = %inner.path.display(), "path observer created");

        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn mask(&self) -> FileEvents {
        self.inner.mask
    }

    /// Number of segments currently watched, the root included.
    pub fn watched_segments(&self) -> usize {
        self.inner.state.lock().segments.len()
    }

    /// Whether the full path currently exists.
    pub fn target_exists(&self) -> bool {
        let state = self.inner.state.lock();
        state.segments.len() == self.inner.path.components().count()
    }

    pub fn enable(&self) {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return;
        }
        state.enabled = true;
        for segment in &state.segments {
            segment.observer.enable();
        }
    }

    pub fn disable(&self) {
        let mut state = self.inner.state.lock();
        state.enabled = false;
        for segment in &state.segments {
            segment.observer.disable();
        }
    }

    /// Stops observing for good. Later calls do nothing.
    pub fn dispose(&self) {
        let segments = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.segments)
        };
        for segment in &segments {
            segment.observer.cancel();
        }
        tracing::debug!(path = %self.inner.path.display(), "path observer disposed");
    }
}

impl Inner {
    /// Watches every existing segment, stopping at the first missing one.
    fn watch_chain(this: &Arc<Self>) -> Result<Vec<Segment>> {
        let chain: Vec<&Path> = {
            let mut chain: Vec<&Path> = this.path.ancestors().collect();
            chain.reverse();
            chain
        };
        let depth = chain.len();
        let mut segments = Vec::with_capacity(depth);

        for (index, segment_path) in chain.into_iter().enumerate() {
            let Ok(metadata) = segment_path.metadata() else {
                break;
            };
            let is_target = index + 1 == depth;
            let mut mask = DETACH;
            if is_target {
                mask |= this.mask;
            }
            if metadata.is_dir() && !is_target {
                mask |= FileEvents::WRITE;
            }

            let observer = match FileObserver::open(segment_path, mask, &this.queue) {
                Ok(observer) => observer,
                Err(err) if index == 0 => return Err(err),
                Err(err) => {
                    tracing::debug!(path = %segment_path.display(), "segment not watchable: {}", err);
                    break;
                }
            };

            let weak: Weak<Inner> = Arc::downgrade(this);
            let core: Weak<SourceCore> = Arc::downgrade(&observer.core);
            observer.set_event_handler(move || {
                if let (Some(inner), Some(core)) = (weak.upgrade(), core.upgrade()) {
                    inner.segment_changed(index, is_target, FileEvents::from_bits_truncate(core.data()));
                }
            });

            segments.push(Segment {
                identity: Identity {
                    dev: metadata.dev(),
                    ino: metadata.ino(),
                },
                observer,
            });
        }
        Ok(segments)
    }

    fn segment_changed(self: &Arc<Self>, index: usize, is_target: bool, events: FileEvents) {
        if is_target {
            let reported = events & self.mask;
            if !reported.is_empty() {
                self.notify(reported);
            }
        }

        let detached = events.intersects(DETACH);
        if !detached && !self.chain_changed(index) {
            return;
        }
        if self.rebuild() && !is_target {
            let reported = events & self.mask;
            if !reported.is_empty() {
                self.notify(reported);
            }
        }
    }

    // A directory write only matters if the segments below it changed.
    fn chain_changed(&self, from: usize) -> bool {
        let state = self.state.lock();
        let chain: Vec<&Path> = {
            let mut chain: Vec<&Path> = self.path.ancestors().collect();
            chain.reverse();
            chain
        };
        let current: Vec<Identity> = chain
            .iter()
            .map_while(|segment| {
                segment.metadata().ok().map(|metadata| Identity {
                    dev: metadata.dev(),
                    ino: metadata.ino(),
                })
            })
            .collect();
        let watched: Vec<Identity> = state.segments.iter().map(|segment| segment.identity).collect();
        current.len() != watched.len() || current[from.min(current.len())..] != watched[from.min(watched.len())..]
    }

    /// Replaces the watched chain. Returns whether the watched files changed.
    fn rebuild(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.disposed {
            return false;
        }

        let segments = match Self::watch_chain(self) {
            Ok(segments) => segments,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "path observer lost its root: {}", err);
                Vec::new()
            }
        };
        let before: Vec<Identity> = state.segments.iter().map(|segment| segment.identity).collect();
        let after: Vec<Identity> = segments.iter().map(|segment| segment.identity).collect();

        for segment in &segments {
            if state.enabled {
                segment.observer.enable();
            }
        }
        let previous = std::mem::replace(&mut state.segments, segments);
        drop(state);

        for segment in &previous {
            segment.observer.cancel();
        }
        tracing::trace!(path = %self.path.display(), watched = after.len(), "path observer rebuilt");
        before != after
    }

    fn notify(&self, events: FileEvents) {
        let mut handler = self.handler.lock();
        (*handler)(events);
    }
}
