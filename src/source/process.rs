use crate::error::Result;
use crate::queue::Queue;
use crate::reactor::Interest;
use crate::source::{EventSource, Merge, ProcessEvents, SourceCore, activate};

use std::ops::Deref;

/// Observes lifecycle events of another process.
///
/// On Linux only [`ProcessEvents::EXIT`] can be observed.
#[derive(Clone)]
pub struct ProcessObserver {
    source: EventSource,
    pid: i32,
    mask: ProcessEvents,
}

impl ProcessObserver {
    /// Observes process `pid` for the events in `mask`.
    ///
    /// # Errors
    /// Fails if the process does not exist.
    pub fn new(pid: i32, mask: ProcessEvents, queue: &Queue) -> Result<Self> {
        let core = SourceCore::new("process", queue, Merge::Or);
        activate(&core, Interest::Process { pid, events: mask }, None, move |data| data & mask.bits())?;

        Ok(Self {
            source: EventSource::new(core),
            pid,
            mask,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn mask(&self) -> ProcessEvents {
        self.mask
    }

    /// Events observed by the current delivery.
    pub fn events(&self) -> ProcessEvents {
        ProcessEvents::from_bits_truncate(self.source.data())
    }
}

impl Deref for ProcessObserver {
    type Target = EventSource;

    fn deref(&self) -> &EventSource {
        &self.source
    }
}
