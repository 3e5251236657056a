use crate::error::Result;
use crate::queue::Queue;
use crate::source::{EventSource, MemoryPressure, Merge, SourceCore};

use std::ops::Deref;

/// Observes system memory pressure.
///
/// On Linux the observer arms pressure stall triggers on
/// `/proc/pressure/memory`: [`MemoryPressure::WARN`] fires when tasks stall on
/// memory for 10% of a two-second window, [`MemoryPressure::CRITICAL`] when
/// all tasks stall for 5% of it. The kernel does not report a return to
/// normal, so [`MemoryPressure::NORMAL`] is never delivered there.
#[derive(Clone)]
pub struct MemoryPressureObserver {
    source: EventSource,
    mask: MemoryPressure,
}

impl MemoryPressureObserver {
    /// Observes the levels in `mask`.
    ///
    /// # Errors
    /// Fails where pressure information is unavailable, including kernels
    /// without PSI support and platforms other than Linux.
    pub fn new(mask: MemoryPressure, queue: &Queue) -> Result<Self> {
        let core = SourceCore::new("memory", queue, Merge::Or);
        platform::activate(&core, mask)?;

        Ok(Self {
            source: EventSource::new(core),
            mask,
        })
    }

    pub fn mask(&self) -> MemoryPressure {
        self.mask
    }

    /// Levels observed by the current delivery.
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_bits_truncate(self.source.data())
    }
}

impl Deref for MemoryPressureObserver {
    type Target = EventSource;

    fn deref(&self) -> &EventSource {
        &self.source
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use crate::error::Result;
    use crate::reactor::{Interest, cvt};
    use crate::source::{Backend, MemoryPressure, Registered, SourceCore};

    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::Arc;

    const PRESSURE_FILE: &[u8] = b"/proc/pressure/memory\0";

    // "<some|full> <stall us> <window us>"; unprivileged triggers need a
    // window that is a multiple of two seconds.
    const TRIGGERS: [(MemoryPressure, &[u8]); 2] = [
        (MemoryPressure::WARN, b"some 200000 2000000\0"),
        (MemoryPressure::CRITICAL, b"full 100000 2000000\0"),
    ];

    pub(super) fn activate(core: &Arc<SourceCore>, mask: MemoryPressure) -> Result<()> {
        let registered = Registered::new();
        if let Err(err) = arm(core, &registered, mask) {
            registered.deactivate();
            return Err(err);
        }
        core.set_backend(Box::new(registered));
        Ok(())
    }

    fn arm(core: &Arc<SourceCore>, registered: &Registered, mask: MemoryPressure) -> Result<()> {
        for (level, trigger) in TRIGGERS {
            if !mask.contains(level) {
                continue;
            }
            let fd = cvt(unsafe {
                libc::open(
                    PRESSURE_FILE.as_ptr().cast(),
                    libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
                )
            })?;
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let written = unsafe { libc::write(fd.as_raw_fd(), trigger.as_ptr().cast(), trigger.len()) };
            if written < 0 {
                return Err(std::io::Error::last_os_error().into());
            }

            registered.register(core, Interest::Priority { fd: fd.as_raw_fd() }, move |_| level.bits())?;
            registered.retain(fd);
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use crate::error::{DispatchError, Result};
    use crate::source::{MemoryPressure, SourceCore};

    use std::sync::Arc;

    pub(super) fn activate(_core: &Arc<SourceCore>, _mask: MemoryPressure) -> Result<()> {
        Err(DispatchError::Unsupported("memory pressure observation"))
    }
}
