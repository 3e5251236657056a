//! epoll backend: readiness, inotify file-system events and pidfd process exit.

use crate::reactor::cvt;
use crate::reactor::poller::{Interest, PollEvent, VnodeTarget};
use crate::source::{FileEvents, ProcessEvents};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

const INOTIFY_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 64;
const INOTIFY_HEADER: usize = std::mem::size_of::<libc::inotify_event>();

#[repr(align(8))]
struct InotifyBuffer([u8; 4096]);

struct Watch {
    token: u64,
    events: FileEvents,
    // Set for registrations made through a descriptor.
    fd: Option<RawFd>,
}

#[derive(Default)]
struct Watches {
    // Several registrations may share one watch descriptor; each keeps its
    // own event mask.
    by_wd: HashMap<i32, Vec<Watch>>,
    by_token: HashMap<u64, i32>,
}

pub(crate) struct Poller {
    epoll_fd: OwnedFd,
    inotify_fd: OwnedFd,
    watches: Mutex<Watches>,
    pidfds: Mutex<HashMap<u64, OwnedFd>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        let inotify_fd = unsafe {
            OwnedFd::from_raw_fd(cvt(libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC))?)
        };

        let poller = Self {
            epoll_fd,
            inotify_fd,
            watches: Mutex::new(Watches::default()),
            pidfds: Mutex::new(HashMap::new()),
        };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.inotify_fd.as_raw_fd(),
            libc::EPOLLIN as u32,
            INOTIFY_TOKEN,
        )?;

        Ok(poller)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    fn ctl_del(&self, fd: RawFd) {
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // The descriptor may already be closed.
            if !matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                tracing::debug!("epoll deregistration failed: {}", err);
            }
        }
    }

    pub(crate) fn add(&self, token: u64, interest: &Interest) -> io::Result<()> {
        match interest {
            Interest::Readable { fd, oneshot } => {
                let mut events = libc::EPOLLIN as u32;
                if *oneshot {
                    events |= libc::EPOLLONESHOT as u32;
                }
                self.ctl(libc::EPOLL_CTL_ADD, *fd, events, token)
            }
            Interest::Priority { fd } => self.ctl(
                libc::EPOLL_CTL_ADD,
                *fd,
                (libc::EPOLLPRI | libc::EPOLLET) as u32,
                token,
            ),
            Interest::Vnode { target, events } => self.add_watch(token, target, *events),
            Interest::Process { pid, events } => {
                if !events.contains(ProcessEvents::EXIT) {
                    tracing::warn!(pid, ?events, "only process exit can be observed on this platform");
                    return Ok(());
                }
                let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, *pid, 0) };
                let pidfd = unsafe { OwnedFd::from_raw_fd(cvt(pidfd as i32)?) };
                self.ctl(
                    libc::EPOLL_CTL_ADD,
                    pidfd.as_raw_fd(),
                    (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
                    token,
                )?;
                self.pidfds.lock().insert(token, pidfd);
                Ok(())
            }
        }
    }

    fn add_watch(&self, token: u64, target: &VnodeTarget, events: FileEvents) -> io::Result<()> {
        let (path, fd) = match target {
            VnodeTarget::Fd(fd) => (std::fs::read_link(format!("/proc/self/fd/{}", fd))?, Some(*fd)),
            VnodeTarget::Path(path) => (path.clone(), None),
        };
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))?;

        let mut mask = inotify_mask(events) | libc::IN_MASK_ADD;
        if fd.is_some() && events.contains(FileEvents::DELETE) {
            // IN_DELETE_SELF waits for the last descriptor, which the
            // registration itself holds. Unlinking shows up as a link-count
            // change instead.
            mask |= libc::IN_ATTRIB;
        }
        let wd = cvt(unsafe { libc::inotify_add_watch(self.inotify_fd.as_raw_fd(), path.as_ptr(), mask) })?;

        let mut watches = self.watches.lock();
        watches.by_wd.entry(wd).or_default().push(Watch { token, events, fd });
        watches.by_token.insert(token, wd);
        Ok(())
    }

    pub(crate) fn remove(&self, token: u64, interest: &Interest) {
        match interest {
            Interest::Readable { fd, .. } | Interest::Priority { fd } => self.ctl_del(*fd),
            Interest::Vnode { .. } => {
                let mut watches = self.watches.lock();
                let Some(wd) = watches.by_token.remove(&token) else {
                    return;
                };
                let emptied = match watches.by_wd.get_mut(&wd) {
                    Some(list) => {
                        let before = list.len();
                        list.retain(|watch| watch.token != token);
                        list.len() < before && list.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    watches.by_wd.remove(&wd);
                    unsafe { libc::inotify_rm_watch(self.inotify_fd.as_raw_fd(), wd) };
                }
            }
            Interest::Process { .. } => {
                if let Some(pidfd) = self.pidfds.lock().remove(&token) {
                    self.ctl_del(pidfd.as_raw_fd());
                }
            }
        }
    }

    pub(crate) fn rearm(&self, token: u64, interest: &Interest) -> io::Result<()> {
        match interest {
            Interest::Readable { fd, oneshot: true } => self.ctl(
                libc::EPOLL_CTL_MOD,
                *fd,
                (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
                token,
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd.as_raw_fd(), raw.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in raw.iter().take(n as usize) {
            let token = event.u64;
            match token {
                INOTIFY_TOKEN => self.drain_inotify(events),
                _ => {
                    let data = if self.pidfds.lock().contains_key(&token) {
                        ProcessEvents::EXIT.bits()
                    } else {
                        1
                    };
                    events.push(PollEvent { token, data });
                }
            }
        }
        Ok(())
    }

    fn drain_inotify(&self, events: &mut Vec<PollEvent>) {
        let mut buffer = InotifyBuffer([0; 4096]);

        loop {
            let n = unsafe {
                libc::read(
                    self.inotify_fd.as_raw_fd(),
                    buffer.0.as_mut_ptr().cast(),
                    buffer.0.len(),
                )
            };
            if n <= 0 {
                break;
            }

            let n = n as usize;
            let mut offset = 0;
            while offset + INOTIFY_HEADER <= n {
                // SAFETY: the kernel writes whole events; the header fits.
                let event: libc::inotify_event =
                    unsafe { ptr::read_unaligned(buffer.0.as_ptr().add(offset).cast()) };
                offset += INOTIFY_HEADER + event.len as usize;
                self.deliver_inotify(event.wd, event.mask, events);
            }
        }
    }

    fn deliver_inotify(&self, wd: i32, mask: u32, events: &mut Vec<PollEvent>) {
        let observed = file_events(mask);
        let mut watches = self.watches.lock();

        if let Some(list) = watches.by_wd.get(&wd) {
            for watch in list {
                let mut observed = observed;
                if mask & libc::IN_ATTRIB != 0 && watch.fd.is_some_and(is_unlinked) {
                    observed |= FileEvents::DELETE;
                }
                let hit = observed & watch.events;
                if !hit.is_empty() {
                    events.push(PollEvent {
                        token: watch.token,
                        data: hit.bits(),
                    });
                }
            }
        }
        if mask & libc::IN_IGNORED != 0 {
            // The kernel dropped the watch; the wd may be reused.
            watches.by_wd.remove(&wd);
        }
    }
}

// Checks if the file behind `fd` lost its last link.
fn is_unlinked(fd: RawFd) -> bool {
    // SAFETY: stat is plain data; zero is valid for every field.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut stat) };
    ret == 0 && stat.st_nlink == 0
}

fn inotify_mask(events: FileEvents) -> u32 {
    let mut mask = 0;
    if events.contains(FileEvents::DELETE) {
        mask |= libc::IN_DELETE_SELF;
    }
    if events.contains(FileEvents::WRITE) {
        mask |= libc::IN_MODIFY | libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVED_FROM | libc::IN_MOVED_TO;
    }
    if events.contains(FileEvents::EXTEND) {
        mask |= libc::IN_MODIFY;
    }
    if events.intersects(FileEvents::ATTRIB | FileEvents::LINK) {
        mask |= libc::IN_ATTRIB;
    }
    if events.contains(FileEvents::RENAME) {
        mask |= libc::IN_MOVE_SELF;
    }
    if events.contains(FileEvents::REVOKE) {
        mask |= libc::IN_UNMOUNT;
    }
    mask
}

// inotify has no separate extend or link-count events: a modification
// reports both WRITE and EXTEND, an attribute change both ATTRIB and LINK.
fn file_events(mask: u32) -> FileEvents {
    let mut events = FileEvents::empty();
    if mask & libc::IN_DELETE_SELF != 0 {
        events |= FileEvents::DELETE;
    }
    if mask & libc::IN_MODIFY != 0 {
        events |= FileEvents::WRITE | FileEvents::EXTEND;
    }
    if mask & (libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVED_FROM | libc::IN_MOVED_TO) != 0 {
        events |= FileEvents::WRITE;
    }
    if mask & libc::IN_ATTRIB != 0 {
        events |= FileEvents::ATTRIB | FileEvents::LINK;
    }
    if mask & libc::IN_MOVE_SELF != 0 {
        events |= FileEvents::RENAME;
    }
    if mask & libc::IN_UNMOUNT != 0 {
        events |= FileEvents::REVOKE;
    }
    events
}
