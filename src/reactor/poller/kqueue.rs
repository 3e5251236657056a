//! kqueue backend: readiness, vnode and process filters.

use crate::reactor::cvt;
use crate::reactor::poller::{Interest, PollEvent, VnodeTarget};
use crate::source::{FileEvents, ProcessEvents};

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_DISPATCH, EV_ENABLE, EVFILT_PROC, EVFILT_READ, EVFILT_VNODE,
    kevent, kqueue,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::time::Duration;

const MAX_EVENTS: usize = 64;

pub(crate) struct Poller {
    kqueue: OwnedFd,
    // Descriptors opened (or duplicated) for vnode registrations. Closing one
    // removes its filter from the kqueue.
    vnode_fds: Mutex<HashMap<u64, OwnedFd>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let kqueue = unsafe { OwnedFd::from_raw_fd(cvt(kqueue())?) };
        Ok(Poller {
            kqueue,
            vnode_fds: Mutex::new(HashMap::new()),
        })
    }

    fn change(&self, ident: usize, filter: i16, flags: u16, fflags: u32, token: u64) -> io::Result<()> {
        // SAFETY: kevent is plain data; zero is valid for every field.
        let mut event: kevent = unsafe { std::mem::zeroed() };
        event.ident = ident;
        event.filter = filter;
        event.flags = flags;
        event.fflags = fflags;
        event.udata = token as usize as *mut libc::c_void;

        cvt(unsafe { kevent(self.kqueue.as_raw_fd(), &event, 1, ptr::null_mut(), 0, ptr::null()) })?;
        Ok(())
    }

    pub(crate) fn add(&self, token: u64, interest: &Interest) -> io::Result<()> {
        match interest {
            Interest::Readable { fd, oneshot } => {
                let mut flags = EV_ADD | EV_ENABLE;
                if *oneshot {
                    flags |= EV_DISPATCH;
                }
                self.change(*fd as usize, EVFILT_READ, flags, 0, token)
            }
            Interest::Priority { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "priority events are not available with kqueue",
            )),
            Interest::Vnode { target, events } => {
                let fd = match target {
                    VnodeTarget::Fd(fd) => cvt(unsafe { libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, 0) })?,
                    VnodeTarget::Path(path) => {
                        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte")
                        })?;
                        cvt(unsafe { libc::open(path.as_ptr(), libc::O_EVTONLY | libc::O_CLOEXEC) })?
                    }
                };
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                self.change(
                    fd.as_raw_fd() as usize,
                    EVFILT_VNODE,
                    EV_ADD | EV_ENABLE | EV_CLEAR,
                    vnode_notes(*events),
                    token,
                )?;
                self.vnode_fds.lock().insert(token, fd);
                Ok(())
            }
            Interest::Process { pid, events } => self.change(
                *pid as usize,
                EVFILT_PROC,
                EV_ADD | EV_ENABLE | EV_CLEAR,
                process_notes(*events),
                token,
            ),
        }
    }

    pub(crate) fn remove(&self, token: u64, interest: &Interest) {
        // Failures are expected for descriptors already closed and processes
        // already reaped.
        match interest {
            Interest::Readable { fd, .. } => {
                let _ = self.change(*fd as usize, EVFILT_READ, EV_DELETE, 0, token);
            }
            Interest::Priority { .. } => {}
            Interest::Vnode { .. } => {
                self.vnode_fds.lock().remove(&token);
            }
            Interest::Process { pid, .. } => {
                let _ = self.change(*pid as usize, EVFILT_PROC, EV_DELETE, 0, token);
            }
        }
    }

    pub(crate) fn rearm(&self, token: u64, interest: &Interest) -> io::Result<()> {
        match interest {
            Interest::Readable { fd, oneshot: true } => {
                self.change(*fd as usize, EVFILT_READ, EV_ENABLE | EV_DISPATCH, 0, token)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        // SAFETY: kevent is plain data; zero is valid for every field.
        let mut raw: [kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let timespec = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                raw.as_mut_ptr(),
                MAX_EVENTS as i32,
                timespec_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in raw.iter().take(n as usize) {
            let token = event.udata as usize as u64;
            let data = match event.filter {
                EVFILT_VNODE => file_events(event.fflags).bits(),
                EVFILT_PROC => process_events(event.fflags).bits(),
                _ => (event.data.max(1)) as u64,
            };
            events.push(PollEvent { token, data });
        }
        Ok(())
    }
}

const VNODE_NOTES: [(FileEvents, u32); 7] = [
    (FileEvents::DELETE, libc::NOTE_DELETE),
    (FileEvents::WRITE, libc::NOTE_WRITE),
    (FileEvents::EXTEND, libc::NOTE_EXTEND),
    (FileEvents::ATTRIB, libc::NOTE_ATTRIB),
    (FileEvents::LINK, libc::NOTE_LINK),
    (FileEvents::RENAME, libc::NOTE_RENAME),
    (FileEvents::REVOKE, libc::NOTE_REVOKE),
];

const PROCESS_NOTES: [(ProcessEvents, u32); 4] = [
    (ProcessEvents::EXIT, libc::NOTE_EXIT),
    (ProcessEvents::FORK, libc::NOTE_FORK),
    (ProcessEvents::EXEC, libc::NOTE_EXEC),
    (ProcessEvents::SIGNAL, libc::NOTE_SIGNAL),
];

fn vnode_notes(events: FileEvents) -> u32 {
    VNODE_NOTES
        .iter()
        .filter(|(event, _)| events.contains(*event))
        .fold(0, |notes, (_, note)| notes | note)
}

fn file_events(notes: u32) -> FileEvents {
    VNODE_NOTES
        .iter()
        .filter(|(_, note)| notes & note != 0)
        .fold(FileEvents::empty(), |events, (event, _)| events | *event)
}

fn process_notes(events: ProcessEvents) -> u32 {
    PROCESS_NOTES
        .iter()
        .filter(|(event, _)| events.contains(*event))
        .fold(0, |notes, (_, note)| notes | note)
}

fn process_events(notes: u32) -> ProcessEvents {
    PROCESS_NOTES
        .iter()
        .filter(|(_, note)| notes & note != 0)
        .fold(ProcessEvents::empty(), |events, (event, _)| events | *event)
}
