//! Owned descriptor shared by one or more channels.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

// Poll slice while waiting for a stream descriptor, so that an immediate
// close is noticed by blocked operations.
const READY_POLL_MS: libc::c_int = 50;

pub(crate) struct FileHandle {
    fd: OwnedFd,
}

impl FileHandle {
    pub(crate) fn open(path: &Path, flags: i32, mode: u32) -> io::Result<Self> {
        let fd = open_fd(path, flags, mode)?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
        retry(|| unsafe {
            libc::pread(
                self.raw(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                offset as libc::off_t,
            )
        })
    }

    pub(crate) fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<usize> {
        retry(|| unsafe { libc::pwrite(self.raw(), buffer.as_ptr().cast(), buffer.len(), offset as libc::off_t) })
    }

    /// Reads once data is available, giving up when `cancelled` is set.
    pub(crate) fn read(&self, buffer: &mut [u8], cancelled: &AtomicBool) -> io::Result<usize> {
        loop {
            self.wait_ready(libc::POLLIN, cancelled)?;
            match retry(|| unsafe { libc::read(self.raw(), buffer.as_mut_ptr().cast(), buffer.len()) }) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    /// Writes once the descriptor accepts data, giving up when `cancelled` is set.
    pub(crate) fn write(&self, buffer: &[u8], cancelled: &AtomicBool) -> io::Result<usize> {
        loop {
            self.wait_ready(libc::POLLOUT, cancelled)?;
            match retry(|| unsafe { libc::write(self.raw(), buffer.as_ptr().cast(), buffer.len()) }) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    fn wait_ready(&self, events: libc::c_short, cancelled: &AtomicBool) -> io::Result<()> {
        let mut poll_fd = libc::pollfd {
            fd: self.raw(),
            events,
            revents: 0,
        };
        loop {
            if cancelled.load(Ordering::Acquire) {
                return Err(io::Error::from_raw_os_error(libc::ECANCELED));
            }
            let ready = unsafe { libc::poll(&mut poll_fd, 1, READY_POLL_MS) };
            if ready > 0 {
                return Ok(());
            }
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

fn retry(mut call: impl FnMut() -> isize) -> io::Result<usize> {
    loop {
        let ret = call();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn open_fd(path: &Path, flags: i32, mode: u32) -> io::Result<RawFd> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;

    let file_descriptor = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
    if file_descriptor < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(file_descriptor)
}
