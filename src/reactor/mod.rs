//! Event-driven reactor feeding event sources.
//!
//! This module provides the OS event plumbing behind the
//! [`source`](crate::source) types. It includes:
//! - [`core`]: the registry and the `dispatchq-reactor` thread
//! - [`poller`]: epoll (Linux) and kqueue (macOS, iOS) backends

pub(crate) mod core;
pub(crate) mod poller;

pub(crate) use core::{Token, reactor};
pub(crate) use poller::{Interest, VnodeTarget};

use std::io;

/// Converts a `-1` return of a libc call into the current OS error.
pub(crate) fn cvt(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Address of the calling thread's `errno`.
pub(crate) fn errno_location() -> *mut i32 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        libc::__errno_location()
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        libc::__error()
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    {
        std::ptr::null_mut()
    }
}
