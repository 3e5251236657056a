//! Fallback for platforms without a readiness backend.

use crate::reactor::poller::{Interest, PollEvent};

use std::io;
use std::time::Duration;

pub(crate) struct Poller;

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "event sources are not supported on this platform",
    )
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Err(unsupported())
    }

    pub(crate) fn add(&self, _token: u64, _interest: &Interest) -> io::Result<()> {
        Err(unsupported())
    }

    pub(crate) fn remove(&self, _token: u64, _interest: &Interest) {}

    pub(crate) fn rearm(&self, _token: u64, _interest: &Interest) -> io::Result<()> {
        Err(unsupported())
    }

    pub(crate) fn wait(&self, _events: &mut Vec<PollEvent>, _timeout: Option<Duration>) -> io::Result<()> {
        Err(unsupported())
    }
}
