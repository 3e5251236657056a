//! Error types shared by the dispatch runtime.
//!
//! Construction and configuration failures are returned as [`DispatchError`].
//! Errors produced by asynchronous channel operations are delivered to the
//! operation's handler as [`ChannelError`], which is cheap to clone so that a
//! single failure can reach every pending handler.

use std::io;
use std::sync::Arc;

/// Errors returned when creating or configuring dispatch objects.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("os error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} cannot have a target queue")]
    InvalidTarget(&'static str),

    #[error("setting this target queue would create a target cycle")]
    TargetCycle,

    #[error("the dispatch runtime is already running; configure it before first use")]
    AlreadyConfigured,

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error delivered to I/O channel handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("os error: {0}")]
    Os(Arc<io::Error>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("channel is closed")]
    Closed,

    #[error("chunk length must be greater than zero")]
    InvalidChunkLength,
}

impl ChannelError {
    /// Returns the raw OS error code, if the error came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os(err) => err.raw_os_error(),
            Self::Cancelled => Some(libc::ECANCELED),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        Self::Os(Arc::new(err))
    }
}
