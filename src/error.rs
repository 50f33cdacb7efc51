//! The error type shared by everything in the crate.
//!
//! Synchronous failures (bad `start` calls, polling the backend, …) are
//! returned directly. Asynchronous failures travel inside the per-kind
//! result objects handed to completion callbacks.

use std::io;

use thiserror::Error;

/// Anything that can go wrong inside the event loop.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error bubbled up from the OS.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The request is not in the state the operation requires.
    ///
    /// Typically a `start` on a request that is still in flight, or a `stop`
    /// on one that already completed.
    #[error("request is not in the required state")]
    InvalidState,

    /// The loop was not created yet, or was closed in the meantime.
    #[error("event loop is not initialized")]
    NotInitialized,

    /// A parameter failed validation before reaching the OS.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A backend syscall failed. The operation name says which one.
    #[error("backend failure in {op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// A `run*` call was made from inside a completion callback.
    #[error("the event loop is already running a callback")]
    Busy,

    /// Reserved for timeout patterns composed by the caller.
    #[error("operation timed out")]
    TimedOut,
}

/// A result for operations of this crate that may fail.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap the current `errno` as a backend failure.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Error::Backend {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Fold a raw (positive) errno value, as reported by ring completions.
    #[cfg(target_os = "linux")]
    pub(crate) fn from_raw_os_error(op: &'static str, code: i32) -> Self {
        if code == libc::ECANCELED {
            Error::Cancelled
        } else {
            Error::Backend {
                op,
                source: io::Error::from_raw_os_error(code),
            }
        }
    }
}
