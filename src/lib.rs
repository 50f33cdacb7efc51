//! Troika is a single-threaded, multi-backend asynchronous I/O event loop.
//!
//! # Motivation
//!
//! Why another event loop library? Most of the asynchronous Rust world is
//! organized around futures and executors, and that is a fine model, until
//! you need to know exactly *when* a thing is armed in the kernel, *who*
//! owns the request while it is in flight, and *what* happens to it when
//! you tear the loop down mid-operation. Troika goes with the good old
//! request-and-callback style: you own a small request object, you `start`
//! it on a loop, and when the operation finishes your callback runs on the
//! loop thread with a typed result. No hidden allocation per operation, no
//! futures machinery between you and the kernel.
//!
//! One request model rides three flavours of OS queue behind a single
//! adapter interface: a readiness multiplexer (epoll and friends, through
//! [mio](https://crates.io/crates/mio), which on Windows is itself backed
//! by a completion port), and an io_uring submission/completion ring on
//! Linux kernels that have one. The backend is picked once, when the loop
//! is created; `Automatic` probes for the ring and falls back to readiness.
//!
//! # Interface
//!
//! There is one central object, [`EventLoop`]. Each kind of operation has a
//! caller-owned request type ([`AsyncTimeout`], [`AsyncWakeUp`],
//! [`AsyncWork`], [`AsyncProcessExit`], [`AsyncAccept`], [`AsyncConnect`],
//! [`AsyncSend`], [`AsyncReceive`], [`AsyncSocketClose`],
//! [`AsyncFileRead`], [`AsyncFileWrite`], [`AsyncFileClose`]) with a
//! `start` that moves its parameters (buffers included) into the loop and a
//! `stop` that cancels. Completion callbacks receive the loop plus a
//! per-kind result object; asking the result to
//! `reactivate_request(true)` re-arms the request without a fresh `start`,
//! which is how accept loops, repeating timers and chunked reads are built.
//!
//! ```no_run
//! use std::time::Duration;
//! use troika::{EventLoop, AsyncTimeout, Options};
//!
//! fn main() -> troika::Result<()> {
//!     let mut event_loop = EventLoop::new();
//!     event_loop.create(Options::default())?;
//!     let mut timeout = AsyncTimeout::new();
//!     timeout.start(&mut event_loop, Duration::from_millis(200), |_loop, res| {
//!         println!("fired after {:?}", res.relative_timeout());
//!     })?;
//!     event_loop.run()?;
//!     event_loop.close()
//! }
//! ```
//!
//! # Thread safety
//!
//! The loop is not thread safe and does not try to be: every `start`,
//! `stop` and callback happens on the thread that runs it. Exactly three
//! doors are open to other threads, and they are the safe ones:
//! [`WakeHandle::wake`], [`AsyncWakeUp::wake_up`] on a started wake-up
//! request, and the worker pool posting its completions back. Wake-ups
//! coalesce: any number of signals between two loop iterations produce one
//! callback.
//!
//! Blocking work (user jobs, and regular-file I/O on the readiness backend
//! where files cannot be polled) runs on a worker pool owned by the loop
//! ([`EventLoop::pool_thread_count_set`]); after-work callbacks still run
//! on the loop thread.
//!
//! # Lifecycle
//!
//! A request is `Free` until started, `Submitting` until the loop stages it
//! into the backend, then `Active` until it completes, is stopped, or the
//! loop is closed. [`EventLoop::close`] frees every request *without*
//! invoking callbacks and returns the loop to its uninitialized state; the
//! same loop value (and the same request objects) can then be `create`d and
//! started again.

mod backend;
mod chain;
mod clock;
mod core;
mod error;
mod fd;
mod pool;
mod recycler;
mod request;
mod wake;

pub use crate::backend::BackendKind;
pub use crate::core::{Api, EventLoop, Options, WakeHandle};
pub use crate::error::{Error, Result};
pub use crate::fd::Family;
pub use crate::request::{
    AcceptResult, AsyncAccept, AsyncConnect, AsyncFileClose, AsyncFileRead, AsyncFileWrite,
    AsyncProcessExit, AsyncReceive, AsyncSend, AsyncSocketClose, AsyncTimeout, AsyncWakeUp,
    AsyncWork, CloseResult, ConnectResult, FileReadResult, FileWriteResult, ProcessExitResult,
    ReceiveResult, SendResult, TimeoutResult, WakeUpResult, WorkResult,
};
pub use crate::wake::EventSignal;
