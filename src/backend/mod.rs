//! The backend adapters: one uniform interface over the OS-native queues.
//!
//! Two adapters are compiled in: the readiness multiplexer (mio on all
//! platforms; on Windows mio's selector is itself a completion port, so
//! that queue is reached through here as well) and the submission/completion
//! ring (io_uring, Linux, probed at runtime). The variant is chosen once at
//! loop creation; dispatch is a plain `match`, no vtable in the hot path.
//!
//! The contract, per operation:
//!
//! * `arm` translates a request's kind and payload into OS interest or a
//!   ring submission. It may complete synchronously (the readiness adapter
//!   tries the non-blocking syscall first), in which case the loop queues
//!   the outcome for the next dispatch phase.
//! * `disarm` is best-effort cancellation: immediate on the readiness
//!   adapter, deferred until the cancel CQE on the ring.
//! * `poll` blocks until at least one event or the deadline and reports
//!   what happened; folding raw events into outcomes happens in `on_ready`
//!   (readiness) or `complete` (ring).

pub(crate) mod readiness;
#[cfg(target_os = "linux")]
pub(crate) mod ring;

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::recycler::Recycler;
use crate::request::{Outcome, Slot};
use crate::wake::WakeChannel;
use crate::Api;

/// Which adapter actually engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Readiness multiplexing (epoll/kqueue through mio; IOCP-backed on
    /// Windows).
    Readiness,
    /// io_uring submission/completion rings.
    Ring,
}

/// One raw event out of `poll`.
pub(crate) enum Filled {
    /// A watched descriptor changed readiness.
    Io {
        fd: RawFd,
        readable: bool,
        writable: bool,
    },
    /// A ring operation finished.
    #[cfg(target_os = "linux")]
    RingOp { idx: usize, gen32: u32, result: i32 },
    /// The cross-thread wake channel fired.
    Wake,
    /// The signalfd fired; child processes want reaping.
    Child,
}

/// What `arm` did with the request.
pub(crate) enum Armed {
    /// Interest registered or submission queued; a completion will follow.
    Pending,
    /// The operation finished on the spot.
    Completed(Outcome),
}

/// What `disarm` managed.
pub(crate) enum Disarm {
    /// The request is out of the backend, release it now.
    Done,
    /// A cancellation is in flight; hold the request in `Cancelling` until
    /// its completion arrives.
    Deferred,
}

pub(crate) enum Backend {
    Readiness(readiness::Readiness),
    #[cfg(target_os = "linux")]
    Ring(ring::Ring),
}

impl Backend {
    /// Build the adapter the options ask for, probing the ring at runtime
    /// and falling back to readiness when it is not there.
    pub fn create(api: Api) -> Result<Backend> {
        #[cfg(target_os = "linux")]
        {
            let want_ring = match api {
                Api::ForceRing => true,
                Api::Automatic => ring::Ring::available(),
                Api::ForceReadiness => false,
            };
            if want_ring {
                return Ok(Backend::Ring(ring::Ring::create()?));
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = api; // The option only distinguishes Linux backends
        Ok(Backend::Readiness(readiness::Readiness::create()?))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Readiness(_) => BackendKind::Readiness,
            #[cfg(target_os = "linux")]
            Backend::Ring(_) => BackendKind::Ring,
        }
    }

    /// A clone of the channel that interrupts this backend's `poll`.
    pub fn wake_channel(&self) -> WakeChannel {
        match self {
            Backend::Readiness(b) => b.wake_channel(),
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.wake_channel(),
        }
    }

    /// Register an externally created handle. Both Unix adapters pick
    /// handles up lazily at `arm`, so this only validates the descriptor.
    pub fn associate(&mut self, fd: RawFd) -> Result<()> {
        match self {
            Backend::Readiness(b) => b.associate(fd),
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.associate(fd),
        }
    }

    /// Does the backend run regular-file I/O natively, or must the loop
    /// route it through the worker pool?
    pub fn supports_file_io(&self) -> bool {
        match self {
            Backend::Readiness(_) => false,
            #[cfg(target_os = "linux")]
            Backend::Ring(_) => true,
        }
    }

    pub fn arm(&mut self, idx: usize, slot: &mut Slot) -> Armed {
        match self {
            Backend::Readiness(b) => b.arm(idx, slot),
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.arm(idx, slot),
        }
    }

    pub fn disarm(&mut self, idx: usize, slot: &mut Slot) -> Disarm {
        match self {
            Backend::Readiness(b) => b.disarm(idx, slot),
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.disarm(idx, slot),
        }
    }

    /// Start watching the signalfd for child-exit bursts.
    pub fn watch_signal_fd(&mut self, fd: RawFd) -> Result<()> {
        match self {
            Backend::Readiness(b) => b.watch_signal_fd(fd),
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.watch_signal_fd(fd),
        }
    }

    /// Re-arm the signal watch after a burst, where the watch is one-shot.
    pub fn rearm_signal_watch(&mut self, fd: RawFd) -> Result<()> {
        match self {
            Backend::Readiness(_) => Ok(()), // mio registration stays armed
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.watch_signal_fd(fd),
        }
    }

    /// Block until at least one event or the deadline. `None` blocks
    /// indefinitely, `Some(ZERO)` just drains.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Filled>) -> Result<()> {
        match self {
            Backend::Readiness(b) => b.poll(timeout, out),
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.poll(timeout, out),
        }
    }

    /// Readiness only: perform the actual syscalls for a descriptor that
    /// turned ready, producing zero or more final outcomes.
    pub fn on_ready(
        &mut self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        slots: &mut Recycler<Slot>,
        out: &mut Vec<(usize, u64, Outcome)>,
    ) {
        match self {
            Backend::Readiness(b) => b.on_ready(fd, readable, writable, slots, out),
            #[cfg(target_os = "linux")]
            Backend::Ring(_) => unreachable!("readiness events on the ring backend"),
        }
    }

    /// Ring only: fold a CQE result into the request, possibly resubmitting
    /// (partial sends). `None` means the request stays in flight.
    #[cfg(target_os = "linux")]
    pub fn complete(&mut self, idx: usize, slot: &mut Slot, result: i32) -> Option<Outcome> {
        match self {
            Backend::Readiness(_) => unreachable!("CQEs on the readiness backend"),
            Backend::Ring(b) => b.complete(idx, slot, result),
        }
    }

    /// Best-effort teardown: make sure the kernel is done touching request
    /// memory before the slots are dropped.
    pub fn shutdown(&mut self) {
        match self {
            Backend::Readiness(_) => {}
            #[cfg(target_os = "linux")]
            Backend::Ring(b) => b.shutdown(),
        }
    }
}
