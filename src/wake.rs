//! Waking the loop from the outside world.
//!
//! Every backend has one native way to interrupt its wait: the readiness
//! multiplexer uses a `mio::Waker`, the ring keeps an eventfd with a standing
//! read. Both hide behind [`WakeChannel`], which adds the one semantic the
//! loop actually depends on: any number of `signal` calls between two drains
//! collapse into a single wake-up, and memory written before `signal` is
//! visible to the loop thread after `drain`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::{Error, Result};

/// The backend-native wake primitive.
#[derive(Clone)]
pub(crate) enum WakeFn {
    Mio(Arc<mio::Waker>),
    #[cfg(target_os = "linux")]
    EventFd(Arc<OwnedFd>),
}

impl WakeFn {
    fn wake(&self) -> Result<()> {
        match self {
            WakeFn::Mio(waker) => waker.wake().map_err(Error::Io),
            #[cfg(target_os = "linux")]
            WakeFn::EventFd(fd) => {
                let one: u64 = 1;
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, 8)
                };
                if n == 8 {
                    Ok(())
                } else {
                    let err = std::io::Error::last_os_error();
                    // A full counter means a wake-up is already pending
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        Ok(())
                    } else {
                        Err(Error::Io(err))
                    }
                }
            }
        }
    }
}

/// The cross-thread wake channel.
///
/// Cloning is cheap and the clones all point at the same pending flag, so a
/// clone handed to another thread keeps working for the lifetime of the
/// backend it came from.
#[derive(Clone)]
pub(crate) struct WakeChannel {
    pending: Arc<AtomicBool>,
    wake: WakeFn,
}

impl WakeChannel {
    pub fn new(wake: WakeFn) -> Self {
        WakeChannel {
            pending: Arc::new(AtomicBool::new(false)),
            wake,
        }
    }

    /// Callable from any thread. Only the first signal between two drains
    /// touches the OS; the rest just see the flag already set.
    ///
    /// The SeqCst swap is the happens-before edge: whatever the signalling
    /// thread wrote before this call is visible to the loop thread once its
    /// `drain` observes the flag.
    pub fn signal(&self) -> Result<()> {
        if !self.pending.swap(true, Ordering::SeqCst) {
            self.wake.wake()?;
        }
        Ok(())
    }

    /// Loop thread only. Clears the pending flag and reports whether any
    /// signal arrived since the previous drain.
    pub fn drain(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

/// An auto-reset event for handshakes between a posting thread and the loop.
///
/// A thread that triggered an [`AsyncWakeUp`](crate::AsyncWakeUp) can block in
/// [`wait`](EventSignal::wait) until the loop reports, after the user
/// callback returned, that the wake-up was fully processed.
#[derive(Clone, Default)]
pub struct EventSignal {
    inner: Arc<EventSignalInner>,
}

#[derive(Default)]
struct EventSignalInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl EventSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until someone signals, then consume the signal.
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.inner.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Release one (current or future) waiter.
    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock().unwrap();
        *signaled = true;
        self.inner.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn mio_channel() -> (mio::Poll, WakeChannel) {
        let poll = mio::Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), mio::Token(0)).unwrap();
        let channel = WakeChannel::new(WakeFn::Mio(Arc::new(waker)));
        (poll, channel)
    }

    #[test]
    fn signals_coalesce() {
        let (_poll, channel) = mio_channel();
        assert!(!channel.drain());
        channel.signal().unwrap();
        channel.signal().unwrap();
        channel.signal().unwrap();
        // Many signals, one pending notification
        assert!(channel.drain());
        assert!(!channel.drain());
    }

    #[test]
    fn signal_from_thread() {
        let (mut poll, channel) = mio_channel();
        let remote = channel.clone();
        let worker = thread::spawn(move || remote.signal().unwrap());
        let mut events = mio::Events::with_capacity(4);
        // The waker must interrupt the poll
        while events.is_empty() {
            poll.poll(&mut events, None).unwrap();
        }
        worker.join().unwrap();
        assert!(channel.drain());
    }

    #[test]
    fn event_signal_handshake() {
        let signal = EventSignal::new();
        let remote = signal.clone();
        let waiter = thread::spawn(move || remote.wait());
        signal.signal();
        waiter.join().unwrap();
        // Auto-reset: a second wait would block again, so the flag is down
        assert!(!*signal.inner.signaled.lock().unwrap());
    }
}
