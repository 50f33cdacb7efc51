//! The readiness multiplexer backend, built on mio.
//!
//! Readiness semantics are turned into completion semantics the classic
//! reactor way: `arm` first tries the non-blocking syscall. If it finishes,
//! that is a synchronous completion and nothing is registered. If the kernel
//! says would-block, interest in the descriptor is registered and the
//! syscall is retried when the poll reports readiness. This also keeps
//! edge-triggered polling honest: every (re-)arm drains the descriptor
//! before going back to sleep on it.
//!
//! Two requests may share one descriptor (a receive and a send); mio allows
//! a single registration per fd, so both directions fold into one entry
//! whose interest set is the union.

use std::collections::HashMap;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use super::{Armed, Disarm, Filled};
use crate::error::{Error, Result};
use crate::fd::SockAddr;
use crate::recycler::Recycler;
use crate::request::{Op, Outcome, ReceiveOp, SendOp, Slot};
use crate::wake::{WakeChannel, WakeFn};

const WAKER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
/// Descriptor tokens start here; a token is `fd + TOKEN_SHIFT`.
const TOKEN_SHIFT: usize = 2;

/// Requests currently interested in one descriptor, one per direction.
#[derive(Default)]
struct FdEntry {
    reader: Option<usize>,
    writer: Option<usize>,
}

impl FdEntry {
    fn interest(&self) -> Option<Interest> {
        match (self.reader.is_some(), self.writer.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub(crate) struct Readiness {
    poll: Poll,
    events: Events,
    channel: WakeChannel,
    fds: HashMap<RawFd, FdEntry>,
}

impl Readiness {
    pub fn create() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let channel = WakeChannel::new(WakeFn::Mio(Arc::new(waker)));
        Ok(Readiness {
            poll,
            events: Events::with_capacity(1024),
            channel,
            fds: HashMap::new(),
        })
    }

    pub fn wake_channel(&self) -> WakeChannel {
        self.channel.clone()
    }

    pub fn associate(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidArgument("negative file descriptor"));
        }
        Ok(())
    }

    pub fn watch_signal_fd(&mut self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), SIGNAL_TOKEN, Interest::READABLE)?;
        Ok(())
    }

    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Filled>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal interrupted the wait; the loop recomputes and retries
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        for event in self.events.iter() {
            match event.token() {
                WAKER_TOKEN => out.push(Filled::Wake),
                SIGNAL_TOKEN => out.push(Filled::Child),
                Token(token) => {
                    // Errors and hang-ups surface through the syscall retry,
                    // so fold them into both directions
                    let broken = event.is_error();
                    out.push(Filled::Io {
                        fd: (token - TOKEN_SHIFT) as RawFd,
                        readable: event.is_readable() || event.is_read_closed() || broken,
                        writable: event.is_writable() || event.is_write_closed() || broken,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn arm(&mut self, idx: usize, slot: &mut Slot) -> Armed {
        match &mut slot.op {
            Op::Accept(op) => match try_accept(op.fd) {
                Some(result) => Armed::Completed(Outcome::Accepted(result)),
                None => self.register(op.fd, idx, Direction::Read),
            },
            Op::Connect(op) => {
                let raw = SockAddr::from_std(&op.addr);
                match try_connect(op.fd, &raw) {
                    Some(result) => Armed::Completed(Outcome::Unit(result)),
                    None => self.register(op.fd, idx, Direction::Write),
                }
            }
            Op::Send(op) => match try_send(op) {
                Some(result) => Armed::Completed(Outcome::Unit(result)),
                None => self.register(op.fd, idx, Direction::Write),
            },
            Op::Receive(op) => match try_recv(op) {
                Some(result) => Armed::Completed(Outcome::Bytes(result)),
                None => self.register(op.fd, idx, Direction::Read),
            },
            Op::SocketClose(op) => Armed::Completed(Outcome::Unit(crate::fd::close_raw(op.fd))),
            Op::FileClose(op) => Armed::Completed(Outcome::Unit(crate::fd::close_raw(op.fd))),
            // Timers, wake-ups, work and process exits never reach the
            // backend; file I/O goes through the worker pool here
            _ => unreachable!("request kind is not backend-armed"),
        }
    }

    pub fn disarm(&mut self, idx: usize, slot: &mut Slot) -> Disarm {
        let fd = match &slot.op {
            Op::Accept(op) => op.fd,
            Op::Connect(op) => op.fd,
            Op::Send(op) => op.fd,
            Op::Receive(op) => op.fd,
            _ => return Disarm::Done,
        };
        self.clear(fd, idx);
        Disarm::Done
    }

    pub fn on_ready(
        &mut self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        slots: &mut Recycler<Slot>,
        out: &mut Vec<(usize, u64, Outcome)>,
    ) {
        if readable {
            if let Some(idx) = self.fds.get(&fd).and_then(|e| e.reader) {
                if let Some(outcome) = perform_read_side(&mut slots[idx].op) {
                    let generation = slots[idx].generation;
                    self.clear(fd, idx);
                    out.push((idx, generation, outcome));
                }
            }
        }
        if writable {
            if let Some(idx) = self.fds.get(&fd).and_then(|e| e.writer) {
                if let Some(outcome) = perform_write_side(&mut slots[idx].op) {
                    let generation = slots[idx].generation;
                    self.clear(fd, idx);
                    out.push((idx, generation, outcome));
                }
            }
        }
    }

    /// Record interest of `idx` in one direction of `fd` and sync the mio
    /// registration to the union of directions.
    fn register(&mut self, fd: RawFd, idx: usize, direction: Direction) -> Armed {
        let entry = self.fds.entry(fd).or_default();
        let had_any = entry.reader.is_some() || entry.writer.is_some();
        match direction {
            Direction::Read => entry.reader = Some(idx),
            Direction::Write => entry.writer = Some(idx),
        }
        let interest = entry.interest().unwrap();
        let token = Token(fd as usize + TOKEN_SHIFT);
        let registry = self.poll.registry();
        let registered = if had_any {
            registry.reregister(&mut SourceFd(&fd), token, interest)
        } else {
            registry.register(&mut SourceFd(&fd), token, interest)
        };
        match registered {
            Ok(()) => {
                trace!("armed fd {} for {:?}", fd, interest);
                Armed::Pending
            }
            Err(e) => {
                // Roll the direction back and fail the request instead
                self.clear(fd, idx);
                let err = Error::Backend {
                    op: "register",
                    source: e,
                };
                Armed::Completed(error_outcome_for(direction, err))
            }
        }
    }

    /// Drop `idx` from whatever directions of `fd` it holds and sync or
    /// drop the mio registration.
    fn clear(&mut self, fd: RawFd, idx: usize) {
        let entry = match self.fds.get_mut(&fd) {
            Some(entry) => entry,
            None => return,
        };
        if entry.reader == Some(idx) {
            entry.reader = None;
        }
        if entry.writer == Some(idx) {
            entry.writer = None;
        }
        let interest = entry.interest();
        let token = Token(fd as usize + TOKEN_SHIFT);
        let registry = self.poll.registry();
        // The fd may already be gone (closed out from under the loop), so
        // these are best-effort
        match interest {
            Some(interest) => {
                let _ = registry.reregister(&mut SourceFd(&fd), token, interest);
            }
            None => {
                let _ = registry.deregister(&mut SourceFd(&fd));
                self.fds.remove(&fd);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

fn error_outcome_for(direction: Direction, err: Error) -> Outcome {
    match direction {
        Direction::Read => Outcome::Bytes(Err(err)),
        Direction::Write => Outcome::Unit(Err(err)),
    }
}

/// Run the syscall for the read-direction request on a ready descriptor.
/// `None` keeps it armed (the readiness was stale).
fn perform_read_side(op: &mut Op) -> Option<Outcome> {
    match op {
        Op::Accept(op) => try_accept(op.fd).map(|r| Outcome::Accepted(r)),
        Op::Receive(op) => try_recv(op).map(|r| Outcome::Bytes(r)),
        _ => None,
    }
}

fn perform_write_side(op: &mut Op) -> Option<Outcome> {
    match op {
        Op::Connect(op) => Some(Outcome::Unit(connect_finish(op.fd))),
        Op::Send(op) => try_send(op).map(|r| Outcome::Unit(r)),
        _ => None,
    }
}

fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// `None` = would block, `Some` = final result.
fn try_accept(fd: RawFd) -> Option<Result<OwnedFd>> {
    loop {
        let client = unsafe {
            libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if client >= 0 {
            return Some(Ok(unsafe { OwnedFd::from_raw_fd(client) }));
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        if would_block(e) {
            return None;
        }
        return Some(Err(Error::last_os("accept")));
    }
}

/// First step of a connect. `None` = handshake in progress, watch writable.
fn try_connect(fd: RawFd, addr: &SockAddr) -> Option<Result<()>> {
    loop {
        let rc = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
        if rc == 0 {
            return Some(Ok(()));
        }
        match errno() {
            libc::EINTR => continue,
            libc::EINPROGRESS | libc::EALREADY => return None,
            libc::EISCONN => return Some(Ok(())),
            _ => return Some(Err(Error::last_os("connect"))),
        }
    }
}

/// Second step, once the socket reports writable.
fn connect_finish(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        Err(Error::last_os("getsockopt"))
    } else if err != 0 {
        Err(Error::Backend {
            op: "connect",
            source: io::Error::from_raw_os_error(err),
        })
    } else {
        Ok(())
    }
}

/// Push as much of the buffer as the kernel takes. `None` = partial, stay
/// armed for writable; `Some(Ok)` only once every byte was accepted.
fn try_send(op: &mut SendOp) -> Option<Result<()>> {
    while op.sent < op.buffer.len() {
        let remaining = &op.buffer[op.sent..];
        let n = unsafe {
            libc::send(
                op.fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n > 0 {
            op.sent += n as usize;
            continue;
        }
        if n == 0 {
            return Some(Err(Error::Backend {
                op: "send",
                source: io::Error::new(io::ErrorKind::WriteZero, "send accepted zero bytes"),
            }));
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        if would_block(e) {
            return None;
        }
        return Some(Err(Error::last_os("send")));
    }
    Some(Ok(()))
}

/// `Some(Ok(0))` is a real completion: the peer closed the stream.
fn try_recv(op: &mut ReceiveOp) -> Option<Result<usize>> {
    loop {
        let n = unsafe {
            libc::recv(
                op.fd,
                op.buffer.as_mut_ptr() as *mut libc::c_void,
                op.buffer.len(),
                0,
            )
        };
        if n >= 0 {
            return Some(Ok(n as usize));
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        if would_block(e) {
            return None;
        }
        return Some(Err(Error::last_os("recv")));
    }
}
