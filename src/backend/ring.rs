//! The submission/completion ring backend, built on io_uring.
//!
//! Every armed request becomes one SQE whose user data packs the slot index
//! with the low half of its generation, so late completions for recycled
//! slots are detectable. Wake-ups ride a standing read on an eventfd that is
//! re-armed after each firing; the poll deadline is a plain timeout SQE.
//!
//! Cancellation is deferred here: `disarm` pushes an async-cancel and the
//! request stays in `Cancelling` until the operation's own CQE (usually
//! `ECANCELED`) confirms the kernel let go of its buffers.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use log::{debug, trace};

use super::{Armed, Disarm, Filled};
use crate::error::{Error, Result};
use crate::request::{Op, Outcome, Slot};
use crate::wake::{WakeChannel, WakeFn};

const WAKE_UD: u64 = u64::MAX;
const SIGNAL_UD: u64 = u64::MAX - 1;
const TIMEOUT_UD: u64 = u64::MAX - 2;
const CANCEL_UD: u64 = u64::MAX - 3;

const ENTRIES: u32 = 256;

fn user_data(idx: usize, generation: u64) -> u64 {
    ((generation & 0xffff_ffff) << 32) | (idx as u64 & 0xffff_ffff)
}

pub(crate) struct Ring {
    ring: IoUring,
    channel: WakeChannel,
    efd: Arc<OwnedFd>,
    /// Landing pad for the standing eventfd read; owned here so it outlives
    /// any in-flight read.
    efd_buf: Box<u64>,
    /// Deadline for the current poll; the kernel copies it at submission.
    timespec: Box<types::Timespec>,
    /// SQEs that did not fit the submission queue.
    backlog: VecDeque<squeue::Entry>,
    /// User data of request operations the kernel still owns.
    inflight: HashSet<u64>,
    /// Standing eventfd read + signalfd poll, counted for teardown.
    internal: usize,
    wake_armed: bool,
    signal_armed: bool,
    shutting_down: bool,
}

impl Ring {
    /// Runtime probe: does this kernel speak io_uring?
    pub fn available() -> bool {
        IoUring::new(4).is_ok()
    }

    pub fn create() -> Result<Self> {
        let ring = IoUring::new(ENTRIES).map_err(|e| Error::Backend {
            op: "io_uring_setup",
            source: e,
        })?;
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::last_os("eventfd"));
        }
        let efd = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });
        let channel = WakeChannel::new(WakeFn::EventFd(efd.clone()));
        let mut ring = Ring {
            ring,
            channel,
            efd,
            efd_buf: Box::new(0),
            timespec: Box::new(types::Timespec::new()),
            backlog: VecDeque::new(),
            inflight: HashSet::new(),
            internal: 0,
            wake_armed: false,
            signal_armed: false,
            shutting_down: false,
        };
        ring.arm_wake_read();
        Ok(ring)
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

    /// Queue an SQE, flushing to the kernel when the queue is full.
    fn push(&mut self, sqe: squeue::Entry) {
        unsafe {
            if self.ring.submission().push(&sqe).is_err() {
                let _ = self.ring.submit();
                if self.ring.submission().push(&sqe).is_err() {
                    self.backlog.push_back(sqe);
                }
            }
        }
    }

    fn arm_wake_read(&mut self) {
        if self.wake_armed || self.shutting_down {
            return;
        }
        let sqe = opcode::Read::new(
            types::Fd(self.efd.as_raw_fd()),
            &mut *self.efd_buf as *mut u64 as *mut u8,
            8,
        )
        .build()
        .user_data(WAKE_UD);
        self.push(sqe);
        self.wake_armed = true;
        self.internal += 1;
    }

    pub fn watch_signal_fd(&mut self, fd: RawFd) -> Result<()> {
        if self.signal_armed {
            return Ok(());
        }
        let sqe = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(SIGNAL_UD);
        self.push(sqe);
        self.signal_armed = true;
        self.internal += 1;
        Ok(())
    }

    pub fn arm(&mut self, idx: usize, slot: &mut Slot) -> Armed {
        let ud = user_data(idx, slot.generation);
        let sqe = prepare_sqe(slot);
        self.push(sqe.user_data(ud));
        self.inflight.insert(ud);
        trace!("ring armed {} as {:#x}", slot.kind_name(), ud);
        Armed::Pending
    }

    /// Socket operations on non-blocking descriptors come back `-EAGAIN`
    /// instead of waiting; re-queue them behind a linked poll.
    fn resubmit_after_poll(&mut self, fd: RawFd, poll_mask: u32, slot: &mut Slot, ud: u64) {
        let poll = opcode::PollAdd::new(types::Fd(fd), poll_mask)
            .build()
            .flags(squeue::Flags::IO_LINK)
            .user_data(CANCEL_UD);
        self.push(poll);
        let sqe = prepare_sqe(slot);
        self.push(sqe.user_data(ud));
        self.inflight.insert(ud);
    }

    pub fn disarm(&mut self, idx: usize, slot: &mut Slot) -> Disarm {
        let ud = user_data(idx, slot.generation);
        let sqe = opcode::AsyncCancel::new(ud).build().user_data(CANCEL_UD);
        self.push(sqe);
        Disarm::Deferred
    }

    /// Fold a CQE into the request. `None` keeps it in flight (a partial
    /// send or a would-block retry got resubmitted).
    pub fn complete(&mut self, idx: usize, slot: &mut Slot, result: i32) -> Option<Outcome> {
        if result == -libc::EAGAIN {
            let ud = user_data(idx, slot.generation);
            match &slot.op {
                Op::Accept(op) => {
                    let fd = op.fd;
                    self.resubmit_after_poll(fd, libc::POLLIN as u32, slot, ud);
                    return None;
                }
                Op::Receive(op) => {
                    let fd = op.fd;
                    self.resubmit_after_poll(fd, libc::POLLIN as u32, slot, ud);
                    return None;
                }
                Op::Send(op) => {
                    let fd = op.fd;
                    self.resubmit_after_poll(fd, libc::POLLOUT as u32, slot, ud);
                    return None;
                }
                _ => {}
            }
        }
        match &mut slot.op {
            Op::Accept(_) => Some(if result >= 0 {
                Outcome::Accepted(Ok(unsafe { OwnedFd::from_raw_fd(result) }))
            } else {
                Outcome::Accepted(Err(Error::from_raw_os_error("accept", -result)))
            }),
            Op::Connect(op) => {
                op.raw_addr = None;
                Some(if result == 0 {
                    Outcome::Unit(Ok(()))
                } else {
                    Outcome::Unit(Err(Error::from_raw_os_error("connect", -result)))
                })
            }
            Op::Send(op) => {
                if result < 0 {
                    return Some(Outcome::Unit(Err(Error::from_raw_os_error(
                        "send", -result,
                    ))));
                }
                if result == 0 {
                    return Some(Outcome::Unit(Err(Error::Backend {
                        op: "send",
                        source: io::Error::new(
                            io::ErrorKind::WriteZero,
                            "send accepted zero bytes",
                        ),
                    })));
                }
                op.sent += result as usize;
                if op.sent < op.buffer.len() {
                    // Resubmit the rest; the completion fires when the whole
                    // buffer went through
                    let ud = user_data(idx, slot.generation);
                    let remaining = &op.buffer[op.sent..];
                    let sqe = opcode::Send::new(
                        types::Fd(op.fd),
                        remaining.as_ptr(),
                        remaining.len() as u32,
                    )
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
                    .user_data(ud);
                    self.push(sqe);
                    self.inflight.insert(ud);
                    None
                } else {
                    Some(Outcome::Unit(Ok(())))
                }
            }
            Op::Receive(_) => Some(if result >= 0 {
                Outcome::Bytes(Ok(result as usize))
            } else {
                Outcome::Bytes(Err(Error::from_raw_os_error("recv", -result)))
            }),
            Op::SocketClose(_) | Op::FileClose(_) => Some(if result == 0 {
                Outcome::Unit(Ok(()))
            } else {
                Outcome::Unit(Err(Error::from_raw_os_error("close", -result)))
            }),
            Op::FileRead(_) => Some(if result >= 0 {
                Outcome::Bytes(Ok(result as usize))
            } else {
                Outcome::Bytes(Err(Error::from_raw_os_error("read", -result)))
            }),
            Op::FileWrite(_) => Some(if result >= 0 {
                Outcome::Bytes(Ok(result as usize))
            } else {
                Outcome::Bytes(Err(Error::from_raw_os_error("write", -result)))
            }),
            _ => unreachable!("request kind has no ring completion"),
        }
    }

    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Filled>) -> Result<()> {
        // Anything that overflowed earlier goes first
        while let Some(sqe) = self.backlog.pop_front() {
            unsafe {
                if self.ring.submission().push(&sqe).is_err() {
                    self.backlog.push_front(sqe);
                    break;
                }
            }
        }

        let wait = match timeout {
            Some(t) if t.is_zero() => false,
            Some(t) => {
                // The deadline is an SQE of its own; its CQE is ignored
                *self.timespec = types::Timespec::new()
                    .sec(t.as_secs())
                    .nsec(t.subsec_nanos());
                let sqe = opcode::Timeout::new(&*self.timespec)
                    .build()
                    .user_data(TIMEOUT_UD);
                self.push(sqe);
                true
            }
            None => true,
        };

        let submitted = if wait {
            self.ring.submit_and_wait(1)
        } else {
            self.ring.submit()
        };
        match submitted {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => {}
            Err(e) => {
                return Err(Error::Backend {
                    op: "io_uring_enter",
                    source: e,
                })
            }
        }

        // Drain first, re-arm afterwards: pushing while iterating the
        // completion queue would alias the ring
        let cqes: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (ud, result) in cqes {
            match ud {
                WAKE_UD => {
                    self.wake_armed = false;
                    self.internal -= 1;
                    out.push(Filled::Wake);
                    self.arm_wake_read();
                }
                SIGNAL_UD => {
                    self.signal_armed = false;
                    self.internal -= 1;
                    out.push(Filled::Child);
                }
                TIMEOUT_UD | CANCEL_UD => {}
                _ => {
                    self.inflight.remove(&ud);
                    out.push(Filled::RingOp {
                        idx: (ud & 0xffff_ffff) as usize,
                        gen32: (ud >> 32) as u32,
                        result,
                    });
                }
            }
        }
        Ok(())
    }

    /// Wait out (cancelling first) everything the kernel still references,
    /// so slot buffers can be dropped safely.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        for ud in self.inflight.clone() {
            self.push(opcode::AsyncCancel::new(ud).build().user_data(CANCEL_UD));
        }
        if self.wake_armed {
            self.push(
                opcode::AsyncCancel::new(WAKE_UD)
                    .build()
                    .user_data(CANCEL_UD),
            );
        }
        if self.signal_armed {
            self.push(
                opcode::AsyncCancel::new(SIGNAL_UD)
                    .build()
                    .user_data(CANCEL_UD),
            );
        }

        let mut rounds = 0;
        while (!self.inflight.is_empty() || self.internal > 0) && rounds < 1024 {
            rounds += 1;
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(_) => break,
            }
            let cqes: Vec<u64> = self.ring.completion().map(|cqe| cqe.user_data()).collect();
            for ud in cqes {
                match ud {
                    WAKE_UD => {
                        self.wake_armed = false;
                        self.internal -= 1;
                    }
                    SIGNAL_UD => {
                        self.signal_armed = false;
                        self.internal -= 1;
                    }
                    TIMEOUT_UD | CANCEL_UD => {}
                    _ => {
                        self.inflight.remove(&ud);
                    }
                }
            }
        }
        if !self.inflight.is_empty() || self.internal > 0 {
            debug!(
                "ring shutdown left {} operations behind",
                self.inflight.len() + self.internal
            );
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        if !self.shutting_down {
            self.shutdown();
        }
    }
}

/// Translate a request's kind and payload into one SQE. The buffers and the
/// parked raw address live in the slot, which outlives the submission.
fn prepare_sqe(slot: &mut Slot) -> squeue::Entry {
    match &mut slot.op {
        Op::Accept(op) => {
            opcode::Accept::new(types::Fd(op.fd), std::ptr::null_mut(), std::ptr::null_mut())
                .build()
        }
        Op::Connect(op) => {
            // Park the raw address in the slot; the kernel reads it until
            // the CQE arrives
            let raw = Box::new(crate::fd::SockAddr::from_std(&op.addr));
            let sqe = opcode::Connect::new(types::Fd(op.fd), raw.as_ptr(), raw.len()).build();
            op.raw_addr = Some(raw);
            sqe
        }
        Op::Send(op) => {
            let remaining = &op.buffer[op.sent..];
            opcode::Send::new(types::Fd(op.fd), remaining.as_ptr(), remaining.len() as u32)
                .flags(libc::MSG_NOSIGNAL)
                .build()
        }
        Op::Receive(op) => opcode::Recv::new(
            types::Fd(op.fd),
            op.buffer.as_mut_ptr(),
            op.buffer.len() as u32,
        )
        .build(),
        Op::SocketClose(op) => opcode::Close::new(types::Fd(op.fd)).build(),
        Op::FileClose(op) => opcode::Close::new(types::Fd(op.fd)).build(),
        Op::FileRead(op) => opcode::Read::new(
            types::Fd(op.fd),
            op.buffer.as_mut_ptr(),
            op.buffer.len() as u32,
        )
        .offset(op.offset)
        .build(),
        Op::FileWrite(op) => opcode::Write::new(
            types::Fd(op.fd),
            op.buffer.as_ptr(),
            op.buffer.len() as u32,
        )
        .offset(op.offset)
        .build(),
        _ => unreachable!("request kind is not backend-armed"),
    }
}
