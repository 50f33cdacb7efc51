//! The event loop itself: submission staging, polling, completion dispatch,
//! cancellation and teardown.
//!
//! The loop is single-threaded and cooperative. Everything that mutates
//! request state happens on the thread inside `run`/`run_once`/
//! `run_no_wait`; the only doors open to other threads are the wake channel
//! ([`WakeHandle`], [`AsyncWakeUp::wake_up`](crate::AsyncWakeUp::wake_up))
//! and the worker pool's completion queue.
//!
//! One iteration goes: snap the clock, stage submissions to the backend,
//! drain worker completions, poll the backend until the earliest timer
//! deadline (or a wake-up), then dispatch in a fixed order: after-work
//! callbacks, expired timers, I/O completions, wake-ups. A callback may
//! reactivate its request through the result object, in which case the loop
//! re-arms it instead of releasing it.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::num::Wrapping;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, FromRawFd};

#[cfg(target_os = "linux")]
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
#[cfg(target_os = "linux")]
use nix::unistd::Pid;

use crate::backend::{Armed, Backend, BackendKind, Disarm, Filled};
use crate::chain::{Chain, Links, QueueId};
use crate::clock::LoopClock;
use crate::error::{Error, Result};
use crate::fd::{self, Family};
use crate::pool::{Pool, PoolJob, PoolPayload};
use crate::recycler::Recycler;
use crate::request::{
    AcceptResult, AsyncAccept, AsyncConnect, AsyncFileClose, AsyncFileRead, AsyncFileWrite,
    AsyncProcessExit, AsyncReceive, AsyncSend, AsyncSocketClose, AsyncTimeout, AsyncWakeUp,
    AsyncWork, Cb, CloseResult, ConnectResult, FileReadResult, FileWriteResult, Handle, Op,
    Outcome, ProcessExitResult, ReceiveResult, SendResult, Slot, State, TimeoutResult,
    WakeUpResult, WakeUpShared, WorkFn, WorkResult,
};
use crate::request::{
    AcceptOp, ConnectOp, FileCloseOp, FileReadOp, FileWriteOp, ProcessExitOp, ReceiveOp, SendOp,
    SocketCloseOp, TimeoutOp, WakeUpOp, WorkOp,
};
use crate::wake::{EventSignal, WakeChannel};

/// Backend selection. On non-Linux platforms the choice is ignored and the
/// readiness adapter is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Api {
    /// Use the ring when the kernel has it, readiness otherwise.
    #[default]
    Automatic,
    ForceReadiness,
    ForceRing,
}

/// Options for [`EventLoop::create`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub api: Api,
}

/// A cheap, cloneable, `Send` handle that wakes the loop from any thread.
#[derive(Clone)]
pub struct WakeHandle {
    channel: WakeChannel,
}

impl WakeHandle {
    /// Interrupt the loop's poll. Any number of wakes between two loop
    /// iterations coalesce into one.
    pub fn wake(&self) -> Result<()> {
        self.channel.signal()
    }
}

static LOOP_UID: AtomicU64 = AtomicU64::new(1);

/// The event loop.
///
/// A fresh value holds no OS resources; [`create`](EventLoop::create)
/// allocates the backend queue and [`close`](EventLoop::close) returns the
/// loop to the uninitialized state, freeing every request without invoking
/// callbacks. The same value can be created and closed repeatedly.
#[derive(Default)]
pub struct EventLoop {
    inner: Option<Inner>,
    /// Set while a completion callback runs; re-entering `run*` then is an
    /// error.
    dispatching: bool,
    /// Desired worker pool size; 0 means "one thread, created on demand".
    pool_threads: usize,
}

struct Inner {
    uid: u64,
    backend: Backend,
    channel: WakeChannel,
    slots: Recycler<Slot>,
    generation: Wrapping<u64>,
    submissions: Chain,
    timers: Chain,
    wakeups: Chain,
    active: Chain,
    clock: LoopClock,
    /// Completions waiting for the I/O dispatch phase.
    ready: VecDeque<(usize, u64, Outcome)>,
    pool: Option<Pool>,
    /// pid → slot index of the watching process-exit request.
    processes: HashMap<i32, usize>,
    #[cfg(target_os = "linux")]
    signal_fd: Option<OwnedFd>,
}

impl Inner {
    /// Pull a slot out of whatever queue holds it and drop it from the
    /// arena, with the little cleanup some kinds need.
    fn release(&mut self, idx: usize) {
        match self.slots[idx].links.queue {
            QueueId::Detached => {}
            QueueId::Submission => self.submissions.remove(&mut self.slots, idx),
            QueueId::Timers => self.timers.remove(&mut self.slots, idx),
            QueueId::WakeUps => self.wakeups.remove(&mut self.slots, idx),
            QueueId::Active => self.active.remove(&mut self.slots, idx),
        }
        let slot = self.slots.release(idx);
        match slot.op {
            Op::ProcessExit(op) => {
                self.processes.remove(&op.pid);
            }
            // A close request that never ran still owns its handle
            Op::SocketClose(op) => {
                if slot.state == State::Submitting {
                    let _ = fd::close_raw(op.fd);
                }
            }
            Op::FileClose(op) => {
                if slot.state == State::Submitting {
                    let _ = fd::close_raw(op.fd);
                }
            }
            _ => {}
        }
    }

    /// Detach a slot from its queue ahead of running its callback.
    fn detach(&mut self, idx: usize) {
        match self.slots[idx].links.queue {
            QueueId::Detached => {}
            QueueId::Submission => self.submissions.remove(&mut self.slots, idx),
            QueueId::Timers => self.timers.remove(&mut self.slots, idx),
            QueueId::WakeUps => self.wakeups.remove(&mut self.slots, idx),
            QueueId::Active => self.active.remove(&mut self.slots, idx),
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        // A linear scan is plenty for realistic timer counts
        let mut earliest: Option<Instant> = None;
        for idx in self.timers.indices(&self.slots) {
            if let Op::Timeout(op) = &self.slots[idx].op {
                earliest = Some(match earliest {
                    Some(e) if e <= op.deadline => e,
                    _ => op.deadline,
                });
            }
        }
        earliest
    }

    fn complete_child(&mut self, pid: i32, status: i32) {
        if let Some(idx) = self.processes.remove(&pid) {
            if self.slots.valid(idx) {
                let generation = self.slots[idx].generation;
                self.ready
                    .push_back((idx, generation, Outcome::Exit(Ok(status))));
            }
        }
    }
}

/// The kinds, as a plain tag for dispatch.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Timeout,
    WakeUp,
    Work,
    ProcessExit,
    Accept,
    Connect,
    Send,
    Receive,
    SocketClose,
    FileRead,
    FileWrite,
    FileClose,
}

fn kind_of(op: &Op) -> Kind {
    match op {
        Op::Timeout(_) => Kind::Timeout,
        Op::WakeUp(_) => Kind::WakeUp,
        Op::Work(_) => Kind::Work,
        Op::ProcessExit(_) => Kind::ProcessExit,
        Op::Accept(_) => Kind::Accept,
        Op::Connect(_) => Kind::Connect,
        Op::Send(_) => Kind::Send,
        Op::Receive(_) => Kind::Receive,
        Op::SocketClose(_) => Kind::SocketClose,
        Op::FileRead(_) => Kind::FileRead,
        Op::FileWrite(_) => Kind::FileWrite,
        Op::FileClose(_) => Kind::FileClose,
    }
}

impl EventLoop {
    /// An uninitialized loop. It owns nothing until `create`.
    pub fn new() -> EventLoop {
        EventLoop::default()
    }

    /// Allocate the backend queue and the wake channel.
    pub fn create(&mut self, options: Options) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::InvalidState);
        }
        let backend = Backend::create(options.api)?;
        let channel = backend.wake_channel();
        // Child exits arrive through a signalfd; SIGCHLD must be blocked
        // before any thread (pool threads included) is spawned, or the
        // default disposition swallows it
        #[cfg(target_os = "linux")]
        block_sigchld()?;
        debug!("event loop created on {:?} backend", backend.kind());
        self.inner = Some(Inner {
            uid: LOOP_UID.fetch_add(1, Ordering::Relaxed),
            backend,
            channel,
            slots: Recycler::new(),
            generation: Wrapping(0),
            submissions: Chain::new(QueueId::Submission),
            timers: Chain::new(QueueId::Timers),
            wakeups: Chain::new(QueueId::WakeUps),
            active: Chain::new(QueueId::Active),
            clock: LoopClock::new(),
            ready: VecDeque::new(),
            pool: None,
            processes: HashMap::new(),
            #[cfg(target_os = "linux")]
            signal_fd: None,
        });
        Ok(())
    }

    /// Free every request (state back to Free, callbacks suppressed) and
    /// release the backend. The loop can be `create`d again afterwards.
    pub fn close(&mut self) -> Result<()> {
        let mut inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        // The ring must stop touching request buffers before they drop
        inner.backend.shutdown();
        for idx in inner.slots.indices() {
            inner.release(idx);
        }
        debug!("event loop closed");
        Ok(())
    }

    /// Run until every request completed or was stopped.
    pub fn run(&mut self) -> Result<()> {
        loop {
            {
                let inner = self.inner.as_ref().ok_or(Error::NotInitialized)?;
                if inner.slots.is_empty() {
                    return Ok(());
                }
            }
            self.run_step(false)?;
        }
    }

    /// One iteration: blocks until at least one completion, timer or
    /// wake-up was processed.
    pub fn run_once(&mut self) -> Result<()> {
        self.run_step(false)
    }

    /// One iteration with a zero poll deadline: dispatches whatever is
    /// already there and returns.
    pub fn run_no_wait(&mut self) -> Result<()> {
        self.run_step(true)
    }

    /// A `Send + Clone` handle to wake this loop from other threads.
    pub fn wake_handle(&self) -> Result<WakeHandle> {
        let inner = self.inner.as_ref().ok_or(Error::NotInitialized)?;
        Ok(WakeHandle {
            channel: inner.channel.clone(),
        })
    }

    /// Signal the wake channel directly. See [`WakeHandle`] for the form
    /// that can actually travel to another thread.
    pub fn wake_up_from_external_thread(&self) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(Error::NotInitialized)?;
        inner.channel.signal()
    }

    /// A TCP socket pre-configured for this loop (non-blocking,
    /// close-on-exec).
    pub fn create_async_tcp_socket(&mut self, family: Family) -> Result<OwnedFd> {
        self.inner.as_ref().ok_or(Error::NotInitialized)?;
        fd::create_tcp_socket(family)
    }

    /// Hand a socket created elsewhere to the loop. The descriptor must be
    /// non-blocking.
    pub fn associate_externally_created_tcp_socket(&mut self, socket: RawFd) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::NotInitialized)?;
        inner.backend.associate(socket)
    }

    /// Hand a file descriptor created elsewhere to the loop.
    pub fn associate_externally_created_file_descriptor(&mut self, file: RawFd) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::NotInitialized)?;
        inner.backend.associate(file)
    }

    /// Set the worker pool size. The pool itself is created lazily, with a
    /// single thread, the first time something needs it.
    pub fn pool_thread_count_set(&mut self, threads: usize) {
        self.pool_threads = threads;
        if let Some(inner) = &mut self.inner {
            if let Some(pool) = &mut inner.pool {
                pool.thread_count_set(threads);
            }
        }
    }

    /// How many requests are currently non-Free on this loop.
    pub fn request_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.slots.len())
    }

    /// Which backend actually engaged.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        let inner = self.inner.as_ref().ok_or(Error::NotInitialized)?;
        Ok(inner.backend.kind())
    }

    /// Runtime probe: is the submission ring available on this kernel?
    pub fn try_loading_ring() -> bool {
        #[cfg(target_os = "linux")]
        {
            crate::backend::ring::Ring::available()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    // -----------------------------------------------------------------------
    // start / stop plumbing used by the request objects
    // -----------------------------------------------------------------------

    pub(crate) fn handle_alive(&self, reg: Option<Handle>) -> bool {
        let (handle, inner) = match (reg, &self.inner) {
            (Some(handle), Some(inner)) => (handle, inner),
            _ => return false,
        };
        handle.loop_uid == inner.uid
            && inner.slots.valid(handle.idx)
            && inner.slots[handle.idx].generation == handle.generation
    }

    fn begin_start(&mut self, reg: &Option<Handle>) -> Result<()> {
        if self.handle_alive(*reg) {
            return Err(Error::InvalidState);
        }
        if self.inner.is_none() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// Put a new slot on the submission queue; staging happens on the next
    /// iteration.
    fn enroll(&mut self, op: Op, debug_name: Option<&'static str>) -> Handle {
        let inner = self.inner.as_mut().unwrap();
        let Wrapping(generation) = inner.generation;
        inner.generation += Wrapping(1);
        trace!("submitting {} request", op.kind_name());
        let idx = inner.slots.store(Slot {
            links: Links::detached(),
            generation,
            state: State::Submitting,
            debug_name,
            op,
        });
        inner.submissions.push_back(&mut inner.slots, idx);
        Handle {
            idx,
            generation,
            loop_uid: inner.uid,
        }
    }

    pub(crate) fn start_timeout(
        &mut self,
        req: &mut AsyncTimeout,
        relative: Duration,
        cb: Cb<TimeoutResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let op = Op::Timeout(TimeoutOp {
            relative,
            // The deadline counts from start, not from staging
            deadline: Instant::now() + relative,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_wake_up(
        &mut self,
        req: &mut AsyncWakeUp,
        event: Option<EventSignal>,
        cb: Cb<WakeUpResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let shared = Arc::new(WakeUpShared {
            pending: Default::default(),
            channel: self.inner.as_ref().unwrap().channel.clone(),
        });
        req.shared = Some(shared.clone());
        let op = Op::WakeUp(WakeUpOp {
            shared,
            event,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_work(
        &mut self,
        req: &mut AsyncWork,
        work: WorkFn,
        cb: Cb<WorkResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let op = Op::Work(WorkOp {
            work: Some(work),
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_process_exit(
        &mut self,
        req: &mut AsyncProcessExit,
        pid: i32,
        cb: Cb<ProcessExitResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        if pid <= 0 {
            return Err(Error::InvalidArgument("pid must be positive"));
        }
        let op = Op::ProcessExit(ProcessExitOp { pid, cb: Some(cb) });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_accept(
        &mut self,
        req: &mut AsyncAccept,
        fd: RawFd,
        cb: Cb<AcceptResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let op = Op::Accept(AcceptOp { fd, cb: Some(cb) });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_connect(
        &mut self,
        req: &mut AsyncConnect,
        fd: RawFd,
        addr: SocketAddr,
        cb: Cb<ConnectResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let op = Op::Connect(ConnectOp {
            fd,
            addr,
            raw_addr: None,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_send(
        &mut self,
        req: &mut AsyncSend,
        fd: RawFd,
        buffer: Vec<u8>,
        cb: Cb<SendResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        if buffer.is_empty() {
            return Err(Error::InvalidArgument("cannot send an empty buffer"));
        }
        let op = Op::Send(SendOp {
            fd,
            buffer,
            sent: 0,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_receive(
        &mut self,
        req: &mut AsyncReceive,
        fd: RawFd,
        buffer: Vec<u8>,
        cb: Cb<ReceiveResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        if buffer.is_empty() {
            return Err(Error::InvalidArgument("cannot receive into an empty buffer"));
        }
        let op = Op::Receive(ReceiveOp {
            fd,
            buffer,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_socket_close(
        &mut self,
        req: &mut AsyncSocketClose,
        fd: RawFd,
        cb: Cb<CloseResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let op = Op::SocketClose(SocketCloseOp { fd, cb: Some(cb) });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_file_read(
        &mut self,
        req: &mut AsyncFileRead,
        fd: RawFd,
        buffer: Vec<u8>,
        offset: u64,
        cb: Cb<FileReadResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        if buffer.is_empty() {
            return Err(Error::InvalidArgument("cannot read into an empty buffer"));
        }
        let op = Op::FileRead(FileReadOp {
            fd,
            buffer,
            offset,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_file_write(
        &mut self,
        req: &mut AsyncFileWrite,
        fd: RawFd,
        buffer: Vec<u8>,
        offset: u64,
        cb: Cb<FileWriteResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        if buffer.is_empty() {
            return Err(Error::InvalidArgument("cannot write an empty buffer"));
        }
        let op = Op::FileWrite(FileWriteOp {
            fd,
            buffer,
            offset,
            cb: Some(cb),
        });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn start_file_close(
        &mut self,
        req: &mut AsyncFileClose,
        fd: RawFd,
        cb: Cb<CloseResult>,
    ) -> Result<()> {
        self.begin_start(&req.reg)?;
        let op = Op::FileClose(FileCloseOp { fd, cb: Some(cb) });
        req.reg = Some(self.enroll(op, req.debug_name));
        Ok(())
    }

    pub(crate) fn stop_request(&mut self, reg: Option<Handle>) -> Result<()> {
        let handle = match reg {
            Some(handle) if self.handle_alive(Some(handle)) => handle,
            _ => return Err(Error::InvalidState),
        };
        let inner = self.inner.as_mut().unwrap();
        let idx = handle.idx;
        trace!(
            "stopping {} request{}",
            inner.slots[idx].kind_name(),
            inner.slots[idx]
                .debug_name
                .map(|n| format!(" '{}'", n))
                .unwrap_or_default()
        );
        match inner.slots[idx].state {
            State::Submitting => inner.release(idx),
            // A second stop is already on its way to Free
            State::Cancelling => {}
            State::Active => {
                let needs_backend = match &inner.slots[idx].op {
                    Op::Timeout(_) | Op::WakeUp(_) | Op::Work(_) | Op::ProcessExit(_) => false,
                    Op::FileRead(_) | Op::FileWrite(_) => inner.backend.supports_file_io(),
                    _ => true,
                };
                if needs_backend {
                    let disarm = {
                        let slot = &mut inner.slots[idx];
                        inner.backend.disarm(idx, slot)
                    };
                    match disarm {
                        Disarm::Done => inner.release(idx),
                        Disarm::Deferred => inner.slots[idx].state = State::Cancelling,
                    }
                } else {
                    inner.release(idx);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The iteration
    // -----------------------------------------------------------------------

    fn run_step(&mut self, no_wait: bool) -> Result<()> {
        if self.dispatching {
            return Err(Error::Busy);
        }
        if self.inner.is_none() {
            return Err(Error::NotInitialized);
        }
        self.inner.as_mut().unwrap().clock.snap();
        self.stage_submissions();

        // Phase 1, early edition: after-work callbacks already queued. If
        // any ran, this iteration must not block again.
        let dispatched_early = self.dispatch_pool_completions();
        if self.inner.is_none() {
            return Ok(());
        }

        loop {
            let timeout = {
                let inner = self.inner.as_ref().unwrap();
                if no_wait || dispatched_early || !inner.ready.is_empty() {
                    Some(Duration::ZERO)
                } else {
                    inner.earliest_deadline().map(|d| inner.clock.until(d))
                }
            };

            let mut filled = Vec::new();
            {
                let inner = self.inner.as_mut().unwrap();
                inner.backend.poll(timeout, &mut filled)?;
                inner.clock.snap();
            }

            let mut wake_fired = false;
            let mut child_fired = false;
            {
                let inner = self.inner.as_mut().unwrap();
                for event in filled {
                    match event {
                        Filled::Wake => wake_fired = true,
                        Filled::Child => child_fired = true,
                        Filled::Io {
                            fd,
                            readable,
                            writable,
                        } => {
                            let mut out = Vec::new();
                            inner
                                .backend
                                .on_ready(fd, readable, writable, &mut inner.slots, &mut out);
                            inner.ready.extend(out);
                        }
                        #[cfg(target_os = "linux")]
                        Filled::RingOp { idx, gen32, result } => {
                            if !inner.slots.valid(idx)
                                || (inner.slots[idx].generation & 0xffff_ffff) as u32 != gen32
                            {
                                continue; // Late completion for a recycled slot
                            }
                            let generation = inner.slots[idx].generation;
                            if inner.slots[idx].state == State::Cancelling {
                                // A cancel can race the accept itself; do
                                // not leak a client that connected anyway
                                if let Op::Accept(_) = inner.slots[idx].op {
                                    if result >= 0 {
                                        let _ = fd::close_raw(result);
                                    }
                                }
                                inner.ready.push_back((
                                    idx,
                                    generation,
                                    Outcome::Unit(Err(Error::Cancelled)),
                                ));
                                continue;
                            }
                            let outcome = {
                                let slot = &mut inner.slots[idx];
                                inner.backend.complete(idx, slot, result)
                            };
                            if let Some(outcome) = outcome {
                                inner.ready.push_back((idx, generation, outcome));
                            }
                        }
                    }
                }
            }

            if wake_fired {
                self.inner.as_ref().unwrap().channel.drain();
            }
            if child_fired {
                self.gather_children();
            }

            let due = self.collect_due_timers();
            let (has_ready, has_pool) = {
                let inner = self.inner.as_ref().unwrap();
                (
                    !inner.ready.is_empty(),
                    inner.pool.as_ref().map_or(false, Pool::has_completions),
                )
            };

            if due.is_empty()
                && !has_ready
                && !has_pool
                && !wake_fired
                && !no_wait
                && !dispatched_early
            {
                // The poll came back early with nothing (EINTR or a stale
                // internal event); recompute the deadline and go back in
                continue;
            }

            // Phase 1: after-work callbacks
            self.dispatch_pool_completions();
            if self.inner.is_none() {
                return Ok(());
            }
            // Phase 2: expired timers, earliest first
            for (idx, generation) in due {
                self.dispatch_timer(idx, generation);
                if self.inner.is_none() {
                    return Ok(());
                }
            }
            // Phase 3: I/O completions in backend order
            loop {
                let next = match self.inner.as_mut() {
                    Some(inner) => inner.ready.pop_front(),
                    None => return Ok(()),
                };
                match next {
                    Some((idx, generation, outcome)) => {
                        self.dispatch_completion(idx, generation, outcome)
                    }
                    None => break,
                }
            }
            // Phase 4: wake-ups
            if wake_fired {
                self.dispatch_wakeups();
            }
            return Ok(());
        }
    }

    fn stage_submissions(&mut self) {
        loop {
            let idx = {
                let inner = self.inner.as_mut().unwrap();
                inner.submissions.pop_front(&mut inner.slots)
            };
            match idx {
                Some(idx) => self.activate(idx),
                None => break,
            }
        }
    }

    /// Turn one staged (or reactivated) request into backend interest, a
    /// pool job, or a place on the timer/wake-up lists.
    fn activate(&mut self, idx: usize) {
        let desired_threads = if self.pool_threads == 0 {
            1
        } else {
            self.pool_threads
        };
        let inner = self.inner.as_mut().unwrap();
        inner.slots[idx].state = State::Active;
        let generation = inner.slots[idx].generation;

        enum Route {
            Timers,
            WakeUps,
            Backend,
            PoolWork,
            PoolRead,
            PoolWrite,
            Process,
        }
        let route = match &inner.slots[idx].op {
            Op::Timeout(_) => Route::Timers,
            Op::WakeUp(_) => Route::WakeUps,
            Op::Work(_) => Route::PoolWork,
            Op::ProcessExit(_) => Route::Process,
            Op::FileRead(_) => {
                if inner.backend.supports_file_io() {
                    Route::Backend
                } else {
                    Route::PoolRead
                }
            }
            Op::FileWrite(_) => {
                if inner.backend.supports_file_io() {
                    Route::Backend
                } else {
                    Route::PoolWrite
                }
            }
            _ => Route::Backend,
        };

        match route {
            Route::Timers => inner.timers.push_back(&mut inner.slots, idx),
            Route::WakeUps => inner.wakeups.push_back(&mut inner.slots, idx),
            Route::Backend => {
                let armed = {
                    let slot = &mut inner.slots[idx];
                    inner.backend.arm(idx, slot)
                };
                inner.active.push_back(&mut inner.slots, idx);
                if let Armed::Completed(outcome) = armed {
                    inner.ready.push_back((idx, generation, outcome));
                }
            }
            Route::PoolWork => {
                let work = match &mut inner.slots[idx].op {
                    Op::Work(op) => op.work.take().expect("work function present"),
                    _ => unreachable!(),
                };
                let handle = Handle {
                    idx,
                    generation,
                    loop_uid: inner.uid,
                };
                if inner.pool.is_none() {
                    inner.pool = Some(Pool::new(desired_threads, inner.channel.clone()));
                }
                inner.active.push_back(&mut inner.slots, idx);
                inner
                    .pool
                    .as_ref()
                    .unwrap()
                    .submit(handle, PoolJob::Work(work));
            }
            Route::PoolRead | Route::PoolWrite => {
                let job = match &mut inner.slots[idx].op {
                    Op::FileRead(op) => PoolJob::Read {
                        fd: op.fd,
                        buffer: std::mem::take(&mut op.buffer),
                        offset: op.offset,
                    },
                    Op::FileWrite(op) => PoolJob::Write {
                        fd: op.fd,
                        buffer: std::mem::take(&mut op.buffer),
                        offset: op.offset,
                    },
                    _ => unreachable!(),
                };
                let handle = Handle {
                    idx,
                    generation,
                    loop_uid: inner.uid,
                };
                if inner.pool.is_none() {
                    inner.pool = Some(Pool::new(desired_threads, inner.channel.clone()));
                }
                inner.active.push_back(&mut inner.slots, idx);
                inner.pool.as_ref().unwrap().submit(handle, job);
            }
            Route::Process => {
                inner.active.push_back(&mut inner.slots, idx);
                self.watch_process(idx, generation);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn watch_process(&mut self, idx: usize, generation: u64) {
        let inner = self.inner.as_mut().unwrap();
        let pid = match &inner.slots[idx].op {
            Op::ProcessExit(op) => op.pid,
            _ => unreachable!(),
        };
        // The child may be a zombie already; reap it on the spot
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                inner
                    .ready
                    .push_back((idx, generation, Outcome::Exit(Ok(code))));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                inner
                    .ready
                    .push_back((idx, generation, Outcome::Exit(Ok(128 + signal as i32))));
            }
            Ok(_) => {
                // Still running; let the signalfd tell us
                match inner.ensure_signal_watch() {
                    Ok(()) => {
                        inner.processes.insert(pid, idx);
                    }
                    Err(e) => {
                        inner
                            .ready
                            .push_back((idx, generation, Outcome::Exit(Err(e))));
                    }
                }
            }
            Err(e) => {
                inner.ready.push_back((
                    idx,
                    generation,
                    Outcome::Exit(Err(Error::Backend {
                        op: "waitpid",
                        source: std::io::Error::from_raw_os_error(e as i32),
                    })),
                ));
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn watch_process(&mut self, idx: usize, generation: u64) {
        let inner = self.inner.as_mut().unwrap();
        inner.ready.push_back((
            idx,
            generation,
            Outcome::Exit(Err(Error::InvalidArgument(
                "child-exit notifications are only wired up on Linux",
            ))),
        ));
    }

    #[cfg(target_os = "linux")]
    fn gather_children(&mut self) {
        let inner = self.inner.as_mut().unwrap();
        // Drain the signalfd so its edge re-arms
        if let Some(sfd) = &inner.signal_fd {
            let mut buf = [0u8; std::mem::size_of::<libc::signalfd_siginfo>()];
            loop {
                let n = unsafe {
                    libc::read(
                        sfd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n <= 0 {
                    break;
                }
            }
        }
        // Reap every terminated child; statuses nobody registered for are
        // discarded
        while !inner.processes.is_empty() {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => inner.complete_child(pid.as_raw(), code),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    inner.complete_child(pid.as_raw(), 128 + signal as i32)
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        if !inner.processes.is_empty() {
            if let Some(sfd) = &inner.signal_fd {
                let fd = sfd.as_raw_fd();
                let _ = inner.backend.rearm_signal_watch(fd);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn gather_children(&mut self) {}

    fn collect_due_timers(&self) -> Vec<(usize, u64)> {
        let inner = self.inner.as_ref().unwrap();
        let now = inner.clock.now();
        let mut due: Vec<(usize, u64, Instant)> = Vec::new();
        for idx in inner.timers.indices(&inner.slots) {
            if let Op::Timeout(op) = &inner.slots[idx].op {
                if op.deadline <= now {
                    due.push((idx, inner.slots[idx].generation, op.deadline));
                }
            }
        }
        // Deadline order; the sort is stable so ties keep insertion order
        due.sort_by_key(|&(_, _, deadline)| deadline);
        due.into_iter().map(|(idx, gen, _)| (idx, gen)).collect()
    }

    /// Phase 1: drain the pool's completion queue. Returns whether anything
    /// was dispatched.
    fn dispatch_pool_completions(&mut self) -> bool {
        let mut any = false;
        loop {
            let completion = match &self.inner {
                Some(inner) => inner.pool.as_ref().and_then(Pool::pop_completion),
                None => return any,
            };
            let completion = match completion {
                Some(c) => c,
                None => return any,
            };
            if !self.handle_alive(Some(completion.handle)) {
                // The request was stopped while the job ran; the work is
                // done but the callback is suppressed
                trace!("dropping stale pool completion");
                continue;
            }
            let idx = completion.handle.idx;
            let generation = completion.handle.generation;
            let outcome = {
                let inner = self.inner.as_mut().unwrap();
                match (completion.payload, &mut inner.slots[idx].op) {
                    (PoolPayload::Work { work, result }, Op::Work(op)) => {
                        op.work = Some(work);
                        Outcome::Unit(result)
                    }
                    (PoolPayload::Read { buffer, result }, Op::FileRead(op)) => {
                        op.buffer = buffer;
                        Outcome::Bytes(result)
                    }
                    (PoolPayload::Write { buffer, result }, Op::FileWrite(op)) => {
                        op.buffer = buffer;
                        Outcome::Bytes(result)
                    }
                    _ => unreachable!("pool payload does not match its slot"),
                }
            };
            self.dispatch_completion(idx, generation, outcome);
            any = true;
        }
    }

    /// Phase 2: one expired timer.
    fn dispatch_timer(&mut self, idx: usize, generation: u64) {
        if !self.slot_live(idx, generation) {
            return;
        }
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            inner.detach(idx);
            let op = match &mut inner.slots[idx].op {
                Op::Timeout(op) => op,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("timer callback present"),
                TimeoutResult {
                    relative: op.relative,
                    reactivate: false,
                },
            )
        };
        // Reactivation deadlines count from callback entry
        let entered = Instant::now();
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        let inner = self.inner.as_mut().unwrap();
        let op = match &mut inner.slots[idx].op {
            Op::Timeout(op) => op,
            _ => unreachable!(),
        };
        op.cb = Some(cb);
        if res.reactivate {
            op.relative = res.relative;
            op.deadline = entered + res.relative;
            inner.timers.push_back(&mut inner.slots, idx);
        } else {
            inner.release(idx);
        }
    }

    /// Phase 4: wake-up requests whose pending flag was raised.
    fn dispatch_wakeups(&mut self) {
        let pending: Vec<(usize, u64)> = {
            let inner = self.inner.as_ref().unwrap();
            inner
                .wakeups
                .indices(&inner.slots)
                .into_iter()
                .filter_map(|idx| match &inner.slots[idx].op {
                    Op::WakeUp(op) => {
                        if op.shared.pending.swap(false, Ordering::SeqCst) {
                            Some((idx, inner.slots[idx].generation))
                        } else {
                            None
                        }
                    }
                    _ => None,
                })
                .collect()
        };
        for (idx, generation) in pending {
            self.dispatch_wakeup(idx, generation);
            if self.inner.is_none() {
                return;
            }
        }
    }

    fn dispatch_wakeup(&mut self, idx: usize, generation: u64) {
        if !self.slot_live(idx, generation) {
            return;
        }
        let (mut cb, event, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            inner.detach(idx);
            let op = match &mut inner.slots[idx].op {
                Op::WakeUp(op) => op,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("wake-up callback present"),
                op.event.clone(),
                WakeUpResult { reactivate: false },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        // The posting thread may be blocked on this; fire it once the user
        // callback has fully run
        if let Some(event) = &event {
            event.signal();
        }
        if !self.slot_live(idx, generation) {
            return;
        }
        let inner = self.inner.as_mut().unwrap();
        let op = match &mut inner.slots[idx].op {
            Op::WakeUp(op) => op,
            _ => unreachable!(),
        };
        op.cb = Some(cb);
        if res.reactivate {
            inner.wakeups.push_back(&mut inner.slots, idx);
        } else {
            inner.release(idx);
        }
    }

    /// Phases 1 and 3: dispatch one folded completion to its callback.
    fn dispatch_completion(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            if inner.slots[idx].state == State::Cancelling {
                // The backend confirmed the cancellation; no callback
                inner.release(idx);
                return;
            }
            inner.detach(idx);
        }
        let kind = {
            let inner = self.inner.as_ref().unwrap();
            kind_of(&inner.slots[idx].op)
        };
        match kind {
            Kind::Work => self.finish_work(idx, generation, outcome),
            Kind::ProcessExit => self.finish_process_exit(idx, generation, outcome),
            Kind::Accept => self.finish_accept(idx, generation, outcome),
            Kind::Connect => self.finish_connect(idx, generation, outcome),
            Kind::Send => self.finish_send(idx, generation, outcome),
            Kind::Receive => self.finish_receive(idx, generation, outcome),
            Kind::SocketClose | Kind::FileClose => self.finish_close(idx, generation, outcome),
            Kind::FileRead => self.finish_file_read(idx, generation, outcome),
            Kind::FileWrite => self.finish_file_write(idx, generation, outcome),
            Kind::Timeout | Kind::WakeUp => {
                unreachable!("timers and wake-ups have their own dispatch phases")
            }
        }
    }

    fn invoke<F: FnOnce(&mut EventLoop)>(&mut self, f: F) {
        self.dispatching = true;
        f(self);
        self.dispatching = false;
    }

    fn slot_live(&self, idx: usize, generation: u64) -> bool {
        match &self.inner {
            Some(inner) => inner.slots.valid(idx) && inner.slots[idx].generation == generation,
            None => false,
        }
    }

    /// Re-arm a reactivated request, guarding buffer kinds against a buffer
    /// the callback took away.
    fn reactivate(&mut self, idx: usize, generation: u64) {
        let empty_buffer = {
            let inner = self.inner.as_ref().unwrap();
            match &inner.slots[idx].op {
                Op::Send(op) => op.buffer.is_empty(),
                Op::Receive(op) => op.buffer.is_empty(),
                Op::FileRead(op) => op.buffer.is_empty(),
                Op::FileWrite(op) => op.buffer.is_empty(),
                _ => false,
            }
        };
        if empty_buffer {
            let inner = self.inner.as_mut().unwrap();
            let outcome = match &inner.slots[idx].op {
                Op::Send(_) | Op::FileWrite(_) => {
                    Outcome::Unit(Err(Error::InvalidArgument("buffer was taken")))
                }
                _ => Outcome::Bytes(Err(Error::InvalidArgument("buffer was taken"))),
            };
            inner.active.push_back(&mut inner.slots, idx);
            inner.ready.push_back((idx, generation, outcome));
            return;
        }
        self.activate(idx);
    }

    fn finish_work(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::Work(op) => op,
                _ => unreachable!(),
            };
            let outcome = match outcome {
                Outcome::Unit(r) => r,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("work callback present"),
                WorkResult {
                    outcome,
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::Work(op) => op.cb = Some(cb),
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_process_exit(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::ProcessExit(op) => op,
                _ => unreachable!(),
            };
            let status = match outcome {
                Outcome::Exit(r) => r,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("process-exit callback present"),
                ProcessExitResult {
                    status,
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::ProcessExit(op) => op.cb = Some(cb),
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_accept(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::Accept(op) => op,
                _ => unreachable!(),
            };
            let accepted = match outcome {
                Outcome::Accepted(r) => r,
                Outcome::Bytes(Err(e)) => Err(e),
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("accept callback present"),
                AcceptResult {
                    accepted: Some(accepted),
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::Accept(op) => op.cb = Some(cb),
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_connect(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::Connect(op) => op,
                _ => unreachable!(),
            };
            op.raw_addr = None;
            let outcome = match outcome {
                Outcome::Unit(r) => r,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("connect callback present"),
                ConnectResult {
                    outcome,
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::Connect(op) => op.cb = Some(cb),
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_send(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::Send(op) => op,
                _ => unreachable!(),
            };
            let outcome = match outcome {
                Outcome::Unit(r) => r,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("send callback present"),
                SendResult {
                    outcome,
                    buffer: std::mem::take(&mut op.buffer),
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::Send(op) => {
                    op.cb = Some(cb);
                    op.buffer = std::mem::take(&mut res.buffer);
                    op.sent = 0;
                }
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_receive(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::Receive(op) => op,
                _ => unreachable!(),
            };
            let outcome = match outcome {
                Outcome::Bytes(r) => r,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("receive callback present"),
                ReceiveResult {
                    outcome,
                    buffer: std::mem::take(&mut op.buffer),
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::Receive(op) => {
                    op.cb = Some(cb);
                    op.buffer = std::mem::take(&mut res.buffer);
                }
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_close(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let cb = match &mut inner.slots[idx].op {
                Op::SocketClose(op) => op.cb.take(),
                Op::FileClose(op) => op.cb.take(),
                _ => unreachable!(),
            };
            let outcome = match outcome {
                Outcome::Unit(r) => r,
                _ => unreachable!(),
            };
            (
                cb.expect("close callback present"),
                CloseResult {
                    outcome,
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::SocketClose(op) => op.cb = Some(cb),
                Op::FileClose(op) => op.cb = Some(cb),
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_file_read(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::FileRead(op) => op,
                _ => unreachable!(),
            };
            let outcome = match outcome {
                Outcome::Bytes(r) => r,
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("file-read callback present"),
                FileReadResult {
                    outcome,
                    buffer: std::mem::take(&mut op.buffer),
                    offset: op.offset,
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::FileRead(op) => {
                    op.cb = Some(cb);
                    op.buffer = std::mem::take(&mut res.buffer);
                    // The offset is caller-managed, through the result
                    op.offset = res.offset;
                }
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }

    fn finish_file_write(&mut self, idx: usize, generation: u64, outcome: Outcome) {
        let (mut cb, mut res) = {
            let inner = self.inner.as_mut().unwrap();
            let op = match &mut inner.slots[idx].op {
                Op::FileWrite(op) => op,
                _ => unreachable!(),
            };
            let outcome = match outcome {
                Outcome::Bytes(r) => r,
                Outcome::Unit(Err(e)) => Err(e),
                _ => unreachable!(),
            };
            (
                op.cb.take().expect("file-write callback present"),
                FileWriteResult {
                    outcome,
                    buffer: std::mem::take(&mut op.buffer),
                    offset: op.offset,
                    reactivate: false,
                },
            )
        };
        self.invoke(|el| cb(el, &mut res));
        if !self.slot_live(idx, generation) {
            return;
        }
        {
            let inner = self.inner.as_mut().unwrap();
            match &mut inner.slots[idx].op {
                Op::FileWrite(op) => {
                    op.cb = Some(cb);
                    op.buffer = std::mem::take(&mut res.buffer);
                    op.offset = res.offset;
                }
                _ => unreachable!(),
            }
        }
        if res.reactivate {
            self.reactivate(idx, generation);
        } else {
            self.inner.as_mut().unwrap().release(idx);
        }
    }
}

#[cfg(target_os = "linux")]
impl Inner {
    fn ensure_signal_watch(&mut self) -> Result<()> {
        if self.signal_fd.is_some() {
            return Ok(());
        }
        let sfd = create_sigchld_fd()?;
        self.backend.watch_signal_fd(sfd.as_raw_fd())?;
        self.signal_fd = Some(sfd);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn sigchld_set() -> libc::sigset_t {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGCHLD);
        mask
    }
}

#[cfg(target_os = "linux")]
fn block_sigchld() -> Result<()> {
    let mask = sigchld_set();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Error::Backend {
            op: "pthread_sigmask",
            source: std::io::Error::from_raw_os_error(rc),
        });
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn create_sigchld_fd() -> Result<OwnedFd> {
    let mask = sigchld_set();
    let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os("signalfd"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
