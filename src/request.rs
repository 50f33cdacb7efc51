//! The request model: caller-owned request objects, their in-loop slots, and
//! the per-kind result types handed to completion callbacks.
//!
//! A request object (say [`AsyncTimeout`]) is a small caller-owned value. On
//! `start` its parameters, callback and buffers move into a slot inside the
//! loop's arena and the object keeps a generation-stamped [`Handle`] to it.
//! When the slot is released (completion without reactivation, `stop`, or
//! loop `close`) the handle goes stale, which is exactly the Free state: the
//! object can be started again, and starting it while the slot still lives
//! fails with `InvalidState`.
//!
//! Buffers are `Vec<u8>` moved in at `start`; the result object lends them
//! back to the callback (or gives them away through `take_buffer`).

use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chain::{Linked, Links};
use crate::core::EventLoop;
use crate::error::{Error, Result};
use crate::fd::SockAddr;
use crate::wake::{EventSignal, WakeChannel};

/// Identifies a live slot inside one particular loop incarnation.
///
/// The generation makes index reuse detectable, the loop uid makes a handle
/// from a closed-and-recreated loop (or a different loop) stale rather than
/// dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handle {
    pub idx: usize,
    pub generation: u64,
    pub loop_uid: u64,
}

/// Lifecycle of a non-Free request. Free itself has no slot to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// On the submission queue, not yet staged to the backend.
    Submitting,
    /// Armed with the backend (or parked on a timer/wake-up list).
    Active,
    /// Stopped, waiting for the backend to confirm the cancellation.
    Cancelling,
}

/// A request's in-loop incarnation.
pub(crate) struct Slot {
    pub links: Links,
    pub generation: u64,
    pub state: State,
    pub debug_name: Option<&'static str>,
    pub op: Op,
}

impl Linked for Slot {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl Slot {
    pub fn kind_name(&self) -> &'static str {
        self.op.kind_name()
    }
}

/// A completion callback. It runs on the loop thread and may freely start
/// and stop requests on the loop it is handed.
pub(crate) type Cb<R> = Box<dyn FnMut(&mut EventLoop, &mut R)>;

/// A worker-pool work function. `FnMut` so reactivation can run it again.
pub(crate) type WorkFn = Box<dyn FnMut() -> Result<()> + Send>;

/// State shared between a started wake-up request and foreign threads.
pub(crate) struct WakeUpShared {
    pub pending: AtomicBool,
    pub channel: WakeChannel,
}

pub(crate) struct TimeoutOp {
    pub relative: Duration,
    pub deadline: Instant,
    pub cb: Option<Cb<TimeoutResult>>,
}

pub(crate) struct WakeUpOp {
    pub shared: Arc<WakeUpShared>,
    pub event: Option<EventSignal>,
    pub cb: Option<Cb<WakeUpResult>>,
}

pub(crate) struct WorkOp {
    /// Taken while the job sits on a pool thread, put back on completion.
    pub work: Option<WorkFn>,
    pub cb: Option<Cb<WorkResult>>,
}

pub(crate) struct ProcessExitOp {
    pub pid: i32,
    pub cb: Option<Cb<ProcessExitResult>>,
}

pub(crate) struct AcceptOp {
    pub fd: RawFd,
    pub cb: Option<Cb<AcceptResult>>,
}

pub(crate) struct ConnectOp {
    pub fd: RawFd,
    pub addr: SocketAddr,
    /// Raw form parked here so the ring can reference it until the CQE.
    pub raw_addr: Option<Box<SockAddr>>,
    pub cb: Option<Cb<ConnectResult>>,
}

pub(crate) struct SendOp {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    /// Bytes the kernel accepted so far; completion fires at buffer length.
    pub sent: usize,
    pub cb: Option<Cb<SendResult>>,
}

pub(crate) struct ReceiveOp {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    pub cb: Option<Cb<ReceiveResult>>,
}

pub(crate) struct SocketCloseOp {
    pub fd: RawFd,
    pub cb: Option<Cb<CloseResult>>,
}

pub(crate) struct FileReadOp {
    pub fd: RawFd,
    /// Taken while a pool thread owns the I/O, put back on completion.
    pub buffer: Vec<u8>,
    pub offset: u64,
    pub cb: Option<Cb<FileReadResult>>,
}

pub(crate) struct FileWriteOp {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    pub offset: u64,
    pub cb: Option<Cb<FileWriteResult>>,
}

pub(crate) struct FileCloseOp {
    pub fd: RawFd,
    pub cb: Option<Cb<CloseResult>>,
}

/// The tagged union over everything the loop knows how to run.
pub(crate) enum Op {
    Timeout(TimeoutOp),
    WakeUp(WakeUpOp),
    Work(WorkOp),
    ProcessExit(ProcessExitOp),
    Accept(AcceptOp),
    Connect(ConnectOp),
    Send(SendOp),
    Receive(ReceiveOp),
    SocketClose(SocketCloseOp),
    FileRead(FileReadOp),
    FileWrite(FileWriteOp),
    FileClose(FileCloseOp),
}

impl Op {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Op::Timeout(_) => "timeout",
            Op::WakeUp(_) => "wake-up",
            Op::Work(_) => "work",
            Op::ProcessExit(_) => "process-exit",
            Op::Accept(_) => "accept",
            Op::Connect(_) => "connect",
            Op::Send(_) => "send",
            Op::Receive(_) => "receive",
            Op::SocketClose(_) => "socket-close",
            Op::FileRead(_) => "file-read",
            Op::FileWrite(_) => "file-write",
            Op::FileClose(_) => "file-close",
        }
    }
}

/// A completion folded down to its final value, queued for dispatch.
pub(crate) enum Outcome {
    /// Connect, send, closes, work: success or an error.
    Unit(Result<()>),
    /// Accept: the connected client, ownership moving towards the caller.
    Accepted(Result<OwnedFd>),
    /// Receive and positional file I/O: bytes transferred.
    Bytes(Result<usize>),
    /// Process exit status.
    Exit(Result<i32>),
}

// ---------------------------------------------------------------------------
// Result objects
// ---------------------------------------------------------------------------

macro_rules! reactivation {
    () => {
        /// Ask the loop to re-arm this request instead of releasing it.
        ///
        /// Read after the callback returns; calling it multiple times keeps
        /// the last value.
        pub fn reactivate_request(&mut self, reactivate: bool) {
            self.reactivate = reactivate;
        }
    };
}

/// Result of an [`AsyncTimeout`] firing.
pub struct TimeoutResult {
    pub(crate) relative: Duration,
    pub(crate) reactivate: bool,
}

impl TimeoutResult {
    /// The relative timeout the request was started (or last reactivated)
    /// with.
    pub fn relative_timeout(&self) -> Duration {
        self.relative
    }

    /// Rewrite the relative timeout used if this request reactivates. The
    /// new deadline is computed from the time the callback was entered.
    pub fn relative_timeout_set(&mut self, relative: Duration) {
        self.relative = relative;
    }

    reactivation!();
}

/// Result of an [`AsyncWakeUp`] being woken.
pub struct WakeUpResult {
    pub(crate) reactivate: bool,
}

impl WakeUpResult {
    reactivation!();
}

/// Result of an [`AsyncWork`] after-work callback.
pub struct WorkResult {
    pub(crate) outcome: Result<()>,
    pub(crate) reactivate: bool,
}

impl WorkResult {
    /// Did the work function succeed?
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn get(&self) -> std::result::Result<(), &Error> {
        self.outcome.as_ref().map(|_| ())
    }

    reactivation!();
}

/// Result of an [`AsyncProcessExit`]: the child's exit status.
pub struct ProcessExitResult {
    pub(crate) status: Result<i32>,
    pub(crate) reactivate: bool,
}

impl ProcessExitResult {
    pub fn is_valid(&self) -> bool {
        self.status.is_ok()
    }

    /// The exit status: the code passed to `exit`, or `128 + signal` when
    /// the child was killed by a signal.
    pub fn get(&self) -> std::result::Result<i32, &Error> {
        self.status.as_ref().copied()
    }

    reactivation!();
}

/// Result of an [`AsyncAccept`]: the connected client socket.
pub struct AcceptResult {
    pub(crate) accepted: Option<Result<OwnedFd>>,
    pub(crate) reactivate: bool,
}

impl AcceptResult {
    pub fn is_valid(&self) -> bool {
        matches!(self.accepted, Some(Ok(_)))
    }

    /// Move the accepted socket out. The caller owns it from here on; a
    /// second call reports `InvalidState`.
    pub fn take_socket(&mut self) -> Result<OwnedFd> {
        self.accepted.take().unwrap_or(Err(Error::InvalidState))
    }

    reactivation!();
}

/// Result of an [`AsyncConnect`] handshake.
pub struct ConnectResult {
    pub(crate) outcome: Result<()>,
    pub(crate) reactivate: bool,
}

impl ConnectResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn get(&self) -> std::result::Result<(), &Error> {
        self.outcome.as_ref().map(|_| ())
    }

    reactivation!();
}

/// Result of an [`AsyncSend`]: the whole buffer was accepted, or an error.
pub struct SendResult {
    pub(crate) outcome: Result<()>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) reactivate: bool,
}

impl SendResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn get(&self) -> std::result::Result<(), &Error> {
        self.outcome.as_ref().map(|_| ())
    }

    /// Take the buffer back. Reactivating afterwards fails for want of
    /// bytes to send.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    reactivation!();
}

/// Result of an [`AsyncReceive`].
pub struct ReceiveResult {
    pub(crate) outcome: Result<usize>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) reactivate: bool,
}

impl ReceiveResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The filled prefix of the buffer. `None` if the receive failed.
    pub fn data(&self) -> Option<&[u8]> {
        match self.outcome {
            Ok(n) => Some(&self.buffer[..n]),
            Err(_) => None,
        }
    }

    pub fn bytes(&self) -> std::result::Result<usize, &Error> {
        self.outcome.as_ref().copied()
    }

    /// A successful zero-length receive: the peer shut the stream down.
    pub fn peer_closed(&self) -> bool {
        matches!(self.outcome, Ok(0))
    }

    /// Take the buffer back. Reactivating afterwards fails for want of a
    /// place to receive into.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    reactivation!();
}

/// Result of an [`AsyncSocketClose`] or [`AsyncFileClose`].
pub struct CloseResult {
    pub(crate) outcome: Result<()>,
    pub(crate) reactivate: bool,
}

impl CloseResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn get(&self) -> std::result::Result<(), &Error> {
        self.outcome.as_ref().map(|_| ())
    }

    reactivation!();
}

/// Result of an [`AsyncFileRead`].
pub struct FileReadResult {
    pub(crate) outcome: Result<usize>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) offset: u64,
    pub(crate) reactivate: bool,
}

impl FileReadResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The bytes read into the start of the buffer. `None` on error.
    pub fn data(&self) -> Option<&[u8]> {
        match self.outcome {
            Ok(n) => Some(&self.buffer[..n]),
            Err(_) => None,
        }
    }

    pub fn bytes(&self) -> std::result::Result<usize, &Error> {
        self.outcome.as_ref().copied()
    }

    /// A successful zero-length read: end of file.
    pub fn end_of_file(&self) -> bool {
        matches!(self.outcome, Ok(0))
    }

    /// The request's file offset. It is caller-managed: reading does not
    /// advance it, reactivating without changing it reads the same bytes
    /// again.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn offset_set(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    reactivation!();
}

/// Result of an [`AsyncFileWrite`].
pub struct FileWriteResult {
    pub(crate) outcome: Result<usize>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) offset: u64,
    pub(crate) reactivate: bool,
}

impl FileWriteResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    /// How many bytes were written at the request's offset.
    pub fn written(&self) -> std::result::Result<usize, &Error> {
        self.outcome.as_ref().copied()
    }

    /// Caller-managed file offset, same rules as for reads.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn offset_set(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    reactivation!();
}

// ---------------------------------------------------------------------------
// Caller-owned request objects
// ---------------------------------------------------------------------------

macro_rules! request_common {
    () => {
        /// Cancel the request.
        ///
        /// If it is still submitting it is pulled from the submission queue;
        /// if it is active the backend is told to disarm it. Either way the
        /// callback will not run. Stopping a request that is not in flight
        /// reports `InvalidState`.
        pub fn stop(&mut self, event_loop: &mut EventLoop) -> Result<()> {
            event_loop.stop_request(self.reg.take())
        }

        /// Attach a name shown in trace logs for this request.
        pub fn debug_name_set(&mut self, name: &'static str) {
            self.debug_name = Some(name);
        }

        /// Is the request currently in flight on the given loop?
        pub fn is_in_flight(&self, event_loop: &EventLoop) -> bool {
            event_loop.handle_alive(self.reg)
        }
    };
}

/// A one-shot timer. Fires once at `now + relative`; the callback may
/// reactivate it, optionally rewriting the relative timeout first.
#[derive(Default)]
pub struct AsyncTimeout {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncTimeout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &mut self,
        event_loop: &mut EventLoop,
        relative: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut TimeoutResult) + 'static,
    {
        event_loop.start_timeout(self, relative, Box::new(callback))
    }

    request_common!();
}

/// A wake-up slot other threads can trigger.
///
/// After `start`, [`wake_up`](AsyncWakeUp::wake_up) may be called from any
/// thread, any number of times; the callback runs once per loop iteration
/// that observes the (coalesced) signal.
#[derive(Default)]
pub struct AsyncWakeUp {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
    pub(crate) shared: Option<Arc<WakeUpShared>>,
}

impl AsyncWakeUp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start without an event object.
    pub fn start<F>(&mut self, event_loop: &mut EventLoop, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut WakeUpResult) + 'static,
    {
        event_loop.start_wake_up(self, None, Box::new(callback))
    }

    /// Start with an [`EventSignal`] the loop fires after the callback
    /// returns, so the waking thread can await full processing.
    pub fn start_with_event<F>(
        &mut self,
        event_loop: &mut EventLoop,
        event: EventSignal,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut WakeUpResult) + 'static,
    {
        event_loop.start_wake_up(self, Some(event), Box::new(callback))
    }

    /// Wake the loop and schedule this request's callback. Callable from any
    /// thread. Multiple calls between two loop iterations fire the callback
    /// once.
    pub fn wake_up(&self) -> Result<()> {
        let shared = self.shared.as_ref().ok_or(Error::InvalidState)?;
        // Flag first, then kick the channel, so the loop is guaranteed to
        // see the flag once the wake-up arrives
        shared.pending.store(true, std::sync::atomic::Ordering::SeqCst);
        shared.channel.signal()
    }

    request_common!();
}

/// Blocking work shipped to the worker pool; the after-work callback runs
/// back on the loop thread.
#[derive(Default)]
pub struct AsyncWork {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<W, F>(&mut self, event_loop: &mut EventLoop, work: W, callback: F) -> Result<()>
    where
        W: FnMut() -> Result<()> + Send + 'static,
        F: FnMut(&mut EventLoop, &mut WorkResult) + 'static,
    {
        event_loop.start_work(self, Box::new(work), Box::new(callback))
    }

    request_common!();
}

/// Completion when a child process exits.
#[derive(Default)]
pub struct AsyncProcessExit {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncProcessExit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the child with the given pid. The child must have been spawned
    /// by this process (the status is collected with `waitpid`).
    pub fn start<F>(&mut self, event_loop: &mut EventLoop, pid: i32, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut ProcessExitResult) + 'static,
    {
        event_loop.start_process_exit(self, pid, Box::new(callback))
    }

    request_common!();
}

/// Accept one client on a listening socket; reactivate to keep accepting.
#[derive(Default)]
pub struct AsyncAccept {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncAccept {
    pub fn new() -> Self {
        Self::default()
    }

    /// The listener stays owned by the caller and must outlive the request's
    /// in-flight interval.
    pub fn start<F>(&mut self, event_loop: &mut EventLoop, listener: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut AcceptResult) + 'static,
    {
        event_loop.start_accept(self, listener, Box::new(callback))
    }

    request_common!();
}

/// Connect a (non-blocking) socket; completes when the handshake finishes.
#[derive(Default)]
pub struct AsyncConnect {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncConnect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &mut self,
        event_loop: &mut EventLoop,
        socket: RawFd,
        addr: SocketAddr,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut ConnectResult) + 'static,
    {
        event_loop.start_connect(self, socket, addr, Box::new(callback))
    }

    request_common!();
}

/// Send a whole buffer; completes only when every byte was accepted by the
/// kernel (partial progress is carried across readiness rounds).
#[derive(Default)]
pub struct AsyncSend {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncSend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &mut self,
        event_loop: &mut EventLoop,
        socket: RawFd,
        buffer: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut SendResult) + 'static,
    {
        event_loop.start_send(self, socket, buffer, Box::new(callback))
    }

    request_common!();
}

/// Receive into a buffer; a zero-length completion means the peer closed.
#[derive(Default)]
pub struct AsyncReceive {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncReceive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &mut self,
        event_loop: &mut EventLoop,
        socket: RawFd,
        buffer: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut ReceiveResult) + 'static,
    {
        event_loop.start_receive(self, socket, buffer, Box::new(callback))
    }

    request_common!();
}

/// Close a socket asynchronously. Ownership of the handle moves into the
/// request.
#[derive(Default)]
pub struct AsyncSocketClose {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncSocketClose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(&mut self, event_loop: &mut EventLoop, socket: OwnedFd, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut CloseResult) + 'static,
    {
        event_loop.start_socket_close(self, socket.into_raw_fd(), Box::new(callback))
    }

    request_common!();
}

/// Positional file read at the request's caller-managed `offset`.
///
/// On the readiness backend regular files cannot be polled, so the read runs
/// on the worker pool; the ring backend submits it natively.
#[derive(Default)]
pub struct AsyncFileRead {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncFileRead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &mut self,
        event_loop: &mut EventLoop,
        file: RawFd,
        buffer: Vec<u8>,
        offset: u64,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut FileReadResult) + 'static,
    {
        event_loop.start_file_read(self, file, buffer, offset, Box::new(callback))
    }

    request_common!();
}

/// Positional file write, same routing rules as [`AsyncFileRead`].
#[derive(Default)]
pub struct AsyncFileWrite {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncFileWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &mut self,
        event_loop: &mut EventLoop,
        file: RawFd,
        buffer: Vec<u8>,
        offset: u64,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut FileWriteResult) + 'static,
    {
        event_loop.start_file_write(self, file, buffer, offset, Box::new(callback))
    }

    request_common!();
}

/// Close a file descriptor asynchronously. Ownership moves into the request.
#[derive(Default)]
pub struct AsyncFileClose {
    pub(crate) reg: Option<Handle>,
    pub(crate) debug_name: Option<&'static str>,
}

impl AsyncFileClose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(&mut self, event_loop: &mut EventLoop, file: OwnedFd, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &mut CloseResult) + 'static,
    {
        event_loop.start_file_close(self, file.into_raw_fd(), Box::new(callback))
    }

    request_common!();
}
