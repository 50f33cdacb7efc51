//! The worker pool: blocking work executed off the loop thread.
//!
//! Three kinds of jobs land here: user work functions (`AsyncWork`) and
//! positional file reads/writes on backends that cannot do regular-file I/O
//! asynchronously. A finished job pushes its payload (including whatever it
//! borrowed from the request's slot) onto a mutex-protected completion
//! queue and kicks the wake channel; the loop drains the queue each
//! iteration and dispatches the after-work callbacks on its own thread.
//!
//! Cancellation never interrupts a running job: the loop just releases the
//! slot and the stale completion is dropped by its generation check.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use log::trace;
use threadpool::ThreadPool;

use crate::error::{Error, Result};
use crate::request::{Handle, WorkFn};
use crate::wake::WakeChannel;

/// What a pool thread is asked to do.
pub(crate) enum PoolJob {
    Work(WorkFn),
    Read {
        fd: RawFd,
        buffer: Vec<u8>,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buffer: Vec<u8>,
        offset: u64,
    },
}

/// What comes back, with the borrowed pieces returned for the slot.
pub(crate) enum PoolPayload {
    Work {
        work: WorkFn,
        result: Result<()>,
    },
    Read {
        buffer: Vec<u8>,
        result: Result<usize>,
    },
    Write {
        buffer: Vec<u8>,
        result: Result<usize>,
    },
}

pub(crate) struct PoolCompletion {
    pub handle: Handle,
    pub payload: PoolPayload,
}

pub(crate) struct Pool {
    threads: ThreadPool,
    queue: Arc<Mutex<VecDeque<PoolCompletion>>>,
    channel: WakeChannel,
}

impl Pool {
    pub fn new(threads: usize, channel: WakeChannel) -> Pool {
        Pool {
            threads: ThreadPool::new(threads.max(1)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            channel,
        }
    }

    /// Raising takes effect immediately; lowering waits for running jobs.
    pub fn thread_count_set(&mut self, threads: usize) {
        self.threads.set_num_threads(threads.max(1));
    }

    pub fn submit(&self, handle: Handle, job: PoolJob) {
        let queue = self.queue.clone();
        let channel = self.channel.clone();
        self.threads.execute(move || {
            let payload = run_job(job);
            queue.lock().unwrap().push_back(PoolCompletion { handle, payload });
            // The loop may be gone already; nobody is left to tell
            let _ = channel.signal();
        });
        trace!("pool job submitted for slot {}", handle.idx);
    }

    pub fn pop_completion(&self) -> Option<PoolCompletion> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn has_completions(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }
}

fn run_job(job: PoolJob) -> PoolPayload {
    match job {
        PoolJob::Work(mut work) => {
            let result = work();
            PoolPayload::Work { work, result }
        }
        PoolJob::Read { fd, mut buffer, offset } => {
            let result = pread_all(fd, &mut buffer, offset);
            PoolPayload::Read { buffer, result }
        }
        PoolJob::Write { fd, buffer, offset } => {
            let result = pwrite_all(fd, &buffer, offset);
            PoolPayload::Write { buffer, result }
        }
    }
}

/// One positional read. Short reads are fine (the caller sees the count),
/// only EINTR is retried.
fn pread_all(fd: RawFd, buffer: &mut [u8], offset: u64) -> Result<usize> {
    loop {
        let n = unsafe {
            libc::pread(
                fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                offset as libc::off_t,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(Error::Backend {
            op: "pread",
            source: err,
        });
    }
}

/// Positional write of the whole buffer; a write request completes only
/// when every byte is on its way to the file.
fn pwrite_all(fd: RawFd, buffer: &[u8], offset: u64) -> Result<usize> {
    let mut written = 0;
    while written < buffer.len() {
        let remaining = &buffer[written..];
        let n = unsafe {
            libc::pwrite(
                fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
                (offset + written as u64) as libc::off_t,
            )
        };
        if n > 0 {
            written += n as usize;
            continue;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if n == 0 {
            return Err(Error::Backend {
                op: "pwrite",
                source: io::Error::new(io::ErrorKind::WriteZero, "pwrite made no progress"),
            });
        }
        return Err(Error::Backend {
            op: "pwrite",
            source: err,
        });
    }
    Ok(written)
}
