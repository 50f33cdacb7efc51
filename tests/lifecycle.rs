//! Loop lifecycle: create/close cycles, abrupt teardown with requests in
//! every state, restartability of the same request objects.

use std::cell::Cell;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use troika::{AsyncAccept, AsyncTimeout, AsyncWakeUp, Error, EventLoop, Options};

macro_rules! err {
    ($result:expr, $err:pat) => {
        assert!(match $result {
            Err($err) => true,
            _ => false,
        })
    };
}

fn listener() -> TcpListener {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    listener
}

/// Requests still on the submission queue are freed by `close` and the
/// same objects restart cleanly on the recreated loop.
#[test]
fn close_during_submit() {
    let mut el = EventLoop::new();
    el.create(Options::default()).unwrap();

    let mut timeouts = [
        AsyncTimeout::new(),
        AsyncTimeout::new(),
        AsyncTimeout::new(),
        AsyncTimeout::new(),
    ];
    let mut wake_ups = [AsyncWakeUp::new(), AsyncWakeUp::new()];
    let mut accepts = [AsyncAccept::new(), AsyncAccept::new()];
    let listeners = [listener(), listener()];

    for timeout in &mut timeouts {
        timeout
            .start(&mut el, Duration::from_millis(12), |_el, _res| {})
            .unwrap();
    }
    for wake_up in &mut wake_ups {
        wake_up.start(&mut el, |_el, _res| {}).unwrap();
    }
    for (accept, listener) in accepts.iter_mut().zip(&listeners) {
        accept
            .start(&mut el, listener.as_raw_fd(), |_el, _res| {})
            .unwrap();
    }
    assert_eq!(8, el.request_count());

    // Everything is still Submitting; tear the loop down under it
    el.close().unwrap();
    assert_eq!(0, el.request_count());

    // A fresh incarnation accepts the very same objects again
    el.create(Options::default()).unwrap();
    for timeout in &mut timeouts {
        timeout
            .start(&mut el, Duration::from_millis(12), |_el, _res| {})
            .unwrap();
    }
    for wake_up in &mut wake_ups {
        wake_up.start(&mut el, |_el, _res| {}).unwrap();
    }
    for (accept, listener) in accepts.iter_mut().zip(&listeners) {
        accept
            .start(&mut el, listener.as_raw_fd(), |_el, _res| {})
            .unwrap();
    }
    assert_eq!(8, el.request_count());
    el.close().unwrap();
}

/// Same, but with the requests staged to the backend first.
#[test]
fn close_frees_active_requests() {
    let mut el = EventLoop::new();
    el.create(Options::default()).unwrap();

    let listeners = [listener(), listener()];
    let mut accepts = [AsyncAccept::new(), AsyncAccept::new()];
    for (accept, listener) in accepts.iter_mut().zip(&listeners) {
        accept
            .start(&mut el, listener.as_raw_fd(), |_el, _res| {})
            .unwrap();
    }
    el.run_no_wait().unwrap();
    // Both accepts are Active in the backend now
    assert_eq!(2, el.request_count());
    el.close().unwrap();

    el.create(Options::default()).unwrap();
    for (accept, listener) in accepts.iter_mut().zip(&listeners) {
        accept
            .start(&mut el, listener.as_raw_fd(), |_el, _res| {})
            .unwrap();
    }
    el.run_no_wait().unwrap();
    el.close().unwrap();
}

/// Callbacks are suppressed by close, not fired late.
#[test]
fn close_suppresses_callbacks() {
    let mut el = EventLoop::new();
    el.create(Options::default()).unwrap();
    let fired = Rc::new(Cell::new(false));
    let mut timeout = AsyncTimeout::new();
    let flag = fired.clone();
    timeout
        .start(&mut el, Duration::from_millis(1), move |_el, _res| {
            flag.set(true)
        })
        .unwrap();
    el.close().unwrap();

    std::thread::sleep(Duration::from_millis(5));
    assert!(!fired.get());
}

/// create/close cycles are idempotent-ish and leak nothing visible.
#[test]
fn create_close_cycles() {
    let mut el = EventLoop::new();
    for _ in 0..3 {
        el.create(Options::default()).unwrap();
        assert_eq!(0, el.request_count());
        el.close().unwrap();
    }
    // Closing an already-closed loop is fine
    el.close().unwrap();
}

/// Anything but create on an uninitialized loop reports that state.
#[test]
fn operations_need_create() {
    let mut el = EventLoop::new();
    err!(el.run_once(), Error::NotInitialized);
    err!(el.run(), Error::NotInitialized);
    err!(el.wake_handle().map(|_| ()), Error::NotInitialized);

    let mut timeout = AsyncTimeout::new();
    err!(
        timeout.start(&mut el, Duration::from_millis(1), |_el, _res| {}),
        Error::NotInitialized
    );

    el.create(Options::default()).unwrap();
    // A second create needs a close in between
    err!(el.create(Options::default()), Error::InvalidState);
    el.close().unwrap();

    err!(
        timeout.start(&mut el, Duration::from_millis(1), |_el, _res| {}),
        Error::NotInitialized
    );
}

/// run() returns once the loop drained; an empty created loop returns at
/// once.
#[test]
fn run_on_empty_loop_returns() {
    let mut el = EventLoop::new();
    el.create(Options::default()).unwrap();
    el.run().unwrap();
    el.close().unwrap();
}
