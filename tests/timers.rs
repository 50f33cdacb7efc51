//! Timer behavior: deadlines, reactivation, stop semantics.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use troika::{AsyncTimeout, Error, EventLoop, Options};

macro_rules! err {
    ($result:expr, $err:pat) => {
        assert!(match $result {
            Err($err) => true,
            _ => false,
        })
    };
}

fn new_loop() -> EventLoop {
    let mut event_loop = EventLoop::new();
    event_loop.create(Options::default()).unwrap();
    event_loop
}

/// Two timers; the longer one reactivates itself once with a shorter
/// relative timeout. Three iterations: short fires once, long fires twice.
#[test]
fn two_timers_with_reactivation() {
    let mut el = new_loop();
    let t1_called = Rc::new(Cell::new(0));
    let t2_called = Rc::new(Cell::new(0));

    let mut t1 = AsyncTimeout::new();
    let counter = t1_called.clone();
    t1.start(&mut el, Duration::from_millis(1), move |_el, res| {
        assert_eq!(Duration::from_millis(1), res.relative_timeout());
        counter.set(counter.get() + 1);
    })
    .unwrap();

    let mut t2 = AsyncTimeout::new();
    let counter = t2_called.clone();
    t2.start(&mut el, Duration::from_millis(100), move |_el, res| {
        if counter.get() == 0 {
            // Fire again, but much sooner this time
            res.relative_timeout_set(Duration::from_millis(1));
            res.reactivate_request(true);
        }
        counter.set(counter.get() + 1);
    })
    .unwrap();

    el.run_once().unwrap();
    assert_eq!((1, 0), (t1_called.get(), t2_called.get()));
    el.run_once().unwrap();
    assert_eq!((1, 1), (t1_called.get(), t2_called.get()));
    el.run_once().unwrap();
    assert_eq!((1, 2), (t1_called.get(), t2_called.get()));

    el.close().unwrap();
}

/// A timer actually waits for its deadline.
#[test]
fn timer_waits() {
    let mut el = new_loop();
    let mut timeout = AsyncTimeout::new();
    timeout
        .start(&mut el, Duration::from_millis(50), |_el, _res| {})
        .unwrap();
    let before = Instant::now();
    el.run().unwrap();
    assert!(before.elapsed() >= Duration::from_millis(50));
    assert_eq!(0, el.request_count());
    el.close().unwrap();
}

/// start followed by stop is a net no-op: back to Free, no callback.
#[test]
fn start_stop_roundtrip() {
    let mut el = new_loop();
    let fired = Rc::new(Cell::new(false));
    let mut timeout = AsyncTimeout::new();
    let flag = fired.clone();
    timeout
        .start(&mut el, Duration::from_millis(1), move |_el, _res| {
            flag.set(true)
        })
        .unwrap();
    assert_eq!(1, el.request_count());
    timeout.stop(&mut el).unwrap();
    assert_eq!(0, el.request_count());

    el.run_no_wait().unwrap();
    assert!(!fired.get());

    // Free again, so it can be started anew
    timeout
        .start(&mut el, Duration::from_millis(1), |_el, _res| {})
        .unwrap();
    el.run().unwrap();
    el.close().unwrap();
}

/// Starting an in-flight request is refused.
#[test]
fn double_start_fails() {
    let mut el = new_loop();
    let mut timeout = AsyncTimeout::new();
    timeout
        .start(&mut el, Duration::from_millis(100), |_el, _res| {})
        .unwrap();
    err!(
        timeout.start(&mut el, Duration::from_millis(100), |_el, _res| {}),
        Error::InvalidState
    );
    timeout.stop(&mut el).unwrap();
    el.close().unwrap();
}

/// Stopping something that was never started is refused too.
#[test]
fn stop_unstarted_fails() {
    let mut el = new_loop();
    let mut timeout = AsyncTimeout::new();
    err!(timeout.stop(&mut el), Error::InvalidState);
    el.close().unwrap();
}

/// A callback may start other requests on the loop it is given.
#[test]
fn callback_starts_another_timer() {
    let mut el = new_loop();
    let second_fired = Rc::new(Cell::new(false));
    let mut first = AsyncTimeout::new();
    let flag = second_fired.clone();
    first
        .start(&mut el, Duration::from_millis(1), move |el, _res| {
            // The nested request object lives only inside the callback, the
            // loop keeps its state alive regardless
            let mut second = AsyncTimeout::new();
            let flag = flag.clone();
            second
                .start(el, Duration::from_millis(1), move |_el, _res| {
                    flag.set(true)
                })
                .unwrap();
        })
        .unwrap();
    el.run().unwrap();
    assert!(second_fired.get());
    el.close().unwrap();
}

/// Timers fire in deadline order within one iteration.
#[test]
fn deadline_order() {
    let mut el = new_loop();
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut late = AsyncTimeout::new();
    let log = order.clone();
    late.start(&mut el, Duration::from_millis(20), move |_el, _res| {
        log.borrow_mut().push("late")
    })
    .unwrap();
    let mut early = AsyncTimeout::new();
    let log = order.clone();
    early
        .start(&mut el, Duration::from_millis(5), move |_el, _res| {
            log.borrow_mut().push("early")
        })
        .unwrap();
    // Sleep past both deadlines so a single iteration dispatches them
    std::thread::sleep(Duration::from_millis(30));
    el.run_once().unwrap();
    assert_eq!(vec!["early", "late"], *order.borrow());
    el.close().unwrap();
}
