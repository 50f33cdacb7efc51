//! Worker-pool jobs: fan-out, error passing, suppressed cancellation.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use troika::{AsyncTimeout, AsyncWork, Error, EventLoop, Options};

fn new_loop() -> EventLoop {
    let mut event_loop = EventLoop::new();
    event_loop.create(Options::default()).unwrap();
    event_loop
}

/// Sixteen jobs on four threads; every work function runs on the pool and
/// every after-work callback runs back on the loop thread.
#[test]
fn work_fan_out() {
    const WORKS: usize = 16;

    let mut el = new_loop();
    el.pool_thread_count_set(4);

    let work_runs = Arc::new(AtomicUsize::new(0));
    let callback_runs = Rc::new(Cell::new(0));
    let loop_thread = thread::current().id();

    let mut works: Vec<AsyncWork> = (0..WORKS).map(|_| AsyncWork::new()).collect();
    for work in &mut works {
        let runs = work_runs.clone();
        let calls = callback_runs.clone();
        work.start(
            &mut el,
            move || {
                // Somewhere on a pool thread
                thread::sleep(Duration::from_millis(20));
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move |_el, res| {
                assert!(res.is_valid());
                // Strictly on the thread that runs the loop
                assert_eq!(loop_thread, thread::current().id());
                calls.set(calls.get() + 1);
            },
        )
        .unwrap();
    }

    el.run().unwrap();
    assert_eq!(WORKS, work_runs.load(Ordering::SeqCst));
    assert_eq!(WORKS, callback_runs.get());
    el.close().unwrap();
}

/// A failing work function surfaces through the after-work result.
#[test]
fn work_error_reaches_callback() {
    let mut el = new_loop();
    let saw_error = Rc::new(Cell::new(false));
    let mut work = AsyncWork::new();
    let flag = saw_error.clone();
    work.start(
        &mut el,
        || Err(Error::InvalidArgument("deliberate failure")),
        move |_el, res| {
            assert!(!res.is_valid());
            flag.set(true);
        },
    )
    .unwrap();
    el.run().unwrap();
    assert!(saw_error.get());
    el.close().unwrap();
}

/// Stopping a submitted work item lets the work run to completion but
/// suppresses its after-work callback.
#[test]
fn stop_suppresses_after_work() {
    let mut el = new_loop();
    let work_ran = Arc::new(AtomicUsize::new(0));
    let callback_ran = Rc::new(Cell::new(false));

    let mut work = AsyncWork::new();
    let runs = work_ran.clone();
    let flag = callback_ran.clone();
    work.start(
        &mut el,
        move || {
            thread::sleep(Duration::from_millis(30));
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        move |_el, _res| flag.set(true),
    )
    .unwrap();

    // Stage it onto the pool, then cancel
    el.run_no_wait().unwrap();
    work.stop(&mut el).unwrap();

    // Give the pool time to finish and the loop a chance to (not) dispatch
    let mut guard = AsyncTimeout::new();
    guard
        .start(&mut el, Duration::from_millis(100), |_el, _res| {})
        .unwrap();
    el.run().unwrap();

    assert_eq!(1, work_ran.load(Ordering::SeqCst));
    assert!(!callback_ran.get());
    el.close().unwrap();
}

/// A reactivated work item runs its (FnMut) work function again.
#[test]
fn work_reactivation() {
    let mut el = new_loop();
    let work_runs = Arc::new(AtomicUsize::new(0));
    let callback_runs = Rc::new(Cell::new(0));

    let mut work = AsyncWork::new();
    let runs = work_runs.clone();
    let calls = callback_runs.clone();
    work.start(
        &mut el,
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        move |_el, res| {
            calls.set(calls.get() + 1);
            res.reactivate_request(calls.get() < 3);
        },
    )
    .unwrap();

    el.run().unwrap();
    assert_eq!(3, work_runs.load(Ordering::SeqCst));
    assert_eq!(3, callback_runs.get());
    el.close().unwrap();
}
