//! Child-process exit notifications.
//!
//! This runs without the test harness: exits are observed through a
//! signalfd, which needs SIGCHLD blocked before any other thread exists.
//! The harness spawns test threads that would race for the signal, so this
//! file is a plain `main` that simply crashes on failure (see the
//! `harness = false` entry in Cargo.toml).

use std::cell::RefCell;
use std::collections::HashMap;
use std::process::Command;
use std::rc::Rc;

use troika::{Api, AsyncProcessExit, EventLoop, Options};

fn spawn_shell(script: &str) -> i32 {
    Command::new("sh")
        .arg("-c")
        .arg(script)
        .spawn()
        .expect("spawning sh")
        .id() as i32
}

fn process_exit_statuses(options: Options) {
    let mut el = EventLoop::new();
    el.create(options).unwrap();

    // One immediate success, one immediate failure, one that is still
    // alive when the watch is armed
    let ok_pid = spawn_shell("exit 0");
    let fail_pid = spawn_shell("exit 7");
    let sleeper_pid = spawn_shell("sleep 0.2; exit 3");

    let statuses: Rc<RefCell<HashMap<i32, i32>>> = Rc::new(RefCell::new(HashMap::new()));
    let mut watches = Vec::new();
    for pid in [ok_pid, fail_pid, sleeper_pid] {
        let mut watch = AsyncProcessExit::new();
        let sink = statuses.clone();
        watch
            .start(&mut el, pid, move |_el, res| {
                sink.borrow_mut().insert(pid, res.get().unwrap());
            })
            .unwrap();
        watches.push(watch);
    }

    el.run().unwrap();

    let statuses = statuses.borrow();
    assert_eq!(Some(&0), statuses.get(&ok_pid));
    assert_eq!(Some(&7), statuses.get(&fail_pid));
    assert_eq!(Some(&3), statuses.get(&sleeper_pid));

    el.close().unwrap();
}

fn main() {
    process_exit_statuses(Options {
        api: Api::ForceReadiness,
    });
    if EventLoop::try_loading_ring() {
        process_exit_statuses(Options { api: Api::ForceRing });
    }
}
