//! File I/O: worker-pool routing on the readiness backend, native
//! submissions on the ring, and asynchronous close.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::rc::Rc;

use troika::{Api, AsyncFileClose, AsyncFileRead, AsyncFileWrite, EventLoop, Options};

fn backend_matrix() -> Vec<Options> {
    let mut matrix = vec![Options {
        api: Api::ForceReadiness,
    }];
    if EventLoop::try_loading_ring() {
        matrix.push(Options { api: Api::ForceRing });
    }
    matrix
}

fn new_loop(options: Options) -> EventLoop {
    let mut event_loop = EventLoop::new();
    event_loop.create(options).unwrap();
    event_loop
}

fn scratch_file(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("troika-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

/// Write "test" through the loop, read it back one byte at a time with a
/// reactivated read whose callback advances the offset.
#[test]
fn file_roundtrip() {
    for (variant, options) in backend_matrix().into_iter().enumerate() {
        let path = scratch_file(&format!("roundtrip-{}.txt", variant));
        let mut el = new_loop(options);
        el.pool_thread_count_set(4);

        // Write the whole payload at offset 0
        let file = File::create(&path).unwrap();
        let wrote = Rc::new(Cell::new(0));
        let mut write = AsyncFileWrite::new();
        write.debug_name_set("writer");
        let counter = wrote.clone();
        write
            .start(&mut el, file.as_raw_fd(), b"test".to_vec(), 0, move |_el, res| {
                assert_eq!(4, res.written().unwrap());
                counter.set(counter.get() + 1);
            })
            .unwrap();
        el.run_once().unwrap();
        assert_eq!(1, wrote.get());
        drop(file);

        // Read it back a byte per activation
        let file = File::open(&path).unwrap();
        let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let mut read = AsyncFileRead::new();
        read.debug_name_set("reader");
        let sink = collected.clone();
        read.start(&mut el, file.as_raw_fd(), vec![0u8; 1], 0, move |_el, res| {
            let data = res.data().unwrap().to_vec();
            assert_eq!(1, data.len());
            let mut sink = sink.borrow_mut();
            sink.extend_from_slice(&data);
            // The offset is ours to advance
            res.offset_set(res.offset() + data.len() as u64);
            res.reactivate_request(sink.len() < 4);
        })
        .unwrap();
        el.run().unwrap();
        assert_eq!(b"test".to_vec(), *collected.borrow());

        drop(file);
        std::fs::remove_file(&path).unwrap();
        el.close().unwrap();
    }
}

/// A read that never advances its offset sees the same bytes again.
#[test]
fn read_offset_is_caller_managed() {
    let path = scratch_file("same-offset.txt");
    std::fs::write(&path, b"xy").unwrap();
    let mut el = new_loop(Options::default());

    let file = File::open(&path).unwrap();
    let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut read = AsyncFileRead::new();
    let sink = seen.clone();
    read.start(&mut el, file.as_raw_fd(), vec![0u8; 1], 0, move |_el, res| {
        let mut sink = sink.borrow_mut();
        sink.extend_from_slice(res.data().unwrap());
        let keep_going = sink.len() < 2;
        res.reactivate_request(keep_going);
    })
    .unwrap();
    el.run().unwrap();
    // Offset untouched, so it is the first byte both times
    assert_eq!(b"xx".to_vec(), *seen.borrow());

    drop(file);
    std::fs::remove_file(&path).unwrap();
    el.close().unwrap();
}

/// Asynchronous file close; the descriptor ownership moves into the loop.
#[test]
fn file_close() {
    for (variant, options) in backend_matrix().into_iter().enumerate() {
        let path = scratch_file(&format!("close-{}.txt", variant));
        std::fs::write(&path, b"test").unwrap();
        let mut el = new_loop(options);

        let file = File::open(&path).unwrap();
        let closed = Rc::new(Cell::new(0));
        let mut close = AsyncFileClose::new();
        let counter = closed.clone();
        close
            .start(&mut el, OwnedFd::from(file), move |_el, res| {
                assert!(res.is_valid());
                counter.set(counter.get() + 1);
            })
            .unwrap();
        el.run().unwrap();
        assert_eq!(1, closed.get());

        std::fs::remove_file(&path).unwrap();
        el.close().unwrap();
    }
}
