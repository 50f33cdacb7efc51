//! TCP operations: accept, connect, send/receive, error paths, close.
//!
//! Everything runs on the readiness backend, then again forced onto the
//! ring when the kernel has one.

use std::cell::{Cell, RefCell};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::rc::Rc;

use troika::{
    Api, AsyncAccept, AsyncConnect, AsyncReceive, AsyncSend, AsyncSocketClose, Error, EventLoop,
    Family, Options,
};

macro_rules! err {
    ($result:expr, $err:pat) => {
        assert!(match $result {
            Err($err) => true,
            _ => false,
        })
    };
}

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

fn listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// One accept request, reactivated, picks up two queued clients.
#[test]
fn accept_with_reactivation() {
    for options in backend_matrix() {
        let mut el = new_loop(options);
        let (listener, addr) = listener();
        el.associate_externally_created_tcp_socket(listener.as_raw_fd())
            .unwrap();

        let accepted: Rc<RefCell<Vec<OwnedFd>>> = Rc::new(RefCell::new(Vec::new()));
        let mut accept = AsyncAccept::new();
        accept.debug_name_set("listener");
        let sink = accepted.clone();
        accept
            .start(&mut el, listener.as_raw_fd(), move |_el, res| {
                sink.borrow_mut().push(res.take_socket().unwrap());
                res.reactivate_request(true);
            })
            .unwrap();

        let client1 = TcpStream::connect(addr).unwrap();
        let client2 = TcpStream::connect(addr).unwrap();
        assert!(accepted.borrow().is_empty());

        el.run_once().unwrap();
        if accepted.borrow().len() < 2 {
            el.run_once().unwrap();
        }
        {
            let accepted = accepted.borrow();
            assert_eq!(2, accepted.len());
            assert_ne!(accepted[0].as_raw_fd(), accepted[1].as_raw_fd());
        }

        // Stop accepting; a third client stays queued in the backlog
        accept.stop(&mut el).unwrap();
        el.run_no_wait().unwrap();
        let _client3 = TcpStream::connect(addr).unwrap();
        el.run_no_wait().unwrap();
        assert_eq!(2, accepted.borrow().len());

        drop((client1, client2));
        el.close().unwrap();
    }
}

/// Loop-driven connects against a loop-driven accept, then a send/receive
/// round-trip with a one-byte receive buffer that reactivates.
#[test]
fn connect_send_receive() {
    for options in backend_matrix() {
        let mut el = new_loop(options);
        let (listener, addr) = listener();

        let accepted: Rc<RefCell<Vec<OwnedFd>>> = Rc::new(RefCell::new(Vec::new()));
        let mut accept = AsyncAccept::new();
        let sink = accepted.clone();
        accept
            .start(&mut el, listener.as_raw_fd(), move |_el, res| {
                let mut sink = sink.borrow_mut();
                sink.push(res.take_socket().unwrap());
                res.reactivate_request(sink.len() < 2);
            })
            .unwrap();

        let connected = Rc::new(Cell::new(0));
        let client1 = el.create_async_tcp_socket(Family::V4).unwrap();
        let client2 = el.create_async_tcp_socket(Family::V4).unwrap();
        let mut connect1 = AsyncConnect::new();
        let mut connect2 = AsyncConnect::new();
        for (connect, client) in [(&mut connect1, &client1), (&mut connect2, &client2)] {
            let counter = connected.clone();
            connect
                .start(&mut el, client.as_raw_fd(), addr, move |_el, res| {
                    assert!(res.is_valid());
                    counter.set(counter.get() + 1);
                })
                .unwrap();
        }

        el.run().unwrap();
        assert_eq!(2, connected.get());
        assert_eq!(2, accepted.borrow().len());

        // Send two bytes from a client, receive them one at a time on the
        // accepted peer
        let payload = vec![123u8, 111u8];
        let sent = Rc::new(Cell::new(0));
        let mut send = AsyncSend::new();
        let counter = sent.clone();
        send.start(&mut el, client1.as_raw_fd(), payload.clone(), move |_el, res| {
            assert!(res.is_valid());
            counter.set(counter.get() + 1);
        })
        .unwrap();

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let server_side = accepted.borrow_mut().remove(0);
        let mut receive = AsyncReceive::new();
        let sink = received.clone();
        receive
            .start(&mut el, server_side.as_raw_fd(), vec![0u8; 1], move |_el, res| {
                let mut sink = sink.borrow_mut();
                sink.extend_from_slice(res.data().unwrap());
                res.reactivate_request(sink.len() < 2);
            })
            .unwrap();

        el.run().unwrap();
        assert_eq!(1, sent.get());
        assert_eq!(payload, *received.borrow());

        el.close().unwrap();
    }
}

/// A send on a handle closed out from under the loop errors through the
/// callback; the receive on its peer reports an error or peer-closed; a
/// second start on the in-flight receive is refused.
#[test]
fn send_receive_error_propagation() {
    for options in backend_matrix() {
        let mut el = new_loop(options);
        let (listener, addr) = listener();

        let client = TcpStream::connect(addr).unwrap();
        listener.set_nonblocking(false).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server_side.set_nonblocking(true).unwrap();
        el.associate_externally_created_tcp_socket(client.as_raw_fd())
            .unwrap();
        el.associate_externally_created_tcp_socket(server_side.as_raw_fd())
            .unwrap();

        // Close the server side's descriptor behind the loop's back
        let server_fd = server_side.into_raw_fd();
        drop(unsafe { OwnedFd::from_raw_fd(server_fd) });

        let send_errors = Rc::new(Cell::new(0));
        let mut send = AsyncSend::new();
        send.debug_name_set("dead-send");
        let counter = send_errors.clone();
        send.start(&mut el, server_fd, vec![1u8], move |_el, res| {
            assert!(!res.is_valid());
            counter.set(counter.get() + 1);
        })
        .unwrap();

        let recv_done = Rc::new(Cell::new(0));
        let mut receive = AsyncReceive::new();
        receive.debug_name_set("orphan-receive");
        let counter = recv_done.clone();
        receive
            .start(&mut el, client.as_raw_fd(), vec![0u8; 1], move |_el, res| {
                // The peer is gone: either an error or a clean zero read
                assert!(!res.is_valid() || res.peer_closed());
                counter.set(counter.get() + 1);
            })
            .unwrap();

        // The receive is in flight, so starting it again must fail
        err!(
            receive.start(&mut el, client.as_raw_fd(), vec![0u8; 1], |_el, _res| {}),
            Error::InvalidState
        );

        el.run().unwrap();
        assert_eq!(1, send_errors.get());
        assert_eq!(1, recv_done.get());

        el.close().unwrap();
    }
}

/// Asynchronous close of both ends of a connection.
#[test]
fn socket_close() {
    for options in backend_matrix() {
        let mut el = new_loop(options);
        let (listener, addr) = listener();

        let client = TcpStream::connect(addr).unwrap();
        listener.set_nonblocking(false).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let closed = Rc::new(Cell::new(0));
        let mut close1 = AsyncSocketClose::new();
        let mut close2 = AsyncSocketClose::new();
        for (close, socket) in [
            (&mut close1, OwnedFd::from(client)),
            (&mut close2, OwnedFd::from(server_side)),
        ] {
            let counter = closed.clone();
            close
                .start(&mut el, socket, move |_el, res| {
                    assert!(res.is_valid());
                    counter.set(counter.get() + 1);
                })
                .unwrap();
        }

        el.run().unwrap();
        assert_eq!(2, closed.get());
        el.close().unwrap();
    }
}
