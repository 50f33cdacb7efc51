//! Simple TCP echo server.
//!
//! The classical example for an asynchronous library: listen on a TCP
//! port, accept whatever connects and send everything back where it came
//! from. One reactivated accept request feeds one reactivated receive
//! request per connection; each chunk goes back out as a fire-and-forget
//! send.
//!
//! The port is the first command line argument, 6666 by default.

use std::env::args;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::exit;

use troika::{AsyncAccept, AsyncReceive, AsyncSend, EventLoop, Options, Result};

const BUFFER_SIZE: usize = 1024;

fn serve_connection(event_loop: &mut EventLoop, client: OwnedFd) -> Result<()> {
    let fd = client.as_raw_fd();
    let mut receive = AsyncReceive::new();
    // The socket moves into the callback; when the request goes Free the
    // closure is dropped and the socket closes with it
    receive.start(event_loop, fd, vec![0u8; BUFFER_SIZE], move |el, res| {
        let _keep_alive = &client;
        let chunk = match res.data() {
            Some([]) | None => None, // Peer closed or the connection broke
            Some(data) => Some(data.to_vec()),
        };
        match chunk {
            None => res.reactivate_request(false),
            Some(data) => {
                // Fire-and-forget echo; the loop owns the request state, so
                // the object itself does not need to outlive this scope
                let mut send = AsyncSend::new();
                let _ = send.start(el, fd, data, |_el, _res| {});
                res.reactivate_request(true);
            }
        }
    })
}

fn run() -> Result<()> {
    let port: u16 = args()
        .nth(1)
        .unwrap_or_else(|| "6666".into())
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("Couldn't parse the port number: {}", e);
            exit(1);
        });

    let listener = TcpListener::bind(("::", port))?;
    listener.set_nonblocking(true)?;
    println!("echoing on port {}", port);

    let mut event_loop = EventLoop::new();
    event_loop.create(Options::default())?;
    event_loop.associate_externally_created_tcp_socket(listener.as_raw_fd())?;

    let mut accept = AsyncAccept::new();
    accept.debug_name_set("listener");
    accept.start(&mut event_loop, listener.as_raw_fd(), |el, res| {
        match res.take_socket() {
            Ok(client) => {
                if let Err(e) = serve_connection(el, client) {
                    eprintln!("dropping connection: {}", e);
                }
            }
            Err(e) => eprintln!("accept failed: {}", e),
        }
        res.reactivate_request(true);
    })?;

    // The accept request keeps reactivating, so this runs until killed
    event_loop.run()
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{}", e);
        exit(1);
    }
}
