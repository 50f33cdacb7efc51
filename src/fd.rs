//! OS handle plumbing: raw sockets and the sockaddr bridge.
//!
//! The loop speaks `RawFd` for operations and `OwnedFd` where ownership
//! actually moves (accepted clients, close requests). Socket creation goes
//! straight through libc so the non-blocking and close-on-exec flags are set
//! atomically at creation, which is what the backends rely on.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

/// Address family for [`create_tcp_socket`](crate::EventLoop::create_async_tcp_socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The family of a concrete address, convenient when connecting.
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// Create a TCP socket ready for use with the loop: non-blocking and
/// close-on-exec from the first instruction.
pub(crate) fn create_tcp_socket(family: Family) -> Result<OwnedFd> {
    let domain = match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::last_os("socket"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A `SocketAddr` flattened into the raw form `connect` wants.
///
/// Kept as an owned value so the ring backend can park it somewhere stable
/// until the kernel is done reading it.
pub(crate) struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    pub fn from_std(addr: &SocketAddr) -> SockAddr {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                // The octets already are network order, store them verbatim
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                std::mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        SockAddr {
            storage,
            len: len as libc::socklen_t,
        }
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }
}

/// Close a raw descriptor, reporting the errno if the kernel complains.
pub(crate) fn close_raw(fd: RawFd) -> Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        Err(Error::last_os("close"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn socket_is_created_nonblocking() {
        let sock = create_tcp_socket(Family::V4).unwrap();
        assert!(sock.as_raw_fd() >= 0);
        let flags = unsafe { libc::fcntl(sock.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
    }

    #[test]
    fn sockaddr_v4_layout() {
        let addr: SocketAddr = "127.0.0.1:5050".parse().unwrap();
        let raw = SockAddr::from_std(&addr);
        assert_eq!(
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            raw.len()
        );
        let sin = unsafe { &*(raw.as_ptr() as *const libc::sockaddr_in) };
        assert_eq!(libc::AF_INET as libc::sa_family_t, sin.sin_family);
        assert_eq!(5050u16.to_be(), sin.sin_port);
        assert_eq!(u32::from_ne_bytes([127, 0, 0, 1]), sin.sin_addr.s_addr);
    }

    #[test]
    fn sockaddr_v6_layout() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        let raw = SockAddr::from_std(&addr);
        let sin6 = unsafe { &*(raw.as_ptr() as *const libc::sockaddr_in6) };
        assert_eq!(libc::AF_INET6 as libc::sa_family_t, sin6.sin6_family);
        assert_eq!(80u16.to_be(), sin6.sin6_port);
        let mut expected = [0u8; 16];
        expected[15] = 1;
        assert_eq!(expected, sin6.sin6_addr.s6_addr);
    }
}
