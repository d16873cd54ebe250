//! Socket factory.
//!
//! Sockets are created, bound and put into listening state on the supervisor
//! thread, before the worker that will own them exists. Workers only register
//! the finished handles with their own event loop.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{self, setsockopt, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};

use crate::net::listener::ListenerError;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SOCKET_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SOCKET_FLAGS: SockFlag = SockFlag::empty();

/// Largest backlog handed to listen(2); the kernel clamps beyond this anyway.
const MAX_BACKLOG: u32 = 4096;

/// A listening TCP socket and a UDP socket bound to the same address.
#[derive(Debug)]
pub struct BoundSockets {
    pub tcp: TcpListener,
    pub udp: UdpSocket,
}

impl BoundSockets {
    /// Bind and listen on `addr`, optionally with SO_REUSEPORT.
    ///
    /// A zero port is resolved by the TCP bind and reused for UDP.
    pub fn bind(addr: SocketAddr, reuse_port: bool, backlog: u32) -> Result<Self, ListenerError> {
        let tcp = bind_tcp(addr, reuse_port, backlog)?;
        let tcp_addr = tcp
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let udp = bind_udp(tcp_addr, reuse_port)?;
        Ok(Self { tcp, udp })
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Bind `count` port-sharing socket pairs to one address.
///
/// All pairs end up on the same address:port so the kernel spreads incoming
/// connections across them. Nothing is returned unless every pair succeeds.
pub fn bind_shared(addr: SocketAddr, count: usize, backlog: u32) -> Result<Vec<BoundSockets>, ListenerError> {
    let mut pairs = Vec::with_capacity(count);
    let mut target = addr;
    for _ in 0..count {
        let pair = BoundSockets::bind(target, true, backlog)?;
        target = pair
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr: target, source })?;
        pairs.push(pair);
    }
    Ok(pairs)
}

fn open(addr: SocketAddr, ty: SockType, reuse_port: bool) -> nix::Result<OwnedFd> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket::socket(family, ty, SOCKET_FLAGS, None)?;
    if ty == SockType::Stream {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    }
    if reuse_port {
        setsockopt(&fd, sockopt::ReusePort, &true)?;
    }
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    Ok(fd)
}

fn bind_tcp(addr: SocketAddr, reuse_port: bool, backlog: u32) -> Result<TcpListener, ListenerError> {
    let fd = open(addr, SockType::Stream, reuse_port).map_err(|errno| ListenerError::Bind {
        addr,
        source: errno.into(),
    })?;

    Backlog::new(backlog.min(MAX_BACKLOG) as i32)
        .and_then(|backlog| socket::listen(&fd, backlog))
        .map_err(|errno| ListenerError::Listen {
            addr,
            source: errno.into(),
        })?;

    let listener = TcpListener::from(fd);
    listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::Listen { addr, source })?;
    Ok(listener)
}

fn bind_udp(addr: SocketAddr, reuse_port: bool) -> Result<UdpSocket, ListenerError> {
    let fd = open(addr, SockType::Datagram, reuse_port).map_err(|errno| ListenerError::Bind {
        addr,
        source: errno.into(),
    })?;
    let socket = UdpSocket::from(fd);
    socket
        .set_nonblocking(true)
        .map_err(|source| ListenerError::Bind { addr, source })?;
    Ok(socket)
}
