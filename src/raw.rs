//! Low-level socket operations
//!
//! Thin wrappers over the POSIX socket calls the engine needs before a
//! descriptor is handed to the readiness back-end: creation, option setup,
//! bind/listen and the non-blocking `connect` whose completion is later
//! detected through `SO_ERROR`.
//!
//! Channels are IPv4 only, so every address helper works on
//! `SocketAddrV4` / `sockaddr_in`.
//!
//! # Safety
//!
//! This module contains `unsafe` code for the raw system calls and for
//! adopting descriptors into std socket types. Callers outside this module
//! only see safe functions, except for the `*_from_os` constructors which
//! transfer descriptor ownership.

use crate::channel::ChannelType;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{FromRawFd, RawFd};

/// OS socket handle
pub type OsSocket = RawFd;

/// Build a `sockaddr_in` for an IPv4 address
pub fn to_sockaddr(addr: SocketAddrV4) -> (libc::sockaddr_in, libc::socklen_t) {
    let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    s.sin_family = libc::AF_INET as _;
    s.sin_port = addr.port().to_be();
    s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly"))]
    {
        s.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    (s, std::mem::size_of::<libc::sockaddr_in>() as _)
}

/// Read back a `sockaddr_in`
pub fn from_sockaddr(s: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(s.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(s.sin_port))
}

/// Create an IPv4 socket for the given internal transport
pub fn socket(raw_type: ChannelType) -> io::Result<OsSocket> {
    let t = match raw_type { ChannelType::Stream => libc::SOCK_STREAM, _ => libc::SOCK_DGRAM };
    let fd = socket_cloexec(t)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // no MSG_NOSIGNAL here, SIGPIPE is suppressed per socket instead
        if let Err(err) = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1) {
            close(fd);
            return Err(err);
        }
    }
    Ok(fd)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
        fn socket_cloexec(t: i32) -> io::Result<OsSocket> {
            let fd = unsafe { libc::socket(libc::AF_INET, t | libc::SOCK_CLOEXEC, 0) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            Ok(fd)
        }
    } else {
        fn socket_cloexec(t: i32) -> io::Result<OsSocket> {
            let fd = unsafe { libc::socket(libc::AF_INET, t, 0) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                let err = io::Error::last_os_error();
                close(fd);
                return Err(err);
            }
            Ok(fd)
        }
    }
}

/// Set socket non-blocking mode
pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(os, libc::F_GETFL);
        if flags < 0 { return Err(io::Error::last_os_error()); }
        let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        if libc::fcntl(os, libc::F_SETFL, nb) != 0 { return Err(io::Error::last_os_error()); }
        Ok(())
    }
}

/// Bind socket to an IPv4 address
pub fn bind_raw(os: OsSocket, addr: SocketAddrV4) -> io::Result<()> {
    let (sa, len) = to_sockaddr(addr);
    let rc = unsafe { libc::bind(os, &sa as *const _ as *const libc::sockaddr, len) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Start listening on socket with specified backlog
pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> { if unsafe { libc::listen(os, backlog) } != 0 { Err(io::Error::last_os_error()) } else { Ok(()) } }

/// Issue a non-blocking connect
///
/// Returns `Ok(true)` when the connection completed synchronously and
/// `Ok(false)` when it is in progress.
pub fn connect_raw(os: OsSocket, addr: SocketAddrV4) -> io::Result<bool> {
    let (sa, len) = to_sockaddr(addr);
    let rc = unsafe { libc::connect(os, &sa as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EWOULDBLOCK) => Ok(false),
        _ => Err(err),
    }
}

/// Local address a socket is bound to
pub fn local_addr(os: OsSocket) -> io::Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(os, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(from_sockaddr(&sa)) }
}

/// Pending socket error (SO_ERROR), 0 when there is none
pub fn take_error(os: OsSocket) -> io::Result<i32> { get_int_opt(os, libc::SOL_SOCKET, libc::SO_ERROR) }

/// Close a descriptor that was never adopted by a std type
pub fn close(os: OsSocket) { unsafe { libc::close(os); } }

/// Enable address reuse
pub fn set_reuse_addr(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32) }
/// Enable TCP keepalive probes
pub fn set_keepalive(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as i32) }
/// Allow sending to broadcast addresses
pub fn set_broadcast(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_BROADCAST, on as i32) }
/// Set socket receive buffer size
pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
/// Set socket send buffer size
pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
/// Disable TCP Nagle algorithm
pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32) }

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let v = val as libc::c_int;
    let rc = unsafe { libc::setsockopt(fd, level, opt, &v as *const _ as _, std::mem::size_of::<libc::c_int>() as _) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Read an integer socket option
pub fn get_int_opt(fd: RawFd, level: i32, opt: i32) -> io::Result<i32> {
    let mut v: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe { libc::getsockopt(fd, level, opt, &mut v as *mut _ as _, &mut len) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(v) }
}

/// Convert OS socket to std UDP socket
///
/// # Safety
/// `fd` must be an open datagram socket not owned by anything else.
pub unsafe fn udp_from_os(fd: RawFd) -> std::net::UdpSocket { unsafe { std::net::UdpSocket::from_raw_fd(fd) } }
/// Convert OS socket to std TCP listener
///
/// # Safety
/// `fd` must be an open listening stream socket not owned by anything else.
pub unsafe fn tcp_listener_from_os(fd: RawFd) -> std::net::TcpListener { unsafe { std::net::TcpListener::from_raw_fd(fd) } }
/// Convert OS socket to std TCP stream
///
/// # Safety
/// `fd` must be an open stream socket not owned by anything else.
pub unsafe fn tcp_stream_from_os(fd: RawFd) -> std::net::TcpStream { unsafe { std::net::TcpStream::from_raw_fd(fd) } }
