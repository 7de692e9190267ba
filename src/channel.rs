//! Channel entity and its handle
//!
//! A channel is the engine's view of one socket: its transport type, where
//! it is in the lifecycle, the socket itself once opened, the write-behind
//! queue and a few counters. Callers only ever hold a [`ChannelId`].
//!
//! Handles are slab keys paired with a generation number, so a handle kept
//! past the destruction of its channel is rejected instead of aliasing a
//! newer channel that reused the slot.

use crate::write_buffer::WriteBuffer;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// Number of channel type slots, including the unused slot 0
pub const MAX_CHANNEL_TYPES: usize = 8;

/// Opaque handle naming one channel of an [`Engine`](crate::Engine)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub(crate) key: usize,
    pub(crate) generation: u64,
}

impl ChannelId {
    /// Readiness token the channel is registered under
    pub fn token(&self) -> Token {
        Token(self.key)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chann#{}.{}", self.key, self.generation)
    }
}

/// Transport a channel runs on
///
/// The first three are the internal transports. `Extension(n)` names a
/// protocol layer registered in slot `n` (4 to 7), which itself runs on one
/// of the internal transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Stream,
    Datagram,
    Broadcast,
    Extension(u8),
}

impl ChannelType {
    /// Registry slot of the type
    pub fn id(self) -> u8 {
        match self {
            ChannelType::Stream => 1,
            ChannelType::Datagram => 2,
            ChannelType::Broadcast => 3,
            ChannelType::Extension(n) => n,
        }
    }

    pub fn from_id(id: u8) -> Option<ChannelType> {
        match id {
            1 => Some(ChannelType::Stream),
            2 => Some(ChannelType::Datagram),
            3 => Some(ChannelType::Broadcast),
            n if (n as usize) < MAX_CHANNEL_TYPES && n > 3 => Some(ChannelType::Extension(n)),
            _ => None,
        }
    }

    /// `true` for stream, datagram and broadcast
    pub fn is_internal(self) -> bool {
        !matches!(self, ChannelType::Extension(_))
    }
}

/// Lifecycle state, ordered so that `state >= Connected` means "usable"
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelState {
    Closed,
    Disconnected,
    Connecting,
    Connected,
    Listening,
}

/// Socket owned by a channel
#[derive(Debug)]
pub(crate) enum Socket {
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

impl Socket {
    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            Socket::Stream(s) => s.as_raw_fd(),
            Socket::Listener(l) => l.as_raw_fd(),
            Socket::Datagram(u) => u.as_raw_fd(),
        }
    }

    /// Same descriptor in a fresh wrapper, detached from any poller
    pub(crate) fn renew(self) -> Socket {
        // SAFETY: the descriptor is moved out of the old wrapper and owned
        // by exactly one new wrapper.
        unsafe {
            match self {
                Socket::Stream(s) => Socket::Stream(TcpStream::from_raw_fd(s.into_raw_fd())),
                Socket::Listener(l) => Socket::Listener(TcpListener::from_raw_fd(l.into_raw_fd())),
                Socket::Datagram(u) => Socket::Datagram(UdpSocket::from_raw_fd(u.into_raw_fd())),
            }
        }
    }
}

impl Source for Socket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Stream(s) => s.register(registry, token, interests),
            Socket::Listener(l) => l.register(registry, token, interests),
            Socket::Datagram(u) => u.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Stream(s) => s.reregister(registry, token, interests),
            Socket::Listener(l) => l.reregister(registry, token, interests),
            Socket::Datagram(u) => u.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Stream(s) => s.deregister(registry),
            Socket::Listener(l) => l.deregister(registry),
            Socket::Datagram(u) => u.deregister(registry),
        }
    }
}

pub(crate) struct Channel {
    pub(crate) generation: u64,
    pub(crate) ctype: ChannelType,
    pub(crate) state: ChannelState,
    pub(crate) socket: Option<Socket>,
    /// Connect target, listen address, or last datagram peer
    pub(crate) addr: Option<SocketAddrV4>,
    pub(crate) opaque: Option<usize>,
    pub(crate) ext_data: Option<Box<dyn Any>>,
    pub(crate) wbuf: WriteBuffer,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_recv: u64,
    pub(crate) buf_size: Option<usize>,
    pub(crate) notify_send: bool,
    /// Already queued for interest re-arming in the next cycle
    pub(crate) rearm: bool,
    /// `close` is running the extension hook
    pub(crate) closing: bool,
}

impl Channel {
    pub(crate) fn new(ctype: ChannelType, state: ChannelState, generation: u64) -> Self {
        Self {
            generation,
            ctype,
            state,
            socket: None,
            addr: None,
            opaque: None,
            ext_data: None,
            wbuf: WriteBuffer::new(),
            bytes_sent: 0,
            bytes_recv: 0,
            buf_size: None,
            notify_send: false,
            rearm: false,
            closing: false,
        }
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(Socket::raw_fd)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("ctype", &self.ctype)
            .field("state", &self.state)
            .field("fd", &self.fd())
            .field("addr", &self.addr)
            .field("cached", &self.wbuf.len())
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_recv", &self.bytes_recv)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ids_round_trip() {
        for id in 1..MAX_CHANNEL_TYPES as u8 {
            let t = ChannelType::from_id(id).unwrap();
            assert_eq!(t.id(), id);
        }
        assert_eq!(ChannelType::from_id(0), None);
        assert_eq!(ChannelType::from_id(8), None);
        assert!(ChannelType::Broadcast.is_internal());
        assert!(!ChannelType::Extension(5).is_internal());
    }

    #[test]
    fn states_are_ordered() {
        assert!(ChannelState::Closed < ChannelState::Disconnected);
        assert!(ChannelState::Connecting < ChannelState::Connected);
        assert!(ChannelState::Listening >= ChannelState::Connected);
    }

    #[test]
    fn handle_display() {
        let id = ChannelId { key: 3, generation: 9 };
        assert_eq!(id.to_string(), "chann#3.9");
        assert_eq!(id.token(), Token(3));
    }
}
