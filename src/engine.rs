//! Core engine: channel registry and channel operations
//!
//! [`Engine`] owns every channel, the readiness back-end, the timer clock,
//! the shared chunk pool and the extension table. Channels live in a slab
//! and are named by generation-checked [`ChannelId`]s.
//!
//! Closing a channel never frees it on the spot. The channel is marked
//! `Closed`, loses its socket and owner value, and is queued for
//! destruction at the start of the next [`Engine::poll`]. Messages and
//! readiness tuples of the current batch that still name it are skipped.
//!
//! # Error model
//!
//! - bad handles, arguments or states return `Err` with no side effect,
//! - would-block returns `Ok(0)`,
//! - a fatal socket error tears the socket down, queues one `Disconnect`
//!   message for the channel and returns the error to the caller.
//!
//! A disconnect requested by the caller does not produce a message.

use crate::addr::ChannAddr;
use crate::backend::Backend;
use crate::channel::{Channel, ChannelId, ChannelState, ChannelType, Socket};
use crate::config::{self, NetConfig};
use crate::error::{Error, Result};
use crate::extension::{AcceptBalancer, Extension, ExtensionRegistry};
use crate::message::{ActiveEvent, Event, Message};
use crate::raw;
use crate::timer::TimerClock;
use crate::write_buffer::ChunkPool;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Interest;
use slab::Slab;
use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// How a fresh socket is prepared before it is wrapped
#[derive(Clone, Copy, Debug)]
enum Prepare {
    /// bind, and `listen` with the backlog for streams
    Listen(i32),
    /// non-blocking stream `connect`
    Connect,
    /// datagram peer, nothing beyond options
    Peer,
}

/// Single-threaded network event loop
pub struct Engine {
    pub(crate) cfg: NetConfig,
    pub(crate) channels: Slab<Channel>,
    pub(crate) generation: u64,
    pub(crate) backend: Backend,
    pub(crate) timers: TimerClock,
    pub(crate) pool: ChunkPool,
    pub(crate) extensions: ExtensionRegistry,
    pub(crate) balancer: Option<Box<dyn AcceptBalancer>>,
    /// Closed channels awaiting destruction
    pub(crate) pending_drop: Vec<usize>,
    /// `Disconnect` messages raised outside readiness handling
    pub(crate) backlog: VecDeque<Message>,
    /// Channels whose interest is re-submitted in the next cycle
    pub(crate) rearm: Vec<ChannelId>,
    /// Next readiness tuple of the current batch
    pub(crate) cursor: usize,
    pub(crate) shut_down: bool,
}

impl Engine {
    /// Engine with the default [`NetConfig`]
    pub fn new() -> Result<Self> {
        Self::with_config(NetConfig::default())
    }

    pub fn with_config(cfg: NetConfig) -> Result<Self> {
        let backend = Backend::with_capacity(cfg.event_capacity)?;
        log::info!(
            "engine up, buf {} chunk {} events {}",
            cfg.buf_size,
            cfg.chunk_size,
            cfg.event_capacity
        );
        Ok(Self {
            pool: ChunkPool::new(cfg.pool_chunks, cfg.chunk_size),
            cfg,
            channels: Slab::new(),
            generation: 0,
            backend,
            timers: TimerClock::new(),
            extensions: ExtensionRegistry::new(),
            balancer: None,
            pending_drop: Vec::new(),
            backlog: VecDeque::new(),
            rearm: Vec::new(),
            cursor: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    /// Installs a protocol extension for an extension type slot
    pub fn register(&mut self, ctype: ChannelType, ext: Rc<dyn Extension>) -> Result<()> {
        self.extensions.register(ctype, ext)
    }

    /// Routes every stream accept through `balancer`; `None` restores plain accepts
    pub fn set_accept_balancer(&mut self, balancer: Option<Box<dyn AcceptBalancer>>) {
        log::debug!("accept balancer {}", if balancer.is_some() { "set" } else { "cleared" });
        self.balancer = balancer;
    }

    // ---- lookup ----

    pub(crate) fn slot(channels: &Slab<Channel>, id: ChannelId) -> Result<&Channel> {
        match channels.get(id.key) {
            Some(c) if c.generation == id.generation => Ok(c),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub(crate) fn slot_mut(channels: &mut Slab<Channel>, id: ChannelId) -> Result<&mut Channel> {
        match channels.get_mut(id.key) {
            Some(c) if c.generation == id.generation => Ok(c),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub(crate) fn chann(&self, id: ChannelId) -> Result<&Channel> {
        Self::slot(&self.channels, id)
    }

    pub(crate) fn chann_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        Self::slot_mut(&mut self.channels, id)
    }

    /// Handle of the channel stored under `key`
    pub(crate) fn id_of(&self, key: usize) -> Option<ChannelId> {
        self.channels
            .get(key)
            .map(|c| ChannelId { key, generation: c.generation })
    }

    pub(crate) fn ext_of(&self, id: ChannelId) -> Result<Rc<dyn Extension>> {
        let ctype = self.chann(id)?.ctype;
        self.extensions
            .get(ctype)
            .ok_or(Error::UnregisteredType(ctype.id()))
    }

    fn expect_state(&self, id: ChannelId, want: ChannelState, expected: &'static str) -> Result<()> {
        let actual = self.chann(id)?.state;
        if actual != want {
            return Err(Error::InvalidState { expected, actual });
        }
        Ok(())
    }

    fn require_usable(&self, id: ChannelId) -> Result<()> {
        let actual = self.state(id)?;
        if actual < ChannelState::Connected {
            return Err(Error::InvalidState { expected: "connected", actual });
        }
        Ok(())
    }

    // ---- lifecycle ----

    fn create(&mut self, ctype: ChannelType, state: ChannelState) -> ChannelId {
        self.generation += 1;
        let key = self
            .channels
            .insert(Channel::new(ctype, state, self.generation));
        let id = ChannelId { key, generation: self.generation };
        log::trace!("{} created, ctype {:?}, count {}", id, ctype, self.channels.len());
        id
    }

    /// Creates a disconnected channel of type `ctype`
    pub fn open(&mut self, ctype: ChannelType) -> Result<ChannelId> {
        if self.shut_down {
            return Err(Error::Shutdown);
        }
        let ext = self
            .extensions
            .get(ctype)
            .ok_or(Error::UnregisteredType(ctype.id()))?;
        let id = self.create(ctype, ChannelState::Disconnected);
        ext.on_open(self, id);
        Ok(id)
    }

    /// Closes the channel; it is destroyed at the start of the next poll
    ///
    /// Closing twice is a no-op.
    ///
    /// The extension's `on_close` runs after the socket is gone, while the
    /// channel still reports `Disconnected`.
    pub fn close(&mut self, id: ChannelId) -> Result<()> {
        let c = self.chann(id)?;
        if c.state == ChannelState::Closed || c.closing {
            return Ok(());
        }
        let ext = self.ext_of(id)?;
        self.disconnect_socket(id);
        self.chann_mut(id)?.closing = true;
        ext.on_close(self, id);

        // the hook may have re-armed a timer or reconnected
        self.disconnect_socket(id);
        self.timers.deactivate(id.key);
        let c = self.chann_mut(id)?;
        c.state = ChannelState::Closed;
        c.opaque = None;
        self.pending_drop.push(id.key);
        log::trace!("{} closed", id);
        Ok(())
    }

    /// Frees every channel closed since the last poll
    pub(crate) fn flush_pending_drops(&mut self) {
        for key in std::mem::take(&mut self.pending_drop) {
            let closed = matches!(self.channels.get(key), Some(c) if c.state == ChannelState::Closed);
            if !closed {
                continue;
            }
            let mut c = self.channels.remove(key);
            c.wbuf.clear(&mut self.pool);
            self.timers.deactivate(key);
            log::trace!("chann#{}.{} destroyed, count {}", key, c.generation, self.channels.len());
        }
    }

    /// Binds the channel to `host:port` and starts listening
    ///
    /// An empty `host` binds the wildcard address. A `backlog` of 0 uses
    /// [`NetConfig::tcp_backlog`]. Datagram channels are only bound.
    pub fn listen(&mut self, id: ChannelId, host: &str, port: u16, backlog: i32) -> Result<()> {
        let addr = host_addr(host, port)?;
        self.expect_state(id, ChannelState::Disconnected, "disconnected")?;
        let ext = self.ext_of(id)?;
        let raw_type = ext.raw_type();
        let backlog = if backlog > 0 { backlog } else { self.cfg.tcp_backlog };

        let mut sock = self.open_socket(id, raw_type, addr, Prepare::Listen(backlog)).map_err(|e| {
            log::error!("{} failed to listen on {}: {}", id, addr, e);
            e
        })?;
        self.backend.add_interest(id.key, &mut sock, Interest::READABLE)?;

        let c = self.chann_mut(id)?;
        c.socket = Some(sock);
        c.addr = Some(addr);
        c.state = ChannelState::Listening;
        log::debug!("{} listening on {}", id, addr);
        ext.on_listen(self, id);
        Ok(())
    }

    /// Starts connecting the channel to `host:port`
    ///
    /// Stream channels enter `Connecting` and report the outcome with a
    /// `Connected` or `Disconnect` message. Datagram channels only record the
    /// peer and are `Connected` on return.
    pub fn connect(&mut self, id: ChannelId, host: &str, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidArgument("port must be positive"));
        }
        let addr = host_addr(host, port)?;
        self.expect_state(id, ChannelState::Disconnected, "disconnected")?;
        let ext = self.ext_of(id)?;
        let raw_type = ext.raw_type();
        let stream = raw_type == ChannelType::Stream;

        let prepare = if stream { Prepare::Connect } else { Prepare::Peer };
        let mut sock = self.open_socket(id, raw_type, addr, prepare).map_err(|e| {
            log::error!("{} failed to connect {}: {}", id, addr, e);
            e
        })?;
        let interest = if stream { Interest::WRITABLE } else { Interest::READABLE };
        self.backend.add_interest(id.key, &mut sock, interest)?;

        let c = self.chann_mut(id)?;
        c.socket = Some(sock);
        c.addr = Some(addr);
        c.state = if stream { ChannelState::Connecting } else { ChannelState::Connected };
        log::debug!("{} {:?} to {}", id, c.state, addr);
        ext.on_connect(self, id);
        Ok(())
    }

    /// Creates and prepares a non-blocking socket for the channel
    fn open_socket(&self, id: ChannelId, raw_type: ChannelType, addr: SocketAddrV4, prepare: Prepare) -> io::Result<Socket> {
        let buf_size = self
            .chann(id)
            .ok()
            .and_then(|c| c.buf_size)
            .unwrap_or(self.cfg.buf_size);
        let fd = raw::socket(raw_type)?;
        let setup = || -> io::Result<()> {
            config::apply_socket_options(fd, raw_type, buf_size, &self.cfg)?;
            raw::set_nonblocking(fd, true)?;
            match prepare {
                Prepare::Listen(backlog) => {
                    raw::bind_raw(fd, addr)?;
                    if raw_type == ChannelType::Stream {
                        raw::listen_raw(fd, backlog)?;
                    }
                }
                Prepare::Connect => {
                    raw::connect_raw(fd, addr)?;
                }
                Prepare::Peer => {}
            }
            Ok(())
        };
        if let Err(e) = setup() {
            raw::close(fd);
            return Err(e);
        }
        log::trace!("{} socket fd {} ready", id, fd);

        // SAFETY: `fd` is a fresh socket of the matching kind and nothing
        // else owns it.
        let sock = unsafe {
            match (raw_type, prepare) {
                (ChannelType::Stream, Prepare::Listen(_)) => {
                    Socket::Listener(TcpListener::from_std(raw::tcp_listener_from_os(fd)))
                }
                (ChannelType::Stream, _) => Socket::Stream(TcpStream::from_std(raw::tcp_stream_from_os(fd))),
                _ => Socket::Datagram(UdpSocket::from_std(raw::udp_from_os(fd))),
            }
        };
        Ok(sock)
    }

    /// Closes the socket and returns the channel to `Disconnected`
    ///
    /// Calling it on a channel without a socket does nothing.
    pub fn disconnect(&mut self, id: ChannelId) -> Result<()> {
        self.chann(id)?;
        self.disconnect_socket(id);
        Ok(())
    }

    /// Tears the socket down; `true` when there was one to tear down
    pub(crate) fn disconnect_socket(&mut self, id: ChannelId) -> bool {
        let Ok(ext) = self.ext_of(id) else { return false };
        match self.chann_mut(id) {
            Ok(c) if c.socket.is_some() && c.state > ChannelState::Disconnected => {
                c.state = ChannelState::Disconnected;
            }
            _ => return false,
        }
        ext.on_disconnect(self, id);

        let Ok(c) = Self::slot_mut(&mut self.channels, id) else { return false };
        if let Some(mut sock) = c.socket.take() {
            if let Err(e) = self.backend.forget(id.key, &mut sock) {
                log::debug!("{} deregister failed: {}", id, e);
            }
        }
        c.wbuf.clear(&mut self.pool);
        c.notify_send = false;
        self.timers.deactivate(id.key);
        log::debug!("{} disconnected", id);
        true
    }

    /// Disconnects after a fatal error and queues the `Disconnect` message
    pub(crate) fn fail(&mut self, id: ChannelId, err: i32) {
        if err == 0 {
            log::debug!("{} closed by peer", id);
        } else {
            log::error!("{} socket error {}: {}", id, err, io::Error::from_raw_os_error(err));
        }
        if self.disconnect_socket(id) {
            if let Some(msg) = self.emit(id, Event::Disconnect, None, err) {
                self.backlog.push_back(msg);
            }
        }
    }

    /// Builds a message for `id` and runs it through the channel's filter
    pub(crate) fn emit(&mut self, id: ChannelId, event: Event, accepted: Option<ChannelId>, err: i32) -> Option<Message> {
        let opaque = self.chann(id).ok()?.opaque;
        let ext = self.ext_of(id).ok()?;
        let mut msg = Message { event, err, channel: id, accepted, opaque };
        if ext.filter(self, &mut msg) {
            Some(msg)
        } else {
            log::trace!("{} {:?} suppressed by filter", id, event);
            None
        }
    }

    // ---- data ----

    /// Reads into `buf`; `Ok(0)` when nothing is available
    ///
    /// A stream peer that closed the connection is reported as
    /// `ErrorKind::UnexpectedEof`, after the channel was disconnected and a
    /// `Disconnect` message with error 0 was queued.
    pub fn recv(&mut self, id: ChannelId, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty receive buffer"));
        }
        self.require_usable(id)?;
        let ext = self.ext_of(id)?;
        match ext.recv(self, id, buf) {
            Ok(n) => {
                if let Ok(c) = self.chann_mut(id) {
                    c.bytes_recv += n as u64;
                }
                Ok(n)
            }
            Err(e) => {
                self.fail(id, e.raw_os_error());
                Err(e)
            }
        }
    }

    /// Sends `data`, queueing whatever the socket does not take
    ///
    /// Returns `data.len()` on success: accepted, not necessarily
    /// transmitted. Bytes are never reordered; once something is queued,
    /// later sends append to the queue.
    pub fn send(&mut self, id: ChannelId, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty send buffer"));
        }
        self.require_usable(id)?;

        let c = Self::slot_mut(&mut self.channels, id)?;
        if !c.wbuf.is_empty() {
            c.wbuf.push(data, &mut self.pool);
            log::trace!("{} still caching, {} bytes in {} chunks", id, c.wbuf.len(), c.wbuf.chunk_count());
            return Ok(data.len());
        }

        let ext = self.ext_of(id)?;
        let sent = match ext.send(self, id, data) {
            Ok(n) => n.min(data.len()),
            Err(e) => {
                self.fail(id, e.raw_os_error());
                return Err(e);
            }
        };

        let c = Self::slot_mut(&mut self.channels, id)?;
        c.bytes_sent += sent as u64;
        if sent < data.len() {
            c.wbuf.push(&data[sent..], &mut self.pool);
            log::trace!("{} cache {} of {}", id, data.len() - sent, data.len());
            if let Some(sock) = c.socket.as_mut() {
                self.backend.add_interest(id.key, sock, Interest::WRITABLE)?;
            }
        }
        Ok(data.len())
    }

    /// Plain transport read, bypassing the extension
    ///
    /// Meant for [`Extension::recv`] implementations. Datagram reads record
    /// the sender as the channel's address.
    pub fn raw_recv(&mut self, id: ChannelId, buf: &mut [u8]) -> Result<usize> {
        let c = self.chann_mut(id)?;
        let res = match c.socket.as_mut() {
            Some(Socket::Stream(s)) => match s.read(buf) {
                Ok(0) if !buf.is_empty() => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                other => other,
            },
            Some(Socket::Datagram(u)) => match u.recv_from(buf) {
                Ok((n, SocketAddr::V4(from))) => {
                    c.addr = Some(from);
                    Ok(n)
                }
                Ok((n, _)) => Ok(n),
                Err(e) => Err(e),
            },
            _ => {
                return Err(Error::InvalidState { expected: "connected", actual: c.state });
            }
        };
        would_block_as_zero(res)
    }

    /// Plain transport write, bypassing the extension and the write queue
    ///
    /// Meant for [`Extension::send`] implementations. Datagrams go to the
    /// channel's address.
    pub fn raw_send(&mut self, id: ChannelId, data: &[u8]) -> Result<usize> {
        let c = self.chann_mut(id)?;
        let res = match c.socket.as_mut() {
            Some(Socket::Stream(s)) => s.write(data),
            Some(Socket::Datagram(u)) => match c.addr {
                Some(to) => u.send_to(data, SocketAddr::V4(to)),
                None => return Err(Error::InvalidArgument("datagram channel has no peer")),
            },
            _ => {
                return Err(Error::InvalidState { expected: "connected", actual: c.state });
            }
        };
        would_block_as_zero(res)
    }

    /// Sends queued bytes; `true` once the queue is empty
    pub(crate) fn flush_cached(&mut self, id: ChannelId) -> bool {
        let Ok(ext) = self.ext_of(id) else { return false };
        let mut wbuf = match self.chann_mut(id) {
            Ok(c) => std::mem::take(&mut c.wbuf),
            Err(_) => return false,
        };

        let mut failed = None;
        while let Some(head) = wbuf.front() {
            match ext.send(self, id, head) {
                Ok(0) => break,
                Ok(n) => {
                    let n = n.min(head.len());
                    wbuf.consume(n, &mut self.pool);
                    if let Ok(c) = self.chann_mut(id) {
                        c.bytes_sent += n as u64;
                    }
                }
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failed {
            wbuf.clear(&mut self.pool);
            self.fail(id, e.raw_os_error());
            return false;
        }
        let Ok(c) = Self::slot_mut(&mut self.channels, id) else {
            wbuf.clear(&mut self.pool);
            return false;
        };
        if c.socket.is_none() {
            wbuf.clear(&mut self.pool);
            return false;
        }
        // bytes queued by a hook while the queue was out go after the rest
        let mut queued = std::mem::replace(&mut c.wbuf, wbuf);
        c.wbuf.append(&mut queued);
        c.wbuf.is_empty()
    }

    // ---- notifications ----

    /// Switches `Send` notifications or the repeating timer of a channel
    pub fn active_event(&mut self, id: ChannelId, event: ActiveEvent) -> Result<()> {
        match event {
            ActiveEvent::Send(on) => {
                let actual = self.state(id)?;
                if actual != ChannelState::Connected {
                    return Err(Error::InvalidState { expected: "connected", actual });
                }
                let c = Self::slot_mut(&mut self.channels, id)?;
                if c.notify_send == on {
                    return Ok(());
                }
                c.notify_send = on;
                if let Some(sock) = c.socket.as_mut() {
                    if on {
                        self.backend.add_interest(id.key, sock, Interest::WRITABLE)?;
                    } else if c.wbuf.is_empty() {
                        self.backend.del_interest(id.key, sock, Interest::WRITABLE)?;
                    }
                }
                log::trace!("{} send notifications {}", id, on);
                Ok(())
            }
            ActiveEvent::Timer(every) => {
                let actual = self.chann(id)?.state;
                if actual == ChannelState::Closed {
                    return Err(Error::InvalidState { expected: "open", actual });
                }
                if every.is_zero() {
                    self.timers.deactivate(id.key);
                } else {
                    self.timers.activate(id.key, every);
                }
                Ok(())
            }
        }
    }

    // ---- datagram helpers ----

    fn expect_datagram(&self, id: ChannelId) -> Result<()> {
        match self.ext_of(id)?.raw_type() {
            ChannelType::Datagram | ChannelType::Broadcast => Ok(()),
            _ => Err(Error::InvalidArgument("not a datagram channel")),
        }
    }

    /// Receives one datagram and reports its sender
    pub fn dgram_recv(&mut self, id: ChannelId, buf: &mut [u8]) -> Result<(usize, ChannAddr)> {
        self.expect_datagram(id)?;
        let n = self.recv(id, buf)?;
        let from = self.socket_addr(id)?;
        Ok((n, from))
    }

    /// Sends one datagram to `to`
    ///
    /// A disconnected channel is connected to `to` first; a connected one
    /// is retargeted.
    pub fn dgram_send(&mut self, id: ChannelId, to: &ChannAddr, data: &[u8]) -> Result<usize> {
        self.expect_datagram(id)?;
        if self.state(id)? >= ChannelState::Connected {
            let target = to.to_socket_addr()?;
            self.chann_mut(id)?.addr = Some(target);
        } else {
            self.connect(id, &to.ip, to.port)?;
        }
        self.send(id, data)
    }

    // ---- introspection ----

    pub fn fd(&self, id: ChannelId) -> Result<Option<RawFd>> {
        Ok(self.chann(id)?.fd())
    }

    pub fn channel_type(&self, id: ChannelId) -> Result<ChannelType> {
        Ok(self.chann(id)?.ctype)
    }

    /// State as reported by the channel's extension
    pub fn state(&self, id: ChannelId) -> Result<ChannelState> {
        let raw = self.chann(id)?.state;
        let ext = self.ext_of(id)?;
        Ok(ext.state(self, id, raw))
    }

    /// Bytes waiting in the write queue
    pub fn cached(&self, id: ChannelId) -> Result<usize> {
        Ok(self.chann(id)?.wbuf.len())
    }

    /// Chunks in the write queue
    pub fn cached_chunks(&self, id: ChannelId) -> Result<usize> {
        Ok(self.chann(id)?.wbuf.chunk_count())
    }

    /// Total bytes sent (`sent == true`) or received
    pub fn bytes(&self, id: ChannelId, sent: bool) -> Result<u64> {
        let c = self.chann(id)?;
        Ok(if sent { c.bytes_sent } else { c.bytes_recv })
    }

    /// Connect target, listen address, or last datagram sender
    pub fn socket_addr(&self, id: ChannelId) -> Result<ChannAddr> {
        self.chann(id)?
            .addr
            .map(ChannAddr::from)
            .ok_or(Error::InvalidArgument("channel has no address"))
    }

    /// Address the socket is bound to, e.g. the port picked for `listen(.., 0, ..)`
    pub fn local_addr(&self, id: ChannelId) -> Result<ChannAddr> {
        let fd = self
            .chann(id)?
            .fd()
            .ok_or(Error::InvalidArgument("channel has no socket"))?;
        Ok(raw::local_addr(fd)?.into())
    }

    /// Remote end of a connected stream channel
    pub fn peer_addr(&self, id: ChannelId) -> Result<ChannAddr> {
        self.require_usable(id)?;
        match &self.chann(id)?.socket {
            Some(Socket::Stream(s)) => match s.peer_addr()? {
                SocketAddr::V4(v4) => Ok(v4.into()),
                SocketAddr::V6(_) => Err(Error::InvalidArgument("peer is not IPv4")),
            },
            _ => Err(Error::InvalidArgument("not a connected stream channel")),
        }
    }

    /// Socket buffer hint; applied at once when the channel has a socket
    pub fn set_bufsize(&mut self, id: ChannelId, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("buffer size must be positive"));
        }
        let c = self.chann_mut(id)?;
        c.buf_size = Some(size);
        if let Some(fd) = c.fd() {
            let sz = size.min(i32::MAX as usize) as i32;
            raw::set_send_buffer(fd, sz)?;
            raw::set_recv_buffer(fd, sz)?;
        }
        Ok(())
    }

    /// Live channels, closed ones included until they are destroyed
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn set_opaque(&mut self, id: ChannelId, opaque: Option<usize>) -> Result<()> {
        self.chann_mut(id)?.opaque = opaque;
        Ok(())
    }

    pub fn opaque(&self, id: ChannelId) -> Result<Option<usize>> {
        Ok(self.chann(id)?.opaque)
    }

    // ---- extension state ----

    /// Attaches extension state to the channel, replacing any previous value
    pub fn set_ext_data<T: Any>(&mut self, id: ChannelId, data: T) -> Result<()> {
        self.chann_mut(id)?.ext_data = Some(Box::new(data));
        Ok(())
    }

    pub fn ext_data<T: Any>(&self, id: ChannelId) -> Option<&T> {
        self.chann(id).ok()?.ext_data.as_ref()?.downcast_ref()
    }

    pub fn ext_data_mut<T: Any>(&mut self, id: ChannelId) -> Option<&mut T> {
        self.chann_mut(id).ok()?.ext_data.as_mut()?.downcast_mut()
    }

    /// Detaches the extension state if it is a `T`
    pub fn take_ext_data<T: Any>(&mut self, id: ChannelId) -> Option<Box<T>> {
        let c = self.chann_mut(id).ok()?;
        match c.ext_data.take()?.downcast::<T>() {
            Ok(data) => Some(data),
            Err(other) => {
                c.ext_data = Some(other);
                None
            }
        }
    }

    // ---- engine-wide ----

    /// Rebuilds the OS event queue and registers every socket again
    ///
    /// Meant for a child process after `fork`, whose inherited queue is
    /// shared with the parent.
    pub fn reset_event_queue(&mut self) -> Result<()> {
        let registrations = self.backend.reset()?;
        for (key, interest) in registrations {
            let Some(c) = self.channels.get_mut(key) else { continue };
            let Some(sock) = c.socket.take() else { continue };
            let mut sock = sock.renew();
            if let Err(e) = self.backend.set_interest(key, &mut sock, Some(interest)) {
                log::error!("chann#{} re-register failed: {}", key, e);
            }
            c.socket = Some(sock);
        }
        self.rearm.clear();
        for c in self.channels.iter_mut().map(|(_, c)| c) {
            c.rearm = false;
        }
        self.cursor = 0;
        Ok(())
    }

    /// Logs the channel table when `detail` is set; returns the channel count
    pub fn report(&self, detail: bool) -> usize {
        if detail {
            log::info!(
                "{} channels, {} timers, {} registrations, {} spare chunks",
                self.channels.len(),
                self.timers.len(),
                self.backend.len(),
                self.pool.available_count()
            );
            for (key, c) in self.channels.iter() {
                log::info!("  chann#{}.{} {:?}", key, c.generation, c);
            }
        }
        self.channels.len()
    }

    /// Closes and frees every channel; further opens fail
    ///
    /// Runs on drop as well. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .map(|(key, c)| ChannelId { key, generation: c.generation })
            .collect();
        for id in ids {
            let _ = self.close(id);
        }
        self.flush_pending_drops();
        self.backlog.clear();
        self.rearm.clear();
        self.shut_down = true;
        log::info!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parses an IPv4 literal; an empty host means the wildcard address
fn host_addr(host: &str, port: u16) -> Result<SocketAddrV4> {
    if host.is_empty() {
        return Ok(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    }
    ChannAddr::new(host, port).to_socket_addr()
}

fn would_block_as_zero(res: io::Result<usize>) -> Result<usize> {
    match res {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e.into()),
    }
}
