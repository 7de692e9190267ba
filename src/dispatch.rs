//! Poll cycle and message iteration
//!
//! One cycle is [`Engine::poll`] followed by [`Engine::next_message`] until
//! it returns `None`:
//!
//! 1. channels closed during the previous cycle are destroyed,
//! 2. channels that emitted `Recv` or `Send`, or whose readiness was left
//!    unread, get their interest re-submitted,
//! 3. the back-end waits, at most until the nearest timer is due,
//! 4. due timers are frozen for this cycle.
//!
//! `next_message` then yields due `Timer` messages first, then queued
//! `Disconnect` messages, then readiness-driven messages in the order the
//! OS reported them. Every message passes through the channel's
//! [`Extension::filter`](crate::Extension::filter) and may be suppressed
//! there.
//!
//! The back-end is edge-triggered. Re-submitting interest (step 2) makes
//! still-pending readiness show up again, so a caller that leaves data
//! unread keeps receiving `Recv`, and a listening stream channel accepts
//! until the kernel queue is empty, one `Accept` message per peer.

use crate::backend::{Ready, Readiness};
use crate::channel::{ChannelId, ChannelState, ChannelType, Channel, Socket};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::message::{Event, Message};
use crate::raw;
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Outcome of one [`Engine::poll`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSummary {
    /// Channels alive after destroying the closed ones
    pub channels: usize,
    /// Readiness tuples fetched by this wait
    pub ready: usize,
}

impl Engine {
    /// Runs one wait; `None` waits until something is ready or a timer is due
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<PollSummary> {
        if self.shut_down {
            return Err(Error::Shutdown);
        }
        self.flush_pending_drops();
        self.requeue_unread();
        self.rearm_channels();

        let wait = match (timeout, self.timers.next_deadline()) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (None, d) => d,
            (t, None) => t,
        };
        let ready = self.backend.poll(wait).map_err(|e| {
            log::error!("event wait failed: {}", e);
            e
        })?;
        self.cursor = 0;
        self.timers.schedule();
        Ok(PollSummary { channels: self.channels.len(), ready })
    }

    /// Next message of the current cycle
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if let Some(key) = self.timers.next() {
                if let Some(id) = self.id_of(key) {
                    if let Some(msg) = self.emit(id, Event::Timer, None, 0) {
                        return Some(msg);
                    }
                }
                continue;
            }

            if let Some(msg) = self.backlog.pop_front() {
                return Some(msg);
            }

            let ready = self.backend.ready(self.cursor)?;
            let (msg, stay) = self.on_ready(ready);
            if !stay {
                self.cursor += 1;
            }
            if msg.is_some() {
                return msg;
            }
        }
    }

    /// Polls once and hands every message of the cycle to `handler`
    ///
    /// Returns the number of messages delivered.
    pub fn dispatch<F>(&mut self, timeout: Option<Duration>, mut handler: F) -> Result<usize>
    where
        F: FnMut(&mut Engine, Message),
    {
        self.poll(timeout)?;
        let mut delivered = 0;
        while let Some(msg) = self.next_message() {
            handler(self, msg);
            delivered += 1;
        }
        Ok(delivered)
    }

    pub(crate) fn mark_rearm(&mut self, id: ChannelId) {
        if let Ok(c) = self.chann_mut(id) {
            if !c.rearm {
                c.rearm = true;
                self.rearm.push(id);
            }
        }
    }

    /// Readiness the caller never pulled must not be lost to edge triggering
    fn requeue_unread(&mut self) {
        let tokens: Vec<usize> = self
            .backend
            .remaining(self.cursor)
            .iter()
            .filter(|r| self.backend.is_current(r))
            .map(|r| r.token)
            .collect();
        for token in tokens {
            if let Some(id) = self.id_of(token) {
                self.mark_rearm(id);
            }
        }
        self.cursor = 0;
    }

    fn rearm_channels(&mut self) {
        for id in std::mem::take(&mut self.rearm) {
            let Ok(c) = Engine::slot_mut(&mut self.channels, id) else { continue };
            c.rearm = false;
            if let Some(sock) = c.socket.as_mut() {
                if let Err(e) = self.backend.rearm(id.key, sock) {
                    log::debug!("{} rearm failed: {}", id, e);
                }
            }
        }
    }

    /// Handles one readiness tuple
    ///
    /// Returns the message to deliver, if any, and whether the same tuple
    /// must be handled again. Tuples of a socket that was torn down earlier
    /// in the batch are dropped, even when the channel got a new socket.
    fn on_ready(&mut self, ready: Ready) -> (Option<Message>, bool) {
        if !self.backend.is_current(&ready) {
            log::trace!("stale {:?} for chann#{} dropped", ready.readiness, ready.token);
            return (None, false);
        }
        let Some(id) = self.id_of(ready.token) else { return (None, false) };
        let (state, fd) = match self.chann(id) {
            Ok(Channel { state, socket: Some(sock), .. }) => (*state, sock.raw_fd()),
            _ => return (None, false),
        };
        if state == ChannelState::Closed {
            return (None, false);
        }
        let Ok(raw_type) = self.ext_of(id).map(|ext| ext.raw_type()) else {
            return (None, false);
        };
        log::trace!("{} {:?} in {:?}", id, ready.readiness, state);

        match (ready.readiness, state) {
            (Readiness::Error, _) => {
                let err = match raw::take_error(fd) {
                    Ok(err) => err,
                    Err(e) => e.raw_os_error().unwrap_or(0),
                };
                log::error!("{} got error {}: {}", id, err, io::Error::from_raw_os_error(err));
                (self.disconnect_with(id, err), false)
            }
            (Readiness::Hangup, _) => {
                log::debug!("{} hang-up", id);
                (self.disconnect_with(id, 0), false)
            }
            (Readiness::Read, ChannelState::Listening) if raw_type == ChannelType::Stream => {
                match self.accept(id, fd) {
                    Some(child) => (self.emit(id, Event::Accept, Some(child), 0), true),
                    None => (None, false),
                }
            }
            (Readiness::Read, ChannelState::Listening | ChannelState::Connected) => {
                self.mark_rearm(id);
                (self.emit(id, Event::Recv, None, 0), false)
            }
            (Readiness::Write, ChannelState::Connecting) => (self.finish_connect(id, fd), false),
            (Readiness::Write, ChannelState::Listening | ChannelState::Connected) => {
                (self.on_writable(id), false)
            }
            _ => (None, false),
        }
    }

    fn disconnect_with(&mut self, id: ChannelId, err: i32) -> Option<Message> {
        if self.disconnect_socket(id) {
            self.emit(id, Event::Disconnect, None, err)
        } else {
            None
        }
    }

    /// Completes a non-blocking connect from its `SO_ERROR`
    fn finish_connect(&mut self, id: ChannelId, fd: raw::OsSocket) -> Option<Message> {
        let err = match raw::take_error(fd) {
            Ok(err) => err,
            Err(e) => e.raw_os_error().unwrap_or(-1),
        };
        if err != 0 {
            log::error!("{} connect failed {}: {}", id, err, io::Error::from_raw_os_error(err));
            return self.disconnect_with(id, err);
        }

        let c = Engine::slot_mut(&mut self.channels, id).ok()?;
        if let Some(sock) = c.socket.as_mut() {
            if let Err(e) = self.backend.set_interest(id.key, sock, Some(Interest::READABLE)) {
                log::error!("{} read interest failed: {}", id, e);
                let err = e.raw_os_error().unwrap_or(0);
                return self.disconnect_with(id, err);
            }
        }
        c.state = ChannelState::Connected;
        log::debug!("{} connected", id);
        self.emit(id, Event::Connected, None, 0)
    }

    /// Drains the write queue on write readiness
    fn on_writable(&mut self, id: ChannelId) -> Option<Message> {
        if !self.flush_cached(id) {
            return None;
        }
        let c = Engine::slot_mut(&mut self.channels, id).ok()?;
        if c.notify_send {
            self.mark_rearm(id);
            return self.emit(id, Event::Send, None, 0);
        }
        if let Some(sock) = c.socket.as_mut() {
            if let Err(e) = self.backend.del_interest(id.key, sock, Interest::WRITABLE) {
                log::debug!("{} write interest removal failed: {}", id, e);
            }
        }
        None
    }

    /// Accepts one pending peer of a listening stream channel
    fn accept(&mut self, id: ChannelId, listen_fd: raw::OsSocket) -> Option<ChannelId> {
        if let Some(balancer) = self.balancer.as_mut() {
            if !balancer.before(listen_fd) {
                self.mark_rearm(id);
                return None;
            }
        }
        let accepted = match &self.chann(id).ok()?.socket {
            Some(Socket::Listener(l)) => l.accept(),
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        };
        if let Some(balancer) = self.balancer.as_mut() {
            balancer.after(listen_fd);
        }

        // peers left in the kernel queue need another edge
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                log::error!("{} accept failed: {}", id, e);
                self.mark_rearm(id);
                return None;
            }
        };
        if self.cfg.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("{} nodelay on accepted peer failed: {}", id, e);
            }
        }

        let ctype = self.chann(id).ok()?.ctype;
        self.generation += 1;
        let generation = self.generation;
        let entry = self.channels.vacant_entry();
        let child = ChannelId { key: entry.key(), generation };
        let mut sock = Socket::Stream(stream);
        if let Err(e) = self.backend.add_interest(child.key, &mut sock, Interest::READABLE) {
            log::error!("{} cannot register accepted peer {}: {}", id, peer, e);
            self.mark_rearm(id);
            return None;
        }
        let mut chann = Channel::new(ctype, ChannelState::Connected, generation);
        chann.socket = Some(sock);
        chann.addr = match peer {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        };
        entry.insert(chann);
        log::debug!("{} accepted {} from {}, count {}", id, child, peer, self.channels.len());

        if let Ok(ext) = self.ext_of(child) {
            ext.on_accept(self, child);
        }
        Some(child)
    }
}
