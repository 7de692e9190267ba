//! Pluggable channel types
//!
//! Every channel type id owns one slot in an [`ExtensionRegistry`]. Slots 1
//! to 3 hold the built-in [`Passthrough`] for stream, datagram and broadcast
//! channels; slots 4 to 7 are free for protocol layers such as TLS.
//!
//! An extension sits between the engine and the caller:
//!
//! - [`Extension::filter`] sees every message for its channels before the
//!   caller does and may rewrite or suppress it,
//! - [`Extension::recv`] and [`Extension::send`] replace the raw transport
//!   calls, typically wrapping [`Engine::raw_recv`] and [`Engine::raw_send`],
//! - the `on_*` hooks follow the channel lifecycle,
//! - [`Extension::state`] can hold back the state reported to the caller,
//!   e.g. keep a channel "connecting" while a handshake is in flight.
//!
//! Hooks receive the engine mutably, so an extension may send, disconnect
//! or arm timers from inside any hook.
//!
//! ```rust,no_run
//! use horizon_mnet::{ChannelId, ChannelType, Engine, Extension, Message, Result};
//! use std::rc::Rc;
//!
//! /// Counts received messages and otherwise stays out of the way
//! struct Counting;
//!
//! impl Extension for Counting {
//!     fn raw_type(&self) -> ChannelType { ChannelType::Stream }
//!     fn filter(&self, engine: &mut Engine, msg: &mut Message) -> bool {
//!         if let Some(n) = engine.ext_data_mut::<u64>(msg.channel) { *n += 1; }
//!         true
//!     }
//!     fn recv(&self, engine: &mut Engine, id: ChannelId, buf: &mut [u8]) -> Result<usize> {
//!         engine.raw_recv(id, buf)
//!     }
//!     fn send(&self, engine: &mut Engine, id: ChannelId, data: &[u8]) -> Result<usize> {
//!         engine.raw_send(id, data)
//!     }
//!     fn on_open(&self, engine: &mut Engine, id: ChannelId) {
//!         let _ = engine.set_ext_data(id, 0u64);
//!     }
//! }
//!
//! let mut engine = Engine::new()?;
//! engine.register(ChannelType::Extension(4), Rc::new(Counting))?;
//! let chann = engine.open(ChannelType::Extension(4))?;
//! # let _ = chann;
//! # Ok::<(), horizon_mnet::Error>(())
//! ```

use crate::channel::{ChannelId, ChannelState, ChannelType, MAX_CHANNEL_TYPES};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::message::Message;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Behaviour of one channel type
pub trait Extension {
    /// Internal transport the type runs on
    fn raw_type(&self) -> ChannelType;

    /// Inspects or rewrites `msg`; returning `false` suppresses it
    fn filter(&self, engine: &mut Engine, msg: &mut Message) -> bool;

    /// Reads application bytes; `Ok(0)` when nothing is available
    fn recv(&self, engine: &mut Engine, id: ChannelId, buf: &mut [u8]) -> Result<usize>;

    /// Writes application bytes; returns how many were taken, `Ok(0)` when
    /// the transport would block
    fn send(&self, engine: &mut Engine, id: ChannelId, data: &[u8]) -> Result<usize>;

    fn on_open(&self, _engine: &mut Engine, _id: ChannelId) {}
    fn on_close(&self, _engine: &mut Engine, _id: ChannelId) {}
    fn on_listen(&self, _engine: &mut Engine, _id: ChannelId) {}
    /// Called for the newly accepted channel
    fn on_accept(&self, _engine: &mut Engine, _id: ChannelId) {}
    fn on_connect(&self, _engine: &mut Engine, _id: ChannelId) {}
    /// Called before the socket is closed
    fn on_disconnect(&self, _engine: &mut Engine, _id: ChannelId) {}

    /// State reported to the caller for a channel whose engine state is `raw`
    fn state(&self, _engine: &Engine, _id: ChannelId, raw: ChannelState) -> ChannelState {
        raw
    }
}

/// Plain transport behaviour of the internal channel types
#[derive(Debug, Clone, Copy)]
pub struct Passthrough(pub ChannelType);

impl Extension for Passthrough {
    fn raw_type(&self) -> ChannelType {
        self.0
    }

    fn filter(&self, _engine: &mut Engine, _msg: &mut Message) -> bool {
        true
    }

    fn recv(&self, engine: &mut Engine, id: ChannelId, buf: &mut [u8]) -> Result<usize> {
        engine.raw_recv(id, buf)
    }

    fn send(&self, engine: &mut Engine, id: ChannelId, data: &[u8]) -> Result<usize> {
        engine.raw_send(id, data)
    }
}

/// Fixed table of channel types
pub struct ExtensionRegistry {
    slots: [Option<Rc<dyn Extension>>; MAX_CHANNEL_TYPES],
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    /// Registry with the internal transports in place
    pub fn new() -> Self {
        let mut slots: [Option<Rc<dyn Extension>>; MAX_CHANNEL_TYPES] = std::array::from_fn(|_| None);
        for t in [ChannelType::Stream, ChannelType::Datagram, ChannelType::Broadcast] {
            slots[t.id() as usize] = Some(Rc::new(Passthrough(t)));
        }
        Self { slots }
    }

    /// Installs `ext` for `ctype`
    ///
    /// Only extension slots can be registered, each at most once, and the
    /// extension must run on an internal transport.
    pub fn register(&mut self, ctype: ChannelType, ext: Rc<dyn Extension>) -> Result<()> {
        let idx = match ctype {
            ChannelType::Extension(n) if n > 3 && (n as usize) < MAX_CHANNEL_TYPES => n as usize,
            _ => return Err(Error::Registration("type id outside the extension range")),
        };
        if self.slots[idx].is_some() {
            return Err(Error::Registration("type slot already reserved"));
        }
        if !ext.raw_type().is_internal() {
            return Err(Error::Registration("raw type must be stream, datagram or broadcast"));
        }
        self.slots[idx] = Some(ext);
        log::info!("extension registered for type {}", idx);
        Ok(())
    }

    pub fn get(&self, ctype: ChannelType) -> Option<Rc<dyn Extension>> {
        self.slots.get(ctype.id() as usize).and_then(|s| s.clone())
    }

    pub fn is_reserved(&self, ctype: ChannelType) -> bool {
        self.get(ctype).is_some()
    }
}

/// Coordinates `accept` across processes sharing one listening socket
///
/// Installed with [`Engine::set_accept_balancer`]. The engine calls
/// `before` ahead of every accept attempt and skips the attempt when it
/// returns `false`; `after` runs once the attempt is over.
pub trait AcceptBalancer {
    fn before(&mut self, listen_fd: RawFd) -> bool;
    fn after(&mut self, listen_fd: RawFd);
}
