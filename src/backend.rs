//! Readiness back-end
//!
//! This module wraps `mio::Poll`, which uses the best readiness mechanism
//! of the platform:
//!
//! - **Linux**: epoll
//! - **macOS**: kqueue
//! - **BSD**: kqueue
//!
//! The engine thinks in terms of read and write interest per channel.
//! [`Backend`] records the current interest of every registered channel and
//! turns additions and removals into `register`/`reregister`/`deregister`
//! calls, so an empty interest set always means "not registered".
//!
//! After a wait, raw `mio` events are normalized into [`Ready`] tuples:
//!
//! - an error flag yields a single [`Readiness::Error`],
//! - a read hang-up without readable data yields [`Readiness::Hangup`],
//! - readable and writable halves yield separate `Read` and `Write` tuples,
//!   so neither edge is lost when both are reported at once.
//!
//! Every fresh registration of a token gets a new epoch, and each tuple
//! carries the epoch it was reported under. A tuple whose token was
//! deregistered and registered again since the wait belongs to the old
//! socket; [`Backend::is_current`] tells the two apart.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::{io, time::Duration};

/// Normalized readiness of one channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Read,
    Write,
    Error,
    Hangup,
}

/// One readiness tuple of the current batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ready {
    pub token: usize,
    pub readiness: Readiness,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct Backend {
    poll: Poll,
    events: Events,
    capacity: usize,
    interests: HashMap<usize, Interest>,
    epochs: HashMap<usize, u64>,
    epoch: u64,
    ready: Vec<Ready>,
}

impl Backend {
    /// Creates a back-end fetching up to `event_capacity` events per wait
    pub fn with_capacity(event_capacity: usize) -> io::Result<Self> {
        let capacity = event_capacity.max(1);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            capacity,
            interests: HashMap::new(),
            epochs: HashMap::new(),
            epoch: 0,
            ready: Vec::with_capacity(capacity),
        })
    }

    /// Current interest of `token`
    pub fn interest(&self, token: usize) -> Option<Interest> {
        self.interests.get(&token).copied()
    }

    /// Adds `interest` to the registration of `token`
    pub fn add_interest<S>(&mut self, token: usize, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let next = match self.interest(token) {
            Some(cur) => cur.add(interest),
            None => interest,
        };
        self.set_interest(token, source, Some(next))
    }

    /// Removes `interest` from the registration of `token`
    pub fn del_interest<S>(&mut self, token: usize, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let next = self.interest(token).and_then(|cur| cur.remove(interest));
        self.set_interest(token, source, next)
    }

    /// Replaces the whole registration of `token`; `None` deregisters
    pub fn set_interest<S>(&mut self, token: usize, source: &mut S, interest: Option<Interest>) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let registry = self.poll.registry();
        match (self.interests.get(&token).copied(), interest) {
            (None, None) => return Ok(()),
            (Some(cur), Some(next)) if cur == next => return Ok(()),
            (None, Some(next)) => {
                registry.register(source, Token(token), next)?;
                self.epoch += 1;
                self.epochs.insert(token, self.epoch);
            }
            (Some(_), Some(next)) => registry.reregister(source, Token(token), next)?,
            (Some(_), None) => {
                registry.deregister(source)?;
                self.epochs.remove(&token);
            }
        }
        log::trace!("chann {} interest {:?}", token, interest);
        match interest {
            Some(next) => self.interests.insert(token, next),
            None => self.interests.remove(&token),
        };
        Ok(())
    }

    /// Re-submits the current registration so pending readiness is reported again
    pub fn rearm<S>(&mut self, token: usize, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        match self.interest(token) {
            Some(cur) => self.poll.registry().reregister(source, Token(token), cur),
            None => Ok(()),
        }
    }

    /// Drops the registration of `token`
    pub fn forget<S>(&mut self, token: usize, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.set_interest(token, source, None)
    }

    /// Waits for readiness and normalizes the result; returns the tuple count
    ///
    /// An interrupted wait reports zero tuples.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }
        for ev in self.events.iter() {
            let token = ev.token().0;
            let epoch = self.epochs.get(&token).copied().unwrap_or(0);
            let mut push = |readiness| self.ready.push(Ready { token, readiness, epoch });
            if ev.is_error() {
                push(Readiness::Error);
                continue;
            }
            if ev.is_readable() {
                push(Readiness::Read);
            } else if ev.is_read_closed() {
                push(Readiness::Hangup);
            }
            if ev.is_writable() {
                push(Readiness::Write);
            }
        }
        Ok(self.ready.len())
    }

    /// Tuple `index` of the current batch
    pub fn ready(&self, index: usize) -> Option<Ready> {
        self.ready.get(index).copied()
    }

    /// `false` when the tuple's registration was dropped after the wait
    pub fn is_current(&self, ready: &Ready) -> bool {
        self.epochs.get(&ready.token) == Some(&ready.epoch)
    }

    /// Tuples of the current batch from `index` on
    pub fn remaining(&self, index: usize) -> &[Ready] {
        self.ready.get(index..).unwrap_or(&[])
    }

    /// Replaces the OS poller with a fresh one
    ///
    /// Every registration is forgotten; the previous interests are returned
    /// so the caller can register its sources again. Sources registered with
    /// the old poller must be rebuilt from their descriptors first, see
    /// `Socket::renew`.
    pub fn reset(&mut self) -> io::Result<Vec<(usize, Interest)>> {
        self.poll = Poll::new()?;
        self.events = Events::with_capacity(self.capacity);
        self.ready.clear();
        self.epochs.clear();
        log::debug!("event queue reset, {} registrations dropped", self.interests.len());
        Ok(self.interests.drain().collect())
    }

    /// Registered tokens
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;

    #[test]
    fn test_backend_creation() {
        let backend = Backend::with_capacity(64);
        assert!(backend.is_ok());
        assert!(backend.unwrap().is_empty());
    }

    #[test]
    fn test_interest_add_and_remove() {
        let mut backend = Backend::with_capacity(16).unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        backend.add_interest(1, &mut socket, Interest::READABLE).unwrap();
        backend.add_interest(1, &mut socket, Interest::WRITABLE).unwrap();
        assert_eq!(backend.interest(1), Some(Interest::READABLE | Interest::WRITABLE));

        backend.del_interest(1, &mut socket, Interest::READABLE).unwrap();
        assert_eq!(backend.interest(1), Some(Interest::WRITABLE));

        backend.del_interest(1, &mut socket, Interest::WRITABLE).unwrap();
        assert_eq!(backend.interest(1), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_udp_write_readiness() {
        let mut backend = Backend::with_capacity(16).unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        backend.add_interest(7, &mut socket, Interest::WRITABLE).unwrap();

        let n = backend.poll(Some(Duration::from_millis(500))).unwrap();
        assert!(n >= 1);
        let ready = backend.ready(0).unwrap();
        assert_eq!((ready.token, ready.readiness), (7, Readiness::Write));
        assert!(backend.is_current(&ready));
        assert_eq!(backend.remaining(n).len(), 0);
    }

    #[test]
    fn test_reregistered_token_makes_tuples_stale() {
        let mut backend = Backend::with_capacity(16).unwrap();
        let mut old = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        backend.add_interest(3, &mut old, Interest::WRITABLE).unwrap();
        assert!(backend.poll(Some(Duration::from_millis(500))).unwrap() >= 1);
        let ready = backend.ready(0).unwrap();

        backend.forget(3, &mut old).unwrap();
        assert!(!backend.is_current(&ready));

        let mut fresh = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        backend.add_interest(3, &mut fresh, Interest::WRITABLE).unwrap();
        assert!(!backend.is_current(&ready));

        // interest changes on a live registration keep the epoch
        assert!(backend.poll(Some(Duration::from_millis(500))).unwrap() >= 1);
        let ready = backend.ready(0).unwrap();
        backend.add_interest(3, &mut fresh, Interest::READABLE).unwrap();
        assert!(backend.is_current(&ready));
    }

    #[test]
    fn test_reset_returns_registrations() {
        let mut backend = Backend::with_capacity(16).unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        backend.add_interest(2, &mut socket, Interest::READABLE).unwrap();

        let old = backend.reset().unwrap();
        assert_eq!(old, vec![(2, Interest::READABLE)]);
        assert!(backend.is_empty());

        // sources stay tied to the poller they were registered with
        let mut fresh = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        backend.set_interest(2, &mut fresh, Some(Interest::READABLE)).unwrap();
        assert_eq!(backend.len(), 1);
    }
}
