//! Fluent construction of an [`Engine`]
//!
//! The builder gathers a [`NetConfig`], extensions to register and an
//! optional accept balancer, and creates the engine only when
//! [`EngineBuilder::build`] is called.
//!
//! # Examples
//!
//! ```rust,no_run
//! use horizon_mnet::builder::EngineBuilder;
//!
//! let engine = EngineBuilder::new()
//!     .low_latency()
//!     .buffer_size(256 * 1024)
//!     .backlog(128)
//!     .build()?;
//! # drop(engine);
//! # Ok::<(), horizon_mnet::Error>(())
//! ```

use crate::channel::ChannelType;
use crate::config::NetConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::extension::{AcceptBalancer, Extension};
use std::rc::Rc;

/// Builder for [`Engine`] with method chaining
///
/// Configuration methods consume the builder and return it, so calls can
/// be chained. Registration errors of extensions surface from `build`.
pub struct EngineBuilder {
    config: NetConfig,
    extensions: Vec<(ChannelType, Rc<dyn Extension>)>,
    balancer: Option<Box<dyn AcceptBalancer>>,
}

impl EngineBuilder {
    /// Starts from [`NetConfig::default`]
    pub fn new() -> Self {
        Self {
            config: NetConfig::default(),
            extensions: Vec::new(),
            balancer: None,
        }
    }

    /// Replaces the whole configuration
    pub fn config(mut self, config: NetConfig) -> Self {
        self.config = config;
        self
    }

    /// SO_SNDBUF/SO_RCVBUF hint applied to every new socket
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buf_size = size;
        self
    }

    /// Capacity of one write-behind chunk
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Drained chunks kept for reuse
    pub fn pool_chunks(mut self, count: usize) -> Self {
        self.config.pool_chunks = count;
        self
    }

    /// Readiness events fetched per poll
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Listen backlog used when `listen` is given 0
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.tcp_backlog = backlog;
        self
    }

    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.config.reuse_addr = enable;
        self
    }

    pub fn keepalive(mut self, enable: bool) -> Self {
        self.config.keepalive = enable;
        self
    }

    /// Enables or disables TCP_NODELAY on stream channels
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Applies [`NetConfig::low_latency`]
    pub fn low_latency(mut self) -> Self {
        self.config = NetConfig::low_latency();
        self
    }

    /// Applies [`NetConfig::high_throughput`]
    pub fn high_throughput(mut self) -> Self {
        self.config = NetConfig::high_throughput();
        self
    }

    /// Registers `ext` for `ctype` once the engine is built
    pub fn extension(mut self, ctype: ChannelType, ext: Rc<dyn Extension>) -> Self {
        self.extensions.push((ctype, ext));
        self
    }

    pub fn accept_balancer(mut self, balancer: Box<dyn AcceptBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Creates the engine
    pub fn build(self) -> Result<Engine> {
        let mut engine = Engine::with_config(self.config)?;
        for (ctype, ext) in self.extensions {
            engine.register(ctype, ext)?;
        }
        if self.balancer.is_some() {
            engine.set_accept_balancer(self.balancer);
        }
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
