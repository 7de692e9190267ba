//! Engine and socket configuration
//!
//! `NetConfig` gathers every tunable the engine applies when it opens a
//! socket or sizes its internal queues. The defaults mirror the classic
//! behaviour of the library: 64 KiB socket buffers, 64 KiB write-buffer
//! chunks, SO_REUSEADDR on every socket and SO_KEEPALIVE on streams.
//!
//! # Categories
//!
//! ## Socket options
//! - `buf_size`: SO_SNDBUF/SO_RCVBUF hint, overridable per channel
//! - `reuse_addr`, `keepalive`, `tcp_nodelay`
//! - `tcp_backlog`: listen backlog used when the caller passes 0
//!
//! ## Engine internals
//! - `chunk_size`: capacity of one write-behind chunk
//! - `pool_chunks`: drained chunks kept around for reuse
//! - `event_capacity`: readiness events fetched per poll
//!
//! # Examples
//!
//! ```rust
//! use horizon_mnet::NetConfig;
//!
//! let cfg = NetConfig {
//!     buf_size: 256 * 1024,
//!     tcp_nodelay: true,
//!     ..Default::default()
//! };
//! assert_eq!(cfg.chunk_size, 64 * 1024);
//! ```

use crate::channel::ChannelType;
use crate::raw;
use std::io;

/// Default socket buffer hint and write-buffer chunk size
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Tunables for an [`Engine`](crate::Engine)
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// SO_SNDBUF/SO_RCVBUF applied to new sockets, unless the channel
    /// carries its own hint set through `set_bufsize`.
    ///
    /// **Default**: 64 KiB
    pub buf_size: usize,

    /// Capacity of one write-behind chunk.
    ///
    /// **Default**: 64 KiB
    pub chunk_size: usize,

    /// Drained chunks retained for reuse across all channels.
    ///
    /// **Default**: 64
    pub pool_chunks: usize,

    /// Readiness events fetched from the kernel per poll cycle.
    ///
    /// **Default**: 256
    pub event_capacity: usize,

    /// Listen backlog used when `listen` is given a backlog of 0.
    ///
    /// **Default**: 3
    pub tcp_backlog: i32,

    /// SO_REUSEADDR on every socket.
    ///
    /// **Default**: `true`
    pub reuse_addr: bool,

    /// SO_KEEPALIVE on stream sockets.
    ///
    /// **Default**: `true`
    pub keepalive: bool,

    /// TCP_NODELAY on stream sockets, including accepted ones.
    ///
    /// **Default**: `false`
    pub tcp_nodelay: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
            chunk_size: DEFAULT_BUF_SIZE,
            pool_chunks: 64,
            event_capacity: 256,
            tcp_backlog: 3,
            reuse_addr: true,
            keepalive: true,
            tcp_nodelay: false,
        }
    }
}

impl NetConfig {
    /// Small buffers and Nagle disabled, for request/response traffic
    pub fn low_latency() -> Self {
        Self {
            buf_size: 32 * 1024,
            chunk_size: 16 * 1024,
            tcp_nodelay: true,
            ..Self::default()
        }
    }

    /// Large socket buffers and chunks, for bulk transfers
    pub fn high_throughput() -> Self {
        Self {
            buf_size: 4 << 20,
            chunk_size: 256 * 1024,
            pool_chunks: 128,
            event_capacity: 1024,
            tcp_backlog: 1024,
            ..Self::default()
        }
    }
}

/// Applies the configured options to a freshly created socket
///
/// `raw_type` must already be resolved to one of the internal transports.
/// `buf_size` is the effective buffer hint (per-channel override or the
/// configured default).
pub fn apply_socket_options(
    os: raw::OsSocket,
    raw_type: ChannelType,
    buf_size: usize,
    cfg: &NetConfig,
) -> io::Result<()> {
    use crate::raw as r;

    if cfg.reuse_addr {
        r::set_reuse_addr(os, true)?;
    }

    match raw_type {
        ChannelType::Stream => {
            if cfg.keepalive {
                r::set_keepalive(os, true)?;
            }
            if cfg.tcp_nodelay {
                r::set_tcp_nodelay(os, true)?;
            }
        }
        ChannelType::Broadcast => r::set_broadcast(os, true)?,
        _ => {}
    }

    let sz = buf_size.min(i32::MAX as usize) as i32;
    r::set_send_buffer(os, sz)?;
    r::set_recv_buffer(os, sz)?;
    Ok(())
}
