//! Single-threaded non-blocking network event loop
//!
//! `horizon_mnet` multiplexes TCP and UDP sockets behind uniform channel
//! handles. An [`Engine`] owns the channels and runs poll cycles; each
//! cycle yields [`Message`]s one at a time: data to read, queue drained,
//! peer accepted, connection completed, connection lost, timer fired.
//!
//! - sends never block: whatever the socket does not take is queued and
//!   flushed on write readiness, in order,
//! - every channel can carry a repeating millisecond timer,
//! - protocol layers plug in as [`Extension`]s that see and may rewrite
//!   every message of their channel type.
//!
//! ```rust,no_run
//! use horizon_mnet::{ChannelType, Engine, Event};
//! use std::time::Duration;
//!
//! let mut engine = Engine::new()?;
//! let server = engine.open(ChannelType::Stream)?;
//! engine.listen(server, "127.0.0.1", 8090, 0)?;
//!
//! let mut buf = [0u8; 1024];
//! loop {
//!     engine.poll(Some(Duration::from_millis(100)))?;
//!     while let Some(msg) = engine.next_message() {
//!         match msg.event {
//!             Event::Recv => {
//!                 let n = engine.recv(msg.channel, &mut buf)?;
//!                 if n > 0 {
//!                     engine.send(msg.channel, &buf[..n])?;
//!                 }
//!             }
//!             Event::Disconnect => engine.close(msg.channel)?,
//!             _ => {}
//!         }
//!     }
//! }
//! # Ok::<(), horizon_mnet::Error>(())
//! ```
#![deny(unsafe_op_in_unsafe_fn)]

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod addr;
        pub mod backend;
        pub mod builder;
        pub mod channel;
        pub mod config;
        mod dispatch;
        pub mod engine;
        pub mod error;
        pub mod extension;
        pub mod message;
        pub mod raw; // libc socket helpers
        pub mod timer;
        pub mod write_buffer;
    } else {
        compile_error!("horizon_mnet supports Unix targets only");
    }
}

/// Convenience re-exports
pub use addr::{parse_ipport, resolve, ChannAddr};
pub use builder::EngineBuilder;
pub use channel::{ChannelId, ChannelState, ChannelType};
pub use config::NetConfig;
pub use dispatch::PollSummary;
pub use engine::Engine;
pub use error::{Error, Result};
pub use extension::{AcceptBalancer, Extension, Passthrough};
pub use message::{ActiveEvent, Event, Message};
pub use timer::current_micros;
