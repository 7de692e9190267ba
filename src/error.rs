//! Error types shared by every engine operation
//!
//! Failures surface as return values, never as out-of-band control flow.
//! Transient would-block conditions are not errors at all: they are reported
//! as `Ok(0)` by the I/O calls. Fatal socket errors additionally produce a
//! single `Disconnect` message for the affected channel.

use crate::channel::ChannelState;
use std::io;
use thiserror::Error;

/// Errors returned by the engine and its helpers
#[derive(Debug, Error)]
pub enum Error {
    /// The handle does not name a live channel of this engine
    #[error("invalid channel handle")]
    InvalidHandle,

    /// A caller-supplied argument was rejected before any side effect
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The channel is not in a state that allows the operation
    #[error("channel state is {actual:?}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: ChannelState,
    },

    /// No extension is registered for the channel type id
    #[error("channel type {0} is not registered")]
    UnregisteredType(u8),

    /// Extension registration was refused
    #[error("extension registration failed: {0}")]
    Registration(&'static str),

    /// The engine was shut down
    #[error("engine is shut down")]
    Shutdown,

    /// Malformed `ip:port` text
    #[error("malformed address '{0}'")]
    AddrParse(String),

    /// Host name lookup yielded no usable IPv4 address
    #[error("failed to resolve '{0}'")]
    Resolve(String),

    /// Underlying OS error
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// OS error code carried by the error, 0 when there is none
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_code() {
        let err: Error = io::Error::from_raw_os_error(libc::ECONNRESET).into();
        assert_eq!(err.raw_os_error(), libc::ECONNRESET);
        assert_eq!(Error::InvalidHandle.raw_os_error(), 0);
    }

    #[test]
    fn state_errors_are_readable() {
        let err = Error::InvalidState {
            expected: "connected",
            actual: ChannelState::Disconnected,
        };
        assert!(err.to_string().contains("Disconnected"));
    }
}
