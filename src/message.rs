//! Messages handed to the caller, one per event
use crate::channel::ChannelId;
use std::time::Duration;

/// Kind of an emitted event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Data (or a datagram) is ready to be read
    Recv,
    /// The write-behind queue drained and send notifications are on
    Send,
    /// A listening stream channel accepted a peer, see [`Message::accepted`]
    Accept,
    /// An outgoing stream connection completed
    Connected,
    /// The socket was torn down after a fatal error or peer hang-up
    Disconnect,
    /// The channel's repeating timer fired
    Timer,
}

/// One event for one channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    pub event: Event,
    /// OS error code for `Disconnect`, 0 otherwise or on a clean hang-up
    pub err: i32,
    pub channel: ChannelId,
    /// Freshly accepted channel, set for `Accept` only
    pub accepted: Option<ChannelId>,
    /// Owner value of the channel at emission time
    pub opaque: Option<usize>,
}

impl Message {
    pub fn new(event: Event, channel: ChannelId) -> Self {
        Self {
            event,
            err: 0,
            channel,
            accepted: None,
            opaque: None,
        }
    }
}

/// Notifications a caller can switch on or off per channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveEvent {
    /// Emit `Send` whenever the channel can take more data
    Send(bool),
    /// Repeating timer; `Duration::ZERO` disarms it
    Timer(Duration),
}
