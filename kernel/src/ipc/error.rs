//! IPC error types and result definitions.

use core::fmt;

/// IPC operation result type.
pub type Result<T> = core::result::Result<T, IpcError>;

/// IPC error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Non-blocking send against an occupied mailbox.
    ChannelBusy,
    /// Non-blocking receive against an empty mailbox.
    ChannelIdle,
    /// Channel id outside the arena or not allocated.
    BadChannel,
    /// Caller is not an endpoint of the channel.
    NotEndpoint,
    /// Message exceeds the channel buffer capacity.
    MessageTooLarge,
    /// Channel arena exhausted.
    NoFreeChannel,
}

impl IpcError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelBusy => "channel busy",
            Self::ChannelIdle => "channel idle",
            Self::BadChannel => "bad channel",
            Self::NotEndpoint => "not a channel endpoint",
            Self::MessageTooLarge => "message too large",
            Self::NoFreeChannel => "no free channel",
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
