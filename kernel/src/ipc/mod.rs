//! Inter-process communication.
//!
//! Channels are capacity-one mailboxes in a fixed arena, paired between a
//! parent and its child at spawn. The raw operations ([`channel`]) never
//! block; the blocking combinators ([`message_passing`]) park the caller
//! on the scheduler and wake the peer exactly once per state change.

pub mod channel;
pub mod error;
pub mod message_passing;

pub use channel::{Channel, ChannelTable, ChannelType};
pub use error::{IpcError, Result};
pub use message_passing::{recv_msg, send_msg, RecvOutcome, SendOutcome};

use core::fmt;

/// Channel identifier; an index into the channel arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
