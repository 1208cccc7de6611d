//! The channel arena and the non-blocking mailbox operations.
//!
//! A channel holds at most one message of up to
//! [`CHANNEL_BUFFER_SIZE`](crate::config::CHANNEL_BUFFER_SIZE) bytes.
//! A second sender observes [`IpcError::ChannelBusy`]; a receiver of an
//! empty mailbox observes [`IpcError::ChannelIdle`]. Each slot has its
//! own lock; the free pool has another. Channel locks are leaves in the
//! lock order: they are only ever taken while no other channel lock is
//! held.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

use super::{ChannelId, IpcError, Result};
use crate::config::CHANNEL_BUFFER_SIZE;
use crate::sched::Pid;
use crate::sync::SpinLock;

/// Message direction policy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Both endpoints may send.
    Bidirect,
    /// Only the first endpoint sends.
    Unidirect,
}

/// One channel slot.
pub struct Channel {
    in_use: bool,
    p1: Pid,
    p2: Pid,
    ty: ChannelType,
    busy: bool,
    len: usize,
    buf: [u8; CHANNEL_BUFFER_SIZE],
}

impl Channel {
    const fn empty() -> Self {
        Self {
            in_use: false,
            p1: Pid(0),
            p2: Pid(0),
            ty: ChannelType::Bidirect,
            busy: false,
            len: 0,
            buf: [0; CHANNEL_BUFFER_SIZE],
        }
    }

    fn may_send(&self, pid: Pid) -> bool {
        match self.ty {
            ChannelType::Bidirect => pid == self.p1 || pid == self.p2,
            ChannelType::Unidirect => pid == self.p1,
        }
    }

    fn is_endpoint(&self, pid: Pid) -> bool {
        pid == self.p1 || pid == self.p2
    }
}

/// The fixed arena of channels.
pub struct ChannelTable {
    slots: Vec<SpinLock<Channel>>,
    pool: spin::Mutex<Vec<ChannelId>>,
}

impl ChannelTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut pool = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(SpinLock::new("channel", Channel::empty()));
            pool.push(ChannelId(i as u32));
        }
        // Hand out low ids first.
        pool.reverse();
        Self {
            slots,
            pool: spin::Mutex::new(pool),
        }
    }

    /// Allocate a channel pairing `p1` and `p2`.
    pub fn alloc(&self, p1: Pid, p2: Pid, ty: ChannelType) -> Result<ChannelId> {
        let id = self.pool.lock().pop().ok_or(IpcError::NoFreeChannel)?;
        let mut ch = self.slots[id.as_usize()].lock();
        *ch = Channel::empty();
        ch.in_use = true;
        ch.p1 = p1;
        ch.p2 = p2;
        ch.ty = ty;
        Ok(id)
    }

    /// Free a channel; any in-flight message is dropped.
    pub fn free(&self, id: ChannelId) -> Result<()> {
        {
            let mut ch = self.slot(id)?.lock();
            if !ch.in_use {
                return Err(IpcError::BadChannel);
            }
            *ch = Channel::empty();
        }
        self.pool.lock().push(id);
        Ok(())
    }

    /// The two endpoints of `id`.
    pub fn endpoints(&self, id: ChannelId) -> Result<(Pid, Pid)> {
        let ch = self.slot(id)?.lock();
        if !ch.in_use {
            return Err(IpcError::BadChannel);
        }
        Ok((ch.p1, ch.p2))
    }

    /// The endpoint opposite to `me`.
    pub fn peer_of(&self, id: ChannelId, me: Pid) -> Result<Pid> {
        let (p1, p2) = self.endpoints(id)?;
        if me == p1 {
            Ok(p2)
        } else if me == p2 {
            Ok(p1)
        } else {
            Err(IpcError::NotEndpoint)
        }
    }

    /// Place `msg` into the mailbox, or fail with `ChannelBusy` when a
    /// message is already in flight.
    pub fn send(&self, id: ChannelId, sender: Pid, msg: &[u8]) -> Result<()> {
        if msg.len() > CHANNEL_BUFFER_SIZE {
            return Err(IpcError::MessageTooLarge);
        }
        let mut ch = self.slot(id)?.lock();
        if !ch.in_use {
            return Err(IpcError::BadChannel);
        }
        if !ch.may_send(sender) {
            return Err(IpcError::NotEndpoint);
        }
        if ch.busy {
            return Err(IpcError::ChannelBusy);
        }
        ch.len = msg.len();
        ch.buf[..msg.len()].copy_from_slice(msg);
        ch.busy = true;
        Ok(())
    }

    /// Take the in-flight message out of the mailbox, or fail with
    /// `ChannelIdle` when there is none.
    pub fn recv(&self, id: ChannelId, receiver: Pid, out: &mut [u8]) -> Result<usize> {
        let mut ch = self.slot(id)?.lock();
        if !ch.in_use {
            return Err(IpcError::BadChannel);
        }
        if !ch.is_endpoint(receiver) {
            return Err(IpcError::NotEndpoint);
        }
        if !ch.busy {
            return Err(IpcError::ChannelIdle);
        }
        let len = ch.len.min(out.len());
        out[..len].copy_from_slice(&ch.buf[..len]);
        ch.busy = false;
        ch.len = 0;
        Ok(len)
    }

    fn slot(&self, id: ChannelId) -> Result<&SpinLock<Channel>> {
        self.slots.get(id.as_usize()).ok_or(IpcError::BadChannel)
    }
}
