//! Blocking message passing over channels.
//!
//! These combinators bind the non-blocking mailbox operations to the
//! scheduler. A sender finding the mailbox occupied parks as
//! `WaitingForSending` on that channel; a receiver finding it empty
//! parks as `WaitingForReceiving`. The opposite operation wakes the
//! parked peer exactly once, at the head of its ready queue.
//!
//! Blocking is surfaced to the caller as [`SendOutcome::Blocked`] /
//! [`RecvOutcome::Blocked`]: the syscall layer leaves the trap frame
//! untouched in that case, so the operation is re-attempted when the
//! thread is scheduled again. The kernel never suspends in the middle
//! of a channel operation.

use super::{ChannelId, ChannelTable, IpcError, Result};
use crate::arch::Platform;
use crate::config::CHANNEL_BUFFER_SIZE;
use crate::sched::{BlockReason, Scheduler};

/// Result of a blocking send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message is in the mailbox; a waiting receiver was woken.
    Sent,
    /// The mailbox was occupied; the caller is now blocked and the
    /// operation must be restarted after wakeup.
    Blocked,
}

/// Result of a blocking receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A message of the given length was taken out of the mailbox; a
    /// waiting sender was woken.
    Received(usize),
    /// The mailbox was empty; the caller is now blocked and the
    /// operation must be restarted after wakeup.
    Blocked,
}

/// Send `msg` on `ch` for the current thread of `cpu`, blocking the
/// caller when the mailbox is occupied.
pub fn send_msg(
    sched: &Scheduler,
    channels: &ChannelTable,
    plat: &Platform,
    cpu: usize,
    ch: ChannelId,
    msg: &[u8],
) -> Result<SendOutcome> {
    let sender = sched.cur_pid(cpu).expect("send_msg with no current thread");
    match channels.send(ch, sender, msg) {
        Ok(()) => {
            let receiver = channels.peer_of(ch, sender)?;
            sched.unblock_if_waiting(plat, cpu, receiver, BlockReason::WaitingForReceiving, ch);
            Ok(SendOutcome::Sent)
        }
        Err(IpcError::ChannelBusy) => {
            sched.block(plat, cpu, BlockReason::WaitingForSending, ch);
            Ok(SendOutcome::Blocked)
        }
        Err(e) => Err(e),
    }
}

/// Receive from `ch` into `out` for the current thread of `cpu`,
/// blocking the caller when the mailbox is empty.
pub fn recv_msg(
    sched: &Scheduler,
    channels: &ChannelTable,
    plat: &Platform,
    cpu: usize,
    ch: ChannelId,
    out: &mut [u8; CHANNEL_BUFFER_SIZE],
) -> Result<RecvOutcome> {
    let receiver = sched.cur_pid(cpu).expect("recv_msg with no current thread");
    match channels.recv(ch, receiver, out) {
        Ok(len) => {
            let sender = channels.peer_of(ch, receiver)?;
            sched.unblock_if_waiting(plat, cpu, sender, BlockReason::WaitingForSending, ch);
            Ok(RecvOutcome::Received(len))
        }
        Err(IpcError::ChannelIdle) => {
            sched.block(plat, cpu, BlockReason::WaitingForReceiving, ch);
            Ok(RecvOutcome::Blocked)
        }
        Err(e) => Err(e),
    }
}
