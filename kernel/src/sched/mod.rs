//! Thread management and the per-CPU round-robin scheduler.
//!
//! Threads are CPU-pinned; each CPU schedules round-robin among the
//! threads pinned to it, preempted by the LAPIC timer quantum. All
//! scheduler state lives in a fixed arena guarded by one thread lock;
//! see [`scheduler::Scheduler`].

pub mod context;
pub mod scheduler;
pub mod tcb;

pub use context::{KernelContext, KernelEntry};
pub use scheduler::Scheduler;
pub use tcb::{Tcb, TcbQueue, TcbTable};

use core::fmt;

/// Thread/process identifier; an index into the TCB arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// TCB is on the free list.
    Free,
    /// Spawned but not yet scheduled for the first time.
    Inited,
    /// Runnable, waiting on a ready queue.
    Ready,
    /// The current thread of its CPU.
    Running,
    /// Waiting on a channel, parked on a blocked queue.
    Blocked,
    /// Exited, awaiting reap.
    Dead,
}

/// Why a thread is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting to place a message into a busy channel.
    WaitingForSending,
    /// Waiting for a message to arrive on an idle channel.
    WaitingForReceiving,
}

/// Scheduler errors surfaced to creators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// TCB pool exhausted.
    NoFreePid,
    /// Kernel stack allocation failed.
    OutOfMemory,
    /// Operation attempted against a thread in the wrong state.
    WrongState,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreePid => write!(f, "no free pid"),
            Self::OutOfMemory => write!(f, "kernel stack allocation failed"),
            Self::WrongState => write!(f, "wrong thread state"),
        }
    }
}
