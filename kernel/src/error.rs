//! Kernel-wide error types.
//!
//! Each subsystem carries its own small error enum; this module defines
//! the top-level [`KernelError`] the syscall layer flattens into the
//! trap-frame error slot, and the conversions into it.

use core::fmt;

use crate::{ipc::IpcError, mm::MmError, sched::SchedError, virt::VmError};

/// Top-level kernel error, carried across the syscall boundary as a small
/// integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// TCB pool exhausted.
    NoFreePid,
    /// Physical page allocator exhausted.
    OutOfMemory,
    /// Non-blocking channel operation against an occupied mailbox.
    ChannelBusy,
    /// Non-blocking channel operation against an empty mailbox.
    ChannelIdle,
    /// Channel id outside the arena or not allocated.
    BadChannel,
    /// Operation attempted against a thread in the wrong state.
    WrongState,
    /// Malformed argument (e.g. a guest exit outside the known set).
    BadArg,
    /// Feature intentionally not implemented (BCD counting, nested
    /// virtualization).
    NotSupported,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFreePid => "no free pid",
            Self::OutOfMemory => "out of memory",
            Self::ChannelBusy => "channel busy",
            Self::ChannelIdle => "channel idle",
            Self::BadChannel => "bad channel",
            Self::WrongState => "wrong thread state",
            Self::BadArg => "bad argument",
            Self::NotSupported => "not supported",
        }
    }

    /// Convert to the numeric code written into the trap frame.
    pub fn to_errno(self) -> u32 {
        match self {
            Self::NoFreePid => 1,
            Self::OutOfMemory => 2,
            Self::ChannelBusy => 3,
            Self::ChannelIdle => 4,
            Self::BadChannel => 5,
            Self::WrongState => 6,
            Self::BadArg => 7,
            Self::NotSupported => 8,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        match e {
            SchedError::NoFreePid => Self::NoFreePid,
            SchedError::OutOfMemory => Self::OutOfMemory,
            SchedError::WrongState => Self::WrongState,
        }
    }
}

impl From<MmError> for KernelError {
    fn from(e: MmError) -> Self {
        match e {
            MmError::NoMem => Self::OutOfMemory,
            MmError::BadVaddr => Self::BadArg,
        }
    }
}

impl From<IpcError> for KernelError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::ChannelBusy => Self::ChannelBusy,
            IpcError::ChannelIdle => Self::ChannelIdle,
            IpcError::BadChannel | IpcError::NotEndpoint => Self::BadChannel,
            IpcError::MessageTooLarge => Self::BadArg,
            IpcError::NoFreeChannel => Self::OutOfMemory,
        }
    }
}

impl From<VmError> for KernelError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::NoMem => Self::OutOfMemory,
            VmError::NotSupported => Self::NotSupported,
            VmError::InvalidExit => Self::BadArg,
            VmError::AlreadyInjected
            | VmError::BadRegister
            | VmError::VmcsAccess
            | VmError::EntryFailed => Self::BadArg,
        }
    }
}
