//! User trap frames.
//!
//! One saved user context per pid, in a fixed pool. The layout mirrors
//! the i386 trap frame the entry stubs push; the syscall layer reads
//! arguments and writes return values through the accessors in
//! [`crate::syscall`].

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

use crate::config::MAX_PID;
use crate::sched::Pid;

/// Segment selector of user code, ring 3.
pub const GDT_UCODE: u32 = 0x18;
/// Segment selector of user data, ring 3.
pub const GDT_UDATA: u32 = 0x20;
/// Requested privilege level of user segments.
pub const RPL_USER: u32 = 3;
/// EFLAGS interrupt-enable bit.
pub const FL_IF: u32 = 0x200;

/// General registers as pushed by `pushal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// A saved user-mode trap frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UserContext {
    pub regs: PushRegs,
    pub es: u32,
    pub ds: u32,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// The per-pid pool of saved user contexts.
pub struct UctxPool {
    frames: Vec<UserContext>,
}

impl UctxPool {
    pub fn new() -> Self {
        let mut frames = Vec::with_capacity(MAX_PID);
        frames.resize_with(MAX_PID, UserContext::default);
        Self { frames }
    }

    pub fn get(&self, pid: Pid) -> &UserContext {
        &self.frames[pid.as_usize()]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut UserContext {
        &mut self.frames[pid.as_usize()]
    }

    /// Save a trap frame for `pid` (trap entry path).
    pub fn save(&mut self, pid: Pid, frame: &UserContext) {
        self.frames[pid.as_usize()] = *frame;
    }
}

impl Default for UctxPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_overwrites_the_frame() {
        let mut pool = UctxPool::new();
        let mut frame = UserContext::default();
        frame.regs.eax = 42;
        frame.eip = 0x4000_1000;
        pool.save(Pid(3), &frame);
        assert_eq!(pool.get(Pid(3)).regs.eax, 42);
        assert_eq!(pool.get(Pid(3)).eip, 0x4000_1000);
        assert_eq!(pool.get(Pid(2)).regs.eax, 0);
    }
}
