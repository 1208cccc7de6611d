//! The vmexit demultiplexer.
//!
//! One step of the monitor loop: classify the recorded exit, run the
//! matching handler, and tell the caller whether to resume the guest.
//! Guest faults are never fatal to the host; they are reflected back
//! into the guest or reported to the caller, which owns the policy for
//! halting the VM.

use super::vdev::Pit;
use super::vmx::{EventType, GuestReg, Vmx};
use super::{ExitReason, IoWidth, VmError};

/// What the monitor loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    /// Re-enter the guest.
    Resume,
    /// Second-level fault at the given guest-physical address; the
    /// caller decides whether to back-fill the EPT and resume.
    PageFault(u32),
    /// The guest executed something the monitor does not emulate.
    Halt,
}

/// General-protection-fault vector, injected for forbidden instructions.
const GP_VECTOR: u8 = 13;

/// Handle one recorded exit of `vcpu`. `now` is the guest TSC the
/// device models run against.
pub fn handle_exit(vcpu: &mut Vmx, pit: &Pit, now: u64) -> Result<VmAction, VmError> {
    match vcpu.get_exit_reason() {
        ExitReason::ExtInterrupt | ExitReason::InterruptWindow => {
            // The host serviced the interrupt on the way out; nothing to
            // emulate.
            Ok(VmAction::Resume)
        }
        ExitReason::Exception => Ok(VmAction::Resume),
        ExitReason::IoPort => {
            handle_io(vcpu, pit, now);
            Ok(VmAction::Resume)
        }
        ExitReason::PageFault => Ok(VmAction::PageFault(vcpu.get_exit_fault_addr())),
        ExitReason::Cpuid => {
            handle_cpuid(vcpu);
            advance(vcpu);
            Ok(VmAction::Resume)
        }
        ExitReason::Rdtsc => {
            vcpu.set_reg(GuestReg::Eax, now as u32);
            vcpu.set_reg(GuestReg::Edx, (now >> 32) as u32);
            advance(vcpu);
            Ok(VmAction::Resume)
        }
        ExitReason::Rdmsr | ExitReason::Wrmsr | ExitReason::InvalInstr => {
            // Reflect a #GP; the guest must not execute these.
            vcpu.inject_event(EventType::HwException, GP_VECTOR, 0, true);
            Ok(VmAction::Resume)
        }
        ExitReason::Hypercall => {
            // Hypercalls are acknowledged and skipped; the call surface
            // is owned by the VM management layer.
            advance(vcpu);
            Ok(VmAction::Resume)
        }
        ExitReason::Invalid => Err(VmError::InvalidExit),
    }
}

fn advance(vcpu: &mut Vmx) {
    let next = vcpu.get_next_eip();
    vcpu.set_reg(GuestReg::Eip, next);
}

/// Forward a PIT port access; anything else reads as all-ones and
/// swallows writes, like an unpopulated ISA bus.
fn handle_io(vcpu: &mut Vmx, pit: &Pit, now: u64) {
    let port = vcpu.get_exit_io_port();
    // The legacy timer decodes 8-bit accesses only.
    let byte_wide = vcpu.get_exit_io_width() == IoWidth::Sz8;
    if vcpu.get_exit_io_write() {
        let data = vcpu.get_reg(GuestReg::Eax) as u8;
        if byte_wide {
            let _ = pit.ioport_write(port, data, now);
        }
    } else {
        let value = if byte_wide {
            pit.ioport_read(port, now).unwrap_or(0xff)
        } else {
            0xff
        };
        let eax = vcpu.get_reg(GuestReg::Eax);
        vcpu.set_reg(GuestReg::Eax, (eax & !0xff) | value as u32);
    }
    advance(vcpu);
}

/// CPUID passthrough of the host leaf, with the hypervisor-present bit
/// raised on the feature leaf.
fn handle_cpuid(vcpu: &mut Vmx) {
    let leaf = vcpu.get_reg(GuestReg::Eax);
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: CPUID is unprivileged and side-effect free.
        let id = unsafe { core::arch::x86_64::__cpuid(leaf) };
        let mut ecx = id.ecx;
        if leaf == 1 {
            ecx |= 1 << 31;
        }
        vcpu.set_reg(GuestReg::Eax, id.eax);
        vcpu.set_reg(GuestReg::Ebx, id.ebx);
        vcpu.set_reg(GuestReg::Ecx, ecx);
        vcpu.set_reg(GuestReg::Edx, id.edx);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = leaf;
        vcpu.set_reg(GuestReg::Eax, 0);
        vcpu.set_reg(GuestReg::Ebx, 0);
        vcpu.set_reg(GuestReg::Ecx, 1 << 31);
        vcpu.set_reg(GuestReg::Edx, 0);
    }
}
