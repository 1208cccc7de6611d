//! The VMX guest execution core.
//!
//! One [`Vmx`] per vCPU: a shadow file for the registers the hardware
//! hands over on exit, a VMCS for everything else, and the EPT root.
//! The exit stub snapshots reason, qualification, fault address and
//! instruction length into the shadow, so exit decoding is pure reads.
//!
//! The codec between canonical register ids and their storage is a
//! table; segment descriptors are written through a parallel table of
//! field encodings.

pub mod vmcs;

use self::vmcs::{VmcsField, VmcsRegion};
use super::ept::{Ept, EptMemType};
use super::{ExitReason, IoWidth, VmError};

/// Canonical guest register set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GuestReg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
    Eflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

/// Guest segment registers (and the two descriptor-table registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GuestSeg {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    Ldtr,
    Tr,
    Gdtr,
    Idtr,
}

/// Event types for injection, per the interruption-information format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExtInterrupt = 0,
    Nmi = 2,
    HwException = 3,
    SwInterrupt = 4,
}

/// Registers the exit stub saves into the shadow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Shadow {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rip,
    Cr2,
}

const SHADOW_COUNT: usize = 9;

/// Where a canonical register lives.
#[derive(Clone, Copy)]
enum Storage {
    Shadow(Shadow),
    Vmcs(u32),
}

/// Register codec: canonical id to storage, indexed by `GuestReg`.
const REG_CODEC: [Storage; 14] = [
    Storage::Shadow(Shadow::Rax),
    Storage::Shadow(Shadow::Rbx),
    Storage::Shadow(Shadow::Rcx),
    Storage::Shadow(Shadow::Rdx),
    Storage::Shadow(Shadow::Rsi),
    Storage::Shadow(Shadow::Rdi),
    Storage::Shadow(Shadow::Rbp),
    Storage::Vmcs(VmcsField::GUEST_RSP),
    Storage::Shadow(Shadow::Rip),
    Storage::Vmcs(VmcsField::GUEST_RFLAGS),
    Storage::Vmcs(VmcsField::GUEST_CR0),
    Storage::Shadow(Shadow::Cr2),
    Storage::Vmcs(VmcsField::GUEST_CR3),
    Storage::Vmcs(VmcsField::GUEST_CR4),
];

/// VMCS encodings of one segment's selector/base/limit/access fields.
/// Selector and access are zero for GDTR/IDTR, which have neither.
struct SegEncode {
    selector: u32,
    base: u32,
    limit: u32,
    access: u32,
}

/// Segment codec, indexed by `GuestSeg`.
const SEG_ENCODE: [SegEncode; 10] = [
    SegEncode {
        selector: VmcsField::GUEST_CS_SELECTOR,
        base: VmcsField::GUEST_CS_BASE,
        limit: VmcsField::GUEST_CS_LIMIT,
        access: VmcsField::GUEST_CS_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_SS_SELECTOR,
        base: VmcsField::GUEST_SS_BASE,
        limit: VmcsField::GUEST_SS_LIMIT,
        access: VmcsField::GUEST_SS_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_DS_SELECTOR,
        base: VmcsField::GUEST_DS_BASE,
        limit: VmcsField::GUEST_DS_LIMIT,
        access: VmcsField::GUEST_DS_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_ES_SELECTOR,
        base: VmcsField::GUEST_ES_BASE,
        limit: VmcsField::GUEST_ES_LIMIT,
        access: VmcsField::GUEST_ES_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_FS_SELECTOR,
        base: VmcsField::GUEST_FS_BASE,
        limit: VmcsField::GUEST_FS_LIMIT,
        access: VmcsField::GUEST_FS_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_GS_SELECTOR,
        base: VmcsField::GUEST_GS_BASE,
        limit: VmcsField::GUEST_GS_LIMIT,
        access: VmcsField::GUEST_GS_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_LDTR_SELECTOR,
        base: VmcsField::GUEST_LDTR_BASE,
        limit: VmcsField::GUEST_LDTR_LIMIT,
        access: VmcsField::GUEST_LDTR_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: VmcsField::GUEST_TR_SELECTOR,
        base: VmcsField::GUEST_TR_BASE,
        limit: VmcsField::GUEST_TR_LIMIT,
        access: VmcsField::GUEST_TR_ACCESS_RIGHTS,
    },
    SegEncode {
        selector: 0,
        base: VmcsField::GUEST_GDTR_BASE,
        limit: VmcsField::GUEST_GDTR_LIMIT,
        access: 0,
    },
    SegEncode {
        selector: 0,
        base: VmcsField::GUEST_IDTR_BASE,
        limit: VmcsField::GUEST_IDTR_LIMIT,
        access: 0,
    },
];

/// Raw VMX basic exit reasons (Intel SDM, Appendix C).
mod raw_exit {
    pub const EXCEPTION_NMI: u32 = 0;
    pub const EXT_INTR: u32 = 1;
    pub const INTR_WINDOW: u32 = 7;
    pub const CPUID: u32 = 10;
    pub const HLT: u32 = 12;
    pub const RDTSC: u32 = 16;
    pub const VMCALL: u32 = 18;
    pub const VMCLEAR: u32 = 19;
    pub const VMLAUNCH: u32 = 20;
    pub const VMPTRLD: u32 = 21;
    pub const VMPTRST: u32 = 22;
    pub const VMREAD: u32 = 23;
    pub const VMRESUME: u32 = 24;
    pub const VMWRITE: u32 = 25;
    pub const VMXOFF: u32 = 26;
    pub const VMXON: u32 = 27;
    pub const INOUT: u32 = 30;
    pub const RDMSR: u32 = 31;
    pub const WRMSR: u32 = 32;
    pub const MWAIT: u32 = 36;
    pub const MONITOR: u32 = 39;
    pub const EPT_FAULT: u32 = 48;
    pub const RDTSCP: u32 = 51;
}

/// Low 16 bits of the exit-reason field carry the basic reason.
const EXIT_REASON_MASK: u32 = 0xffff;

/// One vCPU's VMX state.
pub struct Vmx {
    vmcs: VmcsRegion,
    shadow: [u32; SHADOW_COUNT],
    exit_reason: u32,
    exit_qualification: u32,
    exit_fault_gpa: u32,
    exit_instr_len: u32,
    /// Guest-physical to host-physical map.
    pub ept: Ept,
    launched: bool,
}

impl Vmx {
    /// A vCPU whose EPT may grow to `ept_tables` tables.
    pub fn new(ept_tables: usize) -> Self {
        Self {
            vmcs: VmcsRegion::new(),
            shadow: [0; SHADOW_COUNT],
            exit_reason: 0,
            exit_qualification: 0,
            exit_fault_gpa: 0,
            exit_instr_len: 0,
            ept: Ept::new(ept_tables),
            launched: false,
        }
    }

    /// Read a canonical guest register.
    pub fn get_reg(&self, reg: GuestReg) -> u32 {
        match REG_CODEC[reg as usize] {
            Storage::Shadow(s) => self.shadow[s as usize],
            Storage::Vmcs(field) => self.vmcs.read(field) as u32,
        }
    }

    /// Write a canonical guest register.
    pub fn set_reg(&mut self, reg: GuestReg, val: u32) {
        match REG_CODEC[reg as usize] {
            Storage::Shadow(s) => self.shadow[s as usize] = val,
            Storage::Vmcs(field) => self.vmcs.write(field, val as u64),
        }
    }

    /// Write a guest segment descriptor. GDTR/IDTR take base and limit
    /// only.
    pub fn set_desc(&mut self, seg: GuestSeg, selector: u32, base: u32, limit: u32, access: u32) {
        let enc = &SEG_ENCODE[seg as usize];
        self.vmcs.write(enc.base, base as u64);
        self.vmcs.write(enc.limit, limit as u64);
        if !matches!(seg, GuestSeg::Gdtr | GuestSeg::Idtr) {
            self.vmcs.write(enc.access, access as u64);
            self.vmcs.write(enc.selector, selector as u64);
        }
    }

    /// Map guest-physical `gpa` to host-physical `hpa` and flush the
    /// translation cache.
    pub fn set_mmap(&mut self, gpa: u64, hpa: u64, mem_type: EptMemType) -> Result<(), VmError> {
        self.ept.add_mapping(gpa, hpa, mem_type)?;
        self.ept.invalidate();
        Ok(())
    }

    /// Queue an event for injection at the next entry. Silently ignored
    /// while a previous injection is still pending.
    pub fn inject_event(&mut self, ty: EventType, vector: u8, errcode: u32, has_err: bool) {
        let info = self.vmcs.read(VmcsField::ENTRY_INTR_INFO) as u32;
        if info & vmcs::INTR_INFO_VALID != 0 {
            log::debug!("[vmx] injection dropped, slot busy");
            return;
        }
        let mut info = vmcs::INTR_INFO_VALID | ((ty as u32) << 8) | vector as u32;
        if has_err {
            info |= vmcs::INTR_INFO_DELIVER_ERR;
        }
        self.vmcs.write(VmcsField::ENTRY_INTR_INFO, info as u64);
        if has_err {
            self.vmcs
                .write(VmcsField::ENTRY_EXCEPTION_ERROR, errcode as u64);
        }
    }

    /// Whether an injection is pending delivery.
    pub fn pending_event(&self) -> bool {
        self.vmcs.read(VmcsField::ENTRY_INTR_INFO) as u32 & vmcs::INTR_INFO_VALID != 0
    }

    /// Whether the guest is in an interrupt shadow (STI / MOV SS
    /// blocking).
    pub fn intr_shadow(&self) -> bool {
        self.vmcs.read(VmcsField::GUEST_INTERRUPTIBILITY) as u32
            & (vmcs::INTERRUPTIBILITY_STI_BLOCKING | vmcs::INTERRUPTIBILITY_MOVSS_BLOCKING)
            != 0
    }

    /// Request (or stop requesting) an exit when the guest can take an
    /// interrupt.
    pub fn intercept_intr_window(&mut self, enable: bool) {
        let mut ctls = self.vmcs.read(VmcsField::PRI_PROC_BASED_CTLS) as u32;
        if enable {
            ctls |= vmcs::PROCBASED_INT_WINDOW_EXITING;
        } else {
            ctls &= !vmcs::PROCBASED_INT_WINDOW_EXITING;
        }
        self.vmcs.write(VmcsField::PRI_PROC_BASED_CTLS, ctls as u64);
    }

    /// Snapshot the exit state. The bare-metal exit stub calls this with
    /// the freshly VMREAD values right after the world switch.
    pub fn record_exit(&mut self, reason: u32, qualification: u32, fault_gpa: u32, instr_len: u32) {
        self.exit_reason = reason;
        self.exit_qualification = qualification;
        self.exit_fault_gpa = fault_gpa;
        self.exit_instr_len = instr_len;
        self.launched = true;
    }

    /// Canonicalize the recorded exit reason.
    pub fn get_exit_reason(&self) -> ExitReason {
        match self.exit_reason & EXIT_REASON_MASK {
            raw_exit::EXCEPTION_NMI => ExitReason::Exception,
            raw_exit::EXT_INTR => ExitReason::ExtInterrupt,
            raw_exit::INTR_WINDOW => ExitReason::InterruptWindow,
            raw_exit::INOUT => ExitReason::IoPort,
            raw_exit::EPT_FAULT => ExitReason::PageFault,
            raw_exit::CPUID => ExitReason::Cpuid,
            raw_exit::RDTSC => ExitReason::Rdtsc,
            raw_exit::RDMSR => ExitReason::Rdmsr,
            raw_exit::WRMSR => ExitReason::Wrmsr,
            raw_exit::VMCALL => ExitReason::Hypercall,
            raw_exit::RDTSCP
            | raw_exit::HLT
            | raw_exit::VMCLEAR
            | raw_exit::VMLAUNCH
            | raw_exit::VMPTRLD
            | raw_exit::VMPTRST
            | raw_exit::VMREAD
            | raw_exit::VMRESUME
            | raw_exit::VMWRITE
            | raw_exit::VMXOFF
            | raw_exit::VMXON
            | raw_exit::MWAIT
            | raw_exit::MONITOR => ExitReason::InvalInstr,
            _ => ExitReason::Invalid,
        }
    }

    /// I/O port of an `IoPort` exit.
    pub fn get_exit_io_port(&self) -> u16 {
        (self.exit_qualification >> 16) as u16
    }

    /// Operand width of an `IoPort` exit.
    pub fn get_exit_io_width(&self) -> IoWidth {
        match self.exit_qualification & 0x7 {
            0 => IoWidth::Sz8,
            1 => IoWidth::Sz16,
            _ => IoWidth::Sz32,
        }
    }

    /// Whether the `IoPort` exit was an OUT (write).
    pub fn get_exit_io_write(&self) -> bool {
        self.exit_qualification & (1 << 3) == 0
    }

    /// Whether the access had a REP prefix.
    pub fn get_exit_io_rep(&self) -> bool {
        self.exit_qualification & (1 << 5) != 0
    }

    /// Whether the access was a string instruction (INS/OUTS).
    pub fn get_exit_io_str(&self) -> bool {
        self.exit_qualification & (1 << 4) != 0
    }

    /// Guest-physical address of a `PageFault` exit.
    pub fn get_exit_fault_addr(&self) -> u32 {
        self.exit_fault_gpa
    }

    /// Address of the instruction after the one that exited.
    pub fn get_next_eip(&self) -> u32 {
        self.shadow[Shadow::Rip as usize] + self.exit_instr_len
    }

    /// Enter the guest: VMLAUNCH on first entry, VMRESUME afterwards.
    ///
    /// On a successful entry control only comes back through the exit
    /// stub, which snapshots the exit state via [`Vmx::record_exit`].
    /// Falling through here means the hardware refused the guest state.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn enter(&mut self) -> Result<(), VmError> {
        let failed: u8;
        if self.launched {
            // SAFETY: The run loop made this VMCS current.
            unsafe {
                core::arch::asm!(
                    "vmresume", "setna {failed}",
                    failed = out(reg_byte) failed,
                    options(nostack),
                );
            }
        } else {
            // SAFETY: Same contract as above.
            unsafe {
                core::arch::asm!(
                    "vmlaunch", "setna {failed}",
                    failed = out(reg_byte) failed,
                    options(nostack),
                );
            }
        }
        if failed != 0 {
            return Err(VmError::EntryFailed);
        }
        Ok(())
    }

    /// Hosted builds cannot execute VMX entries.
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    pub fn enter(&mut self) -> Result<(), VmError> {
        Err(VmError::NotSupported)
    }

    /// Whether the vCPU has entered the guest at least once.
    pub fn launched(&self) -> bool {
        self.launched
    }

    /// Direct VMCS access for the entry/exit plumbing.
    pub fn vmcs(&mut self) -> &mut VmcsRegion {
        &mut self.vmcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcpu() -> Vmx {
        Vmx::new(16)
    }

    #[test]
    fn shadow_registers_round_trip() {
        let mut v = vcpu();
        v.set_reg(GuestReg::Eax, 0x1234);
        v.set_reg(GuestReg::Ebp, 0xbeef);
        v.set_reg(GuestReg::Cr2, 0xdead_0000);
        assert_eq!(v.get_reg(GuestReg::Eax), 0x1234);
        assert_eq!(v.get_reg(GuestReg::Ebp), 0xbeef);
        assert_eq!(v.get_reg(GuestReg::Cr2), 0xdead_0000);
    }

    #[test]
    fn vmcs_backed_registers_round_trip() {
        let mut v = vcpu();
        v.set_reg(GuestReg::Esp, 0x9000);
        v.set_reg(GuestReg::Eflags, 0x202);
        v.set_reg(GuestReg::Cr3, 0x123000);
        assert_eq!(v.vmcs.read(VmcsField::GUEST_RSP), 0x9000);
        assert_eq!(v.get_reg(GuestReg::Esp), 0x9000);
        assert_eq!(v.get_reg(GuestReg::Eflags), 0x202);
        assert_eq!(v.get_reg(GuestReg::Cr3), 0x123000);
    }

    #[test]
    fn segment_writes_hit_the_encoded_fields() {
        let mut v = vcpu();
        v.set_desc(GuestSeg::Cs, 0x8, 0, 0xffff, 0x9b);
        assert_eq!(v.vmcs.read(VmcsField::GUEST_CS_SELECTOR), 0x8);
        assert_eq!(v.vmcs.read(VmcsField::GUEST_CS_LIMIT), 0xffff);
        assert_eq!(v.vmcs.read(VmcsField::GUEST_CS_ACCESS_RIGHTS), 0x9b);

        // GDTR has no selector or access rights.
        v.set_desc(GuestSeg::Gdtr, 0x1111, 0x5000, 0x27, 0x2222);
        assert_eq!(v.vmcs.read(VmcsField::GUEST_GDTR_BASE), 0x5000);
        assert_eq!(v.vmcs.read(VmcsField::GUEST_GDTR_LIMIT), 0x27);
    }

    #[test]
    fn exit_reason_map_is_total() {
        let cases = [
            (0u32, ExitReason::Exception),
            (1, ExitReason::ExtInterrupt),
            (7, ExitReason::InterruptWindow),
            (30, ExitReason::IoPort),
            (48, ExitReason::PageFault),
            (10, ExitReason::Cpuid),
            (16, ExitReason::Rdtsc),
            (31, ExitReason::Rdmsr),
            (32, ExitReason::Wrmsr),
            (18, ExitReason::Hypercall),
            (12, ExitReason::InvalInstr),
            (19, ExitReason::InvalInstr),
            (20, ExitReason::InvalInstr),
            (21, ExitReason::InvalInstr),
            (22, ExitReason::InvalInstr),
            (23, ExitReason::InvalInstr),
            (24, ExitReason::InvalInstr),
            (25, ExitReason::InvalInstr),
            (26, ExitReason::InvalInstr),
            (27, ExitReason::InvalInstr),
            (36, ExitReason::InvalInstr),
            (39, ExitReason::InvalInstr),
            (51, ExitReason::InvalInstr),
        ];
        let mut v = vcpu();
        for (raw, want) in cases {
            v.record_exit(raw, 0, 0, 0);
            assert_eq!(v.get_exit_reason(), want, "raw reason {raw}");
        }
        // Everything else is invalid, and the high bits are masked off.
        v.record_exit(55, 0, 0, 0);
        assert_eq!(v.get_exit_reason(), ExitReason::Invalid);
        v.record_exit(0x8000_0001, 0, 0, 0);
        assert_eq!(v.get_exit_reason(), ExitReason::ExtInterrupt);
    }

    #[test]
    fn io_qualification_decodes() {
        let mut v = vcpu();
        // OUT 0x43, width 1 byte: port in bits 16..32, direction bit 3
        // clear for OUT.
        v.record_exit(30, 0x0043_0000, 0, 2);
        assert_eq!(v.get_exit_reason(), ExitReason::IoPort);
        assert_eq!(v.get_exit_io_port(), 0x43);
        assert_eq!(v.get_exit_io_width(), IoWidth::Sz8);
        assert!(v.get_exit_io_write());
        assert!(!v.get_exit_io_rep());
        assert!(!v.get_exit_io_str());

        // REP INSW from port 0x40.
        v.record_exit(30, 0x0040_0000 | 1 | (1 << 3) | (1 << 4) | (1 << 5), 0, 2);
        assert_eq!(v.get_exit_io_width(), IoWidth::Sz16);
        assert!(!v.get_exit_io_write());
        assert!(v.get_exit_io_rep());
        assert!(v.get_exit_io_str());
    }

    #[test]
    fn ept_fault_reports_the_guest_address() {
        let mut v = vcpu();
        v.record_exit(48, 0, 0xfee0_0000, 0);
        assert_eq!(v.get_exit_reason(), ExitReason::PageFault);
        assert_eq!(v.get_exit_fault_addr(), 0xfee0_0000);
    }

    #[test]
    fn next_eip_advances_past_the_instruction() {
        let mut v = vcpu();
        v.set_reg(GuestReg::Eip, 0x7c00);
        v.record_exit(10, 0, 0, 2);
        assert_eq!(v.get_next_eip(), 0x7c02);
    }

    #[test]
    fn injection_respects_the_pending_slot() {
        let mut v = vcpu();
        assert!(!v.pending_event());
        v.inject_event(EventType::ExtInterrupt, 32, 0, false);
        assert!(v.pending_event());
        let first = v.vmcs.read(VmcsField::ENTRY_INTR_INFO);

        // A second injection while one is pending is dropped.
        v.inject_event(EventType::HwException, 14, 2, true);
        assert_eq!(v.vmcs.read(VmcsField::ENTRY_INTR_INFO), first);
    }

    #[test]
    fn injection_with_error_code_sets_deliver_bit() {
        let mut v = vcpu();
        v.inject_event(EventType::HwException, 14, 0x6, true);
        let info = v.vmcs.read(VmcsField::ENTRY_INTR_INFO) as u32;
        assert_ne!(info & vmcs::INTR_INFO_VALID, 0);
        assert_ne!(info & vmcs::INTR_INFO_DELIVER_ERR, 0);
        assert_eq!(info & 0xff, 14);
        assert_eq!((info >> 8) & 0x7, EventType::HwException as u32);
        assert_eq!(v.vmcs.read(VmcsField::ENTRY_EXCEPTION_ERROR), 0x6);
    }

    #[test]
    fn interrupt_window_toggles_the_control_bit() {
        let mut v = vcpu();
        v.intercept_intr_window(true);
        assert_ne!(
            v.vmcs.read(VmcsField::PRI_PROC_BASED_CTLS) as u32
                & vmcs::PROCBASED_INT_WINDOW_EXITING,
            0
        );
        v.intercept_intr_window(false);
        assert_eq!(
            v.vmcs.read(VmcsField::PRI_PROC_BASED_CTLS) as u32
                & vmcs::PROCBASED_INT_WINDOW_EXITING,
            0
        );
    }

    #[test]
    fn guest_entry_is_unavailable_off_the_metal() {
        let mut v = vcpu();
        assert_eq!(v.enter(), Err(VmError::NotSupported));
    }

    #[test]
    fn intr_shadow_follows_interruptibility() {
        let mut v = vcpu();
        assert!(!v.intr_shadow());
        v.vmcs().write(
            VmcsField::GUEST_INTERRUPTIBILITY,
            vmcs::INTERRUPTIBILITY_STI_BLOCKING as u64,
        );
        assert!(v.intr_shadow());
    }
}
