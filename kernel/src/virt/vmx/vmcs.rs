//! VMCS field encodings and the field I/O seam.
//!
//! Field encodings follow the Intel SDM (Vol. 3C, Appendix B). On bare
//! metal, reads and writes are VMREAD/VMWRITE against the current VMCS;
//! on hosted targets [`VmcsRegion`] keeps a software field store so the
//! register codec and the exit machinery stay exercisable under test.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
use alloc::collections::BTreeMap;

/// VMCS field encoding constants.
pub struct VmcsField;

#[allow(unused)]
impl VmcsField {
    pub const GUEST_ES_SELECTOR: u32 = 0x0800;
    pub const GUEST_CS_SELECTOR: u32 = 0x0802;
    pub const GUEST_SS_SELECTOR: u32 = 0x0804;
    pub const GUEST_DS_SELECTOR: u32 = 0x0806;
    pub const GUEST_FS_SELECTOR: u32 = 0x0808;
    pub const GUEST_GS_SELECTOR: u32 = 0x080A;
    pub const GUEST_LDTR_SELECTOR: u32 = 0x080C;
    pub const GUEST_TR_SELECTOR: u32 = 0x080E;
    pub const EPT_POINTER: u32 = 0x201A;
    pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
    pub const PIN_BASED_CTLS: u32 = 0x4000;
    pub const PRI_PROC_BASED_CTLS: u32 = 0x4002;
    pub const EXCEPTION_BITMAP: u32 = 0x4004;
    pub const ENTRY_INTR_INFO: u32 = 0x4016;
    pub const ENTRY_EXCEPTION_ERROR: u32 = 0x4018;
    pub const EXIT_REASON: u32 = 0x4402;
    pub const EXIT_INTERRUPTION_INFO: u32 = 0x4404;
    pub const EXIT_INSTRUCTION_LENGTH: u32 = 0x440C;
    pub const GUEST_ES_LIMIT: u32 = 0x4800;
    pub const GUEST_CS_LIMIT: u32 = 0x4802;
    pub const GUEST_SS_LIMIT: u32 = 0x4804;
    pub const GUEST_DS_LIMIT: u32 = 0x4806;
    pub const GUEST_FS_LIMIT: u32 = 0x4808;
    pub const GUEST_GS_LIMIT: u32 = 0x480A;
    pub const GUEST_LDTR_LIMIT: u32 = 0x480C;
    pub const GUEST_TR_LIMIT: u32 = 0x480E;
    pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
    pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
    pub const GUEST_ES_ACCESS_RIGHTS: u32 = 0x4814;
    pub const GUEST_CS_ACCESS_RIGHTS: u32 = 0x4816;
    pub const GUEST_SS_ACCESS_RIGHTS: u32 = 0x4818;
    pub const GUEST_DS_ACCESS_RIGHTS: u32 = 0x481A;
    pub const GUEST_FS_ACCESS_RIGHTS: u32 = 0x481C;
    pub const GUEST_GS_ACCESS_RIGHTS: u32 = 0x481E;
    pub const GUEST_LDTR_ACCESS_RIGHTS: u32 = 0x4820;
    pub const GUEST_TR_ACCESS_RIGHTS: u32 = 0x4822;
    pub const GUEST_INTERRUPTIBILITY: u32 = 0x4824;
    pub const EXIT_QUALIFICATION: u32 = 0x6400;
    pub const GUEST_CR0: u32 = 0x6800;
    pub const GUEST_CR3: u32 = 0x6802;
    pub const GUEST_CR4: u32 = 0x6804;
    pub const GUEST_ES_BASE: u32 = 0x6806;
    pub const GUEST_CS_BASE: u32 = 0x6808;
    pub const GUEST_SS_BASE: u32 = 0x680A;
    pub const GUEST_DS_BASE: u32 = 0x680C;
    pub const GUEST_FS_BASE: u32 = 0x680E;
    pub const GUEST_GS_BASE: u32 = 0x6810;
    pub const GUEST_LDTR_BASE: u32 = 0x6812;
    pub const GUEST_TR_BASE: u32 = 0x6814;
    pub const GUEST_GDTR_BASE: u32 = 0x6816;
    pub const GUEST_IDTR_BASE: u32 = 0x6818;
    pub const GUEST_RSP: u32 = 0x681C;
    pub const GUEST_RIP: u32 = 0x681E;
    pub const GUEST_RFLAGS: u32 = 0x6820;
}

/// Valid bit of the entry interruption-information field.
pub const INTR_INFO_VALID: u32 = 1 << 31;
/// Deliver-error-code bit of the interruption-information field.
pub const INTR_INFO_DELIVER_ERR: u32 = 1 << 11;
/// Interrupt-window exiting bit of the primary processor-based controls.
pub const PROCBASED_INT_WINDOW_EXITING: u32 = 1 << 2;
/// Blocking-by-STI bit of the guest interruptibility state.
pub const INTERRUPTIBILITY_STI_BLOCKING: u32 = 1 << 0;
/// Blocking-by-MOV-SS bit of the guest interruptibility state.
pub const INTERRUPTIBILITY_MOVSS_BLOCKING: u32 = 1 << 1;

/// Field I/O against one vCPU's VMCS.
///
/// The bare-metal variant requires its VMCS to be the current one
/// (VMPTRLD'd by the run loop); field access is VMREAD/VMWRITE. The
/// hosted variant is a plain map.
pub struct VmcsRegion {
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fields: BTreeMap<u32, u64>,
}

impl VmcsRegion {
    pub fn new() -> Self {
        Self {
            #[cfg(not(all(target_arch = "x86", target_os = "none")))]
            fields: BTreeMap::new(),
        }
    }

    /// Read a field of the current VMCS; unset fields read as zero.
    pub fn read(&self, field: u32) -> u64 {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let value: u32;
            // SAFETY: The run loop keeps this VMCS current while the
            // monitor touches it.
            unsafe {
                core::arch::asm!(
                    "vmread {value}, {field}",
                    field = in(reg) field,
                    value = out(reg) value,
                    options(nostack, nomem),
                );
            }
            value as u64
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            self.fields.get(&field).copied().unwrap_or(0)
        }
    }

    /// Write a field of the current VMCS.
    pub fn write(&mut self, field: u32, value: u64) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            // SAFETY: Same contract as `read`.
            unsafe {
                core::arch::asm!(
                    "vmwrite {field}, {value}",
                    field = in(reg) field,
                    value = in(reg) value as u32,
                    options(nostack, nomem),
                );
            }
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            self.fields.insert(field, value);
        }
    }
}

impl Default for VmcsRegion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_encodings_match_the_sdm() {
        assert_eq!(VmcsField::GUEST_RIP, 0x681E);
        assert_eq!(VmcsField::GUEST_RSP, 0x681C);
        assert_eq!(VmcsField::EXIT_REASON, 0x4402);
        assert_eq!(VmcsField::EXIT_QUALIFICATION, 0x6400);
        assert_eq!(VmcsField::GUEST_PHYSICAL_ADDRESS, 0x2400);
        assert_eq!(VmcsField::EPT_POINTER, 0x201A);
    }

    #[test]
    fn unset_fields_read_zero() {
        let mut vmcs = VmcsRegion::new();
        assert_eq!(vmcs.read(VmcsField::GUEST_RIP), 0);
        vmcs.write(VmcsField::GUEST_RIP, 0x7c00);
        assert_eq!(vmcs.read(VmcsField::GUEST_RIP), 0x7c00);
    }
}
