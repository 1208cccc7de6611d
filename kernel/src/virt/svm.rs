//! AMD-V (SVM) bring-up.
//!
//! Mirrors the VMX path on AMD parts: feature check via CPUID and the
//! VM_CR MSR, `EFER.SVME` enable, and registration of the page-aligned
//! host state-save area. Guest execution uses the same canonical exit
//! surface as VMX; only the bring-up differs.

use super::VmError;
use crate::config::PAGESIZE;

/// CPUID 0x8000_0001 ECX bit advertising SVM.
const CPUID_FEATURE_SVM: u32 = 1 << 2;
/// CPUID 0x8000_000A EDX bit: SVM disable is locked with a key.
const CPUID_SVM_LOCKED: u32 = 1 << 2;

/// VM_CR MSR.
pub const MSR_VM_CR: u32 = 0xc001_0114;
/// VM_CR bit: SVM disabled.
pub const MSR_VM_CR_SVMDIS: u64 = 1 << 4;
/// Host state-save area MSR.
pub const MSR_VM_HSAVE_PA: u32 = 0xc001_0117;
/// EFER MSR.
pub const MSR_EFER: u32 = 0xc000_0080;
/// EFER bit enabling SVM.
pub const MSR_EFER_SVME: u64 = 1 << 12;

/// Decide SVM availability from the raw feature words.
///
/// `feature_ecx` is CPUID 0x8000_0001 ECX, `vm_cr` the VM_CR MSR, and
/// `svm_edx` CPUID 0x8000_000A EDX. Pure so the decision table is
/// checkable off the metal.
pub fn svm_available(feature_ecx: u32, vm_cr: u64, svm_edx: u32) -> Result<(), VmError> {
    if feature_ecx & CPUID_FEATURE_SVM == 0 {
        return Err(VmError::NotSupported);
    }
    if vm_cr & MSR_VM_CR_SVMDIS == 0 {
        return Ok(());
    }
    // SVM is disabled; locked-with-key and plain BIOS-disable are both
    // unusable without firmware cooperation.
    let _ = svm_edx & CPUID_SVM_LOCKED;
    Err(VmError::NotSupported)
}

/// The page-aligned host state-save area registered with the CPU.
#[repr(C, align(4096))]
pub struct HostSaveArea([u8; PAGESIZE]);

impl HostSaveArea {
    pub const fn new() -> Self {
        Self([0; PAGESIZE])
    }
}

impl Default for HostSaveArea {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
static mut HSAVE_AREA: HostSaveArea = HostSaveArea::new();

/// Check for SVM, set `EFER.SVME` and register the host-save area.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn svm_init() -> Result<(), VmError> {
    let (ecx_features, edx_svm): (u32, u32);
    // SAFETY: CPUID reads only.
    unsafe {
        let ecx: u32;
        core::arch::asm!(
            "push ebx", "cpuid", "pop ebx",
            inout("eax") 0x8000_0001u32 => _, out("ecx") ecx, out("edx") _,
            options(nomem),
        );
        ecx_features = ecx;
        let edx: u32;
        core::arch::asm!(
            "push ebx", "cpuid", "pop ebx",
            inout("eax") 0x8000_000Au32 => _, out("ecx") _, out("edx") edx,
            options(nomem),
        );
        edx_svm = edx;
    }
    // SAFETY: RDMSR of VM_CR at ring 0.
    let vm_cr = unsafe { rdmsr(MSR_VM_CR) };
    svm_available(ecx_features, vm_cr, edx_svm)?;

    // SAFETY: Setting EFER.SVME is the architectural enable sequence;
    // the host-save area is static, page-aligned and exclusively ours.
    unsafe {
        wrmsr(MSR_EFER, rdmsr(MSR_EFER) | MSR_EFER_SVME);
        let hsave = core::ptr::addr_of_mut!(HSAVE_AREA) as usize as u64;
        wrmsr(MSR_VM_HSAVE_PA, hsave);
    }
    println!("  [svm] enabled, host-save area registered");
    Ok(())
}

/// Hosted builds cannot program MSRs.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn svm_init() -> Result<(), VmError> {
    Err(VmError::NotSupported)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
unsafe fn rdmsr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: Caller is at ring 0 and names a valid MSR.
    unsafe {
        core::arch::asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
unsafe fn wrmsr(msr: u32, value: u64) {
    // SAFETY: Caller is at ring 0 and names a valid MSR.
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack)
        );
    }
}
