//! Virtualization: VMX guest execution, EPT, SVM bring-up and the
//! emulated legacy devices.
//!
//! A guest vCPU is an ordinary kernel thread whose user context is
//! replaced by VMCS/VMCB state. The monitor loop runs the guest, reads
//! back a canonical exit reason, dispatches it, and resumes.

pub mod ept;
pub mod monitor;
pub mod svm;
pub mod vdev;
pub mod vmx;

use core::fmt;

/// Virtualization errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Hardware virtualization absent or disabled by firmware.
    NotSupported,
    /// EPT table pool exhausted.
    NoMem,
    /// Exit reason outside the known set.
    InvalidExit,
    /// An event injection is already pending.
    AlreadyInjected,
    /// Register outside the canonical set.
    BadRegister,
    /// VMCS read/write failed.
    VmcsAccess,
    /// VMLAUNCH/VMRESUME refused the guest state.
    EntryFailed,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "virtualization not supported"),
            Self::NoMem => write!(f, "EPT table pool exhausted"),
            Self::InvalidExit => write!(f, "invalid exit reason"),
            Self::AlreadyInjected => write!(f, "event injection pending"),
            Self::BadRegister => write!(f, "bad guest register"),
            Self::VmcsAccess => write!(f, "VMCS access failed"),
            Self::EntryFailed => write!(f, "VM entry failed"),
        }
    }
}

/// Hypervisor backend, chosen once at boot from the CPU vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtVendor {
    /// Intel VT-x (VMX + EPT).
    Intel,
    /// AMD-V (SVM + NPT).
    Amd,
}

impl VirtVendor {
    /// Detect the backend from the CPUID vendor string.
    pub fn detect() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: CPUID leaf 0 is available on every x86_64 CPU.
            let id = unsafe { core::arch::x86_64::__cpuid(0) };
            Self::from_vendor_words(id.ebx, id.edx, id.ecx)
        }
        #[cfg(target_arch = "x86")]
        {
            let (ebx, edx, ecx): (u32, u32, u32);
            // SAFETY: CPUID leaf 0 reads only; ebx is preserved around
            // the call because LLVM reserves it.
            unsafe {
                core::arch::asm!(
                    "push ebx", "cpuid", "mov {b}, ebx", "pop ebx",
                    b = out(reg) ebx,
                    inout("eax") 0u32 => _, out("ecx") ecx, out("edx") edx,
                    options(nomem),
                );
            }
            Self::from_vendor_words(ebx, edx, ecx)
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
        {
            None
        }
    }

    fn from_vendor_words(ebx: u32, edx: u32, ecx: u32) -> Option<Self> {
        let mut vendor = [0u8; 12];
        vendor[0..4].copy_from_slice(&ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&edx.to_le_bytes());
        vendor[8..12].copy_from_slice(&ecx.to_le_bytes());
        match &vendor {
            b"GenuineIntel" => Some(Self::Intel),
            b"AuthenticAMD" => Some(Self::Amd),
            _ => None,
        }
    }
}

/// Canonical exit reasons the monitor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Guest exception or NMI.
    Exception,
    /// External (host) interrupt.
    ExtInterrupt,
    /// The requested interrupt window opened.
    InterruptWindow,
    /// IN/OUT instruction.
    IoPort,
    /// Second-level (EPT) translation fault.
    PageFault,
    /// CPUID.
    Cpuid,
    /// RDTSC.
    Rdtsc,
    /// RDMSR.
    Rdmsr,
    /// WRMSR.
    Wrmsr,
    /// VMCALL hypercall.
    Hypercall,
    /// An instruction the guest must not execute (VMX instructions,
    /// HLT, MWAIT, MONITOR).
    InvalInstr,
    /// Anything else; the monitor halts the guest.
    Invalid,
}

/// Operand width of a guest I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWidth {
    Sz8,
    Sz16,
    Sz32,
}

/// Log the detected virtualization capabilities.
pub fn init() {
    match VirtVendor::detect() {
        Some(VirtVendor::Intel) => println!("  [virt] backend: Intel VT-x"),
        Some(VirtVendor::Amd) => println!("  [virt] backend: AMD-V"),
        None => println!("  [virt] no hardware virtualization"),
    }
}
