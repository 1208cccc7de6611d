//! Architecture layer.
//!
//! Everything that touches privileged state funnels through here. On bare
//! metal ([`x86`]) the operations are real instruction sequences; on
//! hosted targets they record their effects into the per-world
//! [`Platform`] so the core state machines stay observable under test.
//!
//! The LAPIC/IOAPIC themselves are external collaborators; only the
//! send-reschedule-IPI and timer-frequency contracts are consumed here.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(feature = "alloc")]
extern crate alloc;

use crate::sched::context::KernelContext;
use crate::sched::Pid;

/// Index of the executing CPU.
pub fn cpu_id() -> usize {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        x86::pcpu_index()
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        0
    }
}

/// Disable interrupts, returning whether they were enabled.
pub fn intr_save() -> bool {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        x86::intr_save()
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        false
    }
}

/// Restore the interrupt flag saved by [`intr_save`].
pub fn intr_restore(enable: bool) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::intr_restore(enable);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = enable;
}

/// Relax the CPU inside a wait loop.
pub fn halt() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::halt();
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    core::hint::spin_loop();
}

/// Read the time-stamp counter.
pub fn read_tsc() -> u64 {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        x86::rdtsc()
    }
    #[cfg(all(target_arch = "x86_64", not(target_os = "none")))]
    {
        // SAFETY: RDTSC has no side effects and is available on every
        // x86_64 host this builds for.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(any(
        all(target_arch = "x86", target_os = "none"),
        all(target_arch = "x86_64", not(target_os = "none"))
    )))]
    {
        use core::sync::atomic::{AtomicU64, Ordering};
        static FAKE_TSC: AtomicU64 = AtomicU64::new(0);
        FAKE_TSC.fetch_add(1, Ordering::Relaxed)
    }
}

/// A privileged-state effect, as recorded by the hosted [`Platform`].
#[cfg(not(target_os = "none"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchEvent {
    /// Reschedule IPI sent to a remote CPU.
    RescheduleIpi(usize),
    /// Page-directory root installed (CR3 equivalent).
    InstallPdir(usize),
    /// Kernel stack top installed (TSS esp0 equivalent).
    KstackSwitch(usize),
    /// Kernel context switch performed.
    ContextSwitch { from: Option<Pid>, to: Pid },
    /// Byte written to an I/O port.
    PortWrite(u16, u8),
}

/// Per-world handle to privileged operations.
///
/// Owned by the kernel world value so the effects of one world never
/// bleed into another (the test suite builds many worlds concurrently).
pub struct Platform {
    #[cfg(not(target_os = "none"))]
    events: spin::Mutex<alloc::vec::Vec<ArchEvent>>,
}

impl Platform {
    pub const fn new() -> Self {
        Self {
            #[cfg(not(target_os = "none"))]
            events: spin::Mutex::new(alloc::vec::Vec::new()),
        }
    }

    /// Send a reschedule IPI to `cpu`.
    pub fn send_reschedule_ipi(&self, cpu: usize) {
        #[cfg(target_os = "none")]
        {
            extern "C" {
                // Provided by the LAPIC collaborator.
                fn lapic_send_reschedule(cpu: u32);
            }
            // SAFETY: The collaborator accepts any CPU index and performs
            // the ICR write itself.
            unsafe { lapic_send_reschedule(cpu as u32) };
        }
        #[cfg(not(target_os = "none"))]
        self.record(ArchEvent::RescheduleIpi(cpu));
    }

    /// Install a page-directory root (CR3 equivalent).
    pub fn install_pdir(&self, root: usize) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: The page-table pool hands us the root of a directory
        // whose kernel range identity-maps the executing kernel.
        unsafe {
            x86::set_cr3(root)
        };
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        self.record_pdir(root);
    }

    #[cfg(not(target_os = "none"))]
    fn record_pdir(&self, root: usize) {
        self.record(ArchEvent::InstallPdir(root));
    }

    /// Install the kernel stack top for ring transitions (TSS esp0).
    pub fn kstack_switch(&self, stack_top: usize) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        x86::set_tss_esp0(stack_top);
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        self.record(ArchEvent::KstackSwitch(stack_top));
    }

    /// Switch kernel contexts.
    ///
    /// With `from = None` this is the first-ever switch on the CPU and the
    /// outgoing register set is saved into a throwaway slot.
    ///
    /// # Safety
    /// `from`/`to` must point into the TCB arena and stay valid for the
    /// duration of the switch; the caller must have already published the
    /// scheduler state for the incoming thread.
    pub unsafe fn context_switch(
        &self,
        from_pid: Option<Pid>,
        to_pid: Pid,
        from: *mut KernelContext,
        to: *const KernelContext,
    ) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let mut throwaway = KernelContext::zeroed();
            let from = if from_pid.is_some() {
                from
            } else {
                &mut throwaway as *mut KernelContext
            };
            // SAFETY: Caller upholds the pointer contract; swtch only
            // touches the two context records and the stacks they name.
            unsafe { x86::swtch(from, to) };
            let _ = to_pid;
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            let _ = (from, to);
            self.record(ArchEvent::ContextSwitch {
                from: from_pid,
                to: to_pid,
            });
        }
    }

    /// Write a byte to an I/O port.
    pub fn outb(&self, port: u16, value: u8) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: Port I/O is the caller's contract with the platform.
        unsafe {
            x86::outb(port, value)
        };
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        self.record(ArchEvent::PortWrite(port, value));
    }

    #[cfg(not(target_os = "none"))]
    fn record(&self, ev: ArchEvent) {
        self.events.lock().push(ev);
    }

    /// Drain the recorded effects (hosted builds only).
    #[cfg(not(target_os = "none"))]
    pub fn take_events(&self) -> alloc::vec::Vec<ArchEvent> {
        core::mem::take(&mut *self.events.lock())
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_records_effects() {
        let plat = Platform::new();
        plat.send_reschedule_ipi(2);
        plat.kstack_switch(0x8000);
        let events = plat.take_events();
        assert_eq!(events[0], ArchEvent::RescheduleIpi(2));
        assert_eq!(events[1], ArchEvent::KstackSwitch(0x8000));
        assert!(plat.take_events().is_empty());
    }

    #[test]
    fn tsc_is_monotonic_enough() {
        let a = read_tsc();
        let b = read_tsc();
        assert!(b >= a);
    }
}
