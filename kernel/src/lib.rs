//! VesperOS Kernel Library
//!
//! A small multi-core research kernel with a Type-1 hypervisor core:
//! per-CPU round-robin scheduling, two-level paging bound to process
//! identity, channel-based IPC, and a VMX/SVM guest execution core with
//! an emulated i8253/8254 interval timer.
//!
//! The crate builds for two kinds of targets:
//! - bare metal (`target_os = "none"`), where the arch layer uses real
//!   privileged instructions, and
//! - hosted targets, where the arch layer records its effects so the
//!   core state machines can be driven by the standard test harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// On bare metal the kernel heap is a linked-list allocator over a region
// handed over by the boot collaborator. On hosted targets (used for the
// test suite) we link std and delegate to the system allocator so test
// code using Vec/String compiles and runs.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod log_service;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod virt;

// Re-exports for the trap glue and the test suite.
pub use config::KernelConfig;
pub use error::KernelError;
pub use kernel::Kernel;
pub use sched::{BlockReason, Pid, ThreadState};

/// Initialize the bare-metal kernel heap.
///
/// # Safety
/// `heap_start..heap_start + heap_size` must be an unused, writable region
/// that stays reserved for the allocator for the lifetime of the kernel.
#[cfg(target_os = "none")]
pub unsafe fn heap_init(heap_start: usize, heap_size: usize) {
    // SAFETY: The caller guarantees the region is valid and exclusively
    // owned by the allocator.
    unsafe {
        ALLOCATOR.lock().init(heap_start as *mut u8, heap_size);
    }
}

#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout)
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[panic] {}", info);
    loop {
        arch::halt();
    }
}
