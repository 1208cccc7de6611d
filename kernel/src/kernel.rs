//! The kernel world value.
//!
//! All global mutable state (the TCB arena, the per-CPU scheduler
//! blocks, the page-table pool, the channel arena and the user-context
//! pool) is owned by one [`Kernel`] value built at boot. Components
//! never reach for hidden globals; the only global is the `spin::Once`
//! cell the trap and interrupt stubs read.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use crate::arch::Platform;
use crate::config::{KernelConfig, NUM_CHANNELS};
use crate::error::KernelError;
use crate::ipc::ChannelTable;
use crate::mm::MemoryManager;
use crate::process::{ProgramImage, UctxPool};
use crate::sched::{Pid, Scheduler};
use crate::sync::SpinLock;
use crate::virt::VirtVendor;

/// The assembled kernel.
pub struct Kernel {
    pub config: KernelConfig,
    pub platform: Platform,
    pub sched: Scheduler,
    pub mm: SpinLock<MemoryManager>,
    pub channels: ChannelTable,
    pub uctx: SpinLock<UctxPool>,
    /// Hypervisor backend selected at boot from CPUID, if any.
    pub vendor: Option<VirtVendor>,
    images: spin::Mutex<Vec<Box<dyn ProgramImage>>>,
}

impl Kernel {
    /// Build the world. Cheap enough for the test suite to do per test.
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            platform: Platform::new(),
            sched: Scheduler::new(&config),
            mm: SpinLock::new("mm", MemoryManager::new(config.ram_pages)),
            channels: ChannelTable::new(NUM_CHANNELS),
            uctx: SpinLock::new("uctx", UctxPool::new()),
            vendor: VirtVendor::detect(),
            images: spin::Mutex::new(Vec::new()),
        }
    }

    /// Register a loadable program image; returns the id `sys_spawn`
    /// accepts.
    pub fn register_image(&self, image: Box<dyn ProgramImage>) -> u32 {
        let mut images = self.images.lock();
        images.push(image);
        (images.len() - 1) as u32
    }

    /// Spawn a process from a registered image on `cpu`.
    pub fn spawn_image(&self, cpu: usize, image_id: u32, quota: u32) -> Result<Pid, KernelError> {
        let images = self.images.lock();
        let image = images
            .get(image_id as usize)
            .ok_or(KernelError::BadArg)?;
        crate::process::proc_create(self, cpu, image.as_ref(), quota)
    }
}

static KERNEL: spin::Once<Kernel> = spin::Once::new();

/// Install the global kernel for the trap and interrupt stubs.
/// Returns the existing one if already initialized.
pub fn init_global(config: KernelConfig) -> &'static Kernel {
    KERNEL.call_once(|| Kernel::new(config))
}

/// The global kernel; panics before [`init_global`].
pub fn global() -> &'static Kernel {
    KERNEL.get().expect("kernel not initialized")
}
