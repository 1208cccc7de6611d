//! Kernel-wide constants and boot-time configuration.
//!
//! Every tunable the core subsystems consume lives here; the boot glue
//! builds a [`KernelConfig`] from the multiboot information and hands it
//! to [`crate::kernel::Kernel::new`].

/// Maximum number of processor cores the kernel is built for.
pub const NUM_CPUS: usize = 8;

/// Number of thread/process identifiers (TCB pool size).
pub const NUM_IDS: usize = 64;

/// Upper bound of the pid space; pids are in `[0, MAX_PID)`.
pub const MAX_PID: usize = NUM_IDS;

/// Number of process page directories kept in the page-table pool.
pub const NUM_PROC: usize = 64;

/// Page size in bytes.
pub const PAGESIZE: usize = 4096;

/// 32-bit words per page.
pub const PAGE_WORDS: usize = PAGESIZE / 4;

/// Entries per page directory / page table in the two-level scheme.
pub const PDIR_ENTRIES: usize = 1024;

/// Bytes covered by one page-directory entry.
pub const PDIR_SIZE: u32 = (PDIR_ENTRIES * PAGESIZE) as u32;

/// Bottom of the user virtual address range.
pub const VM_USERLO: u32 = 0x4000_0000;

/// Top of the user virtual address range; also the initial user stack top.
pub const VM_USERHI: u32 = 0xF000_0000;

/// First page-directory index of the user range.
pub const VM_USERLO_PDE: usize = (VM_USERLO / PDIR_SIZE) as usize;

/// First page-directory index above the user range.
pub const VM_USERHI_PDE: usize = (VM_USERHI / PDIR_SIZE) as usize;

/// Virtual address at which the optional globally shared page is spliced
/// into every new process.
pub const SHARED_PAGE_VADDR: u32 = VM_USERLO + 32 * PAGESIZE as u32;

/// Kernel stack size per thread, in bytes.
pub const KSTACK_SIZE: usize = 4096;

/// Scheduling quantum in milliseconds.
pub const SCHED_SLICE: u64 = 100;

/// LAPIC timer interrupt frequency in Hz. Each tick accounts
/// `1000 / LAPIC_TIMER_INTR_FREQ` milliseconds against the running thread.
pub const LAPIC_TIMER_INTR_FREQ: u64 = 100;

/// Milliseconds accounted per LAPIC timer tick.
pub const TICK_MS: u64 = 1000 / LAPIC_TIMER_INTR_FREQ;

/// Capacity of a channel message in bytes.
pub const CHANNEL_BUFFER_SIZE: usize = 64;

/// Number of channels in the channel arena.
pub const NUM_CHANNELS: usize = NUM_IDS;

/// i8253/8254 input clock in Hz.
pub const PIT_FREQ: u32 = 1_193_182;

/// IRQ line of the (virtual and physical) interval timer.
pub const IRQ_TIMER: u8 = 0;

/// Boot-time configuration assembled by the loader collaborator.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Number of cores actually brought online; at most [`NUM_CPUS`].
    pub num_cpus: usize,
    /// Scheduling quantum in milliseconds.
    pub sched_slice_ms: u64,
    /// LAPIC timer frequency in Hz.
    pub timer_freq_hz: u64,
    /// Pages of flat physical RAM the memory manager may use for page
    /// tables and user frames (seeded from the multiboot memory map).
    pub ram_pages: usize,
    /// Frame index of the globally shared page, if sharing is enabled.
    pub shared_page: Option<u32>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            sched_slice_ms: SCHED_SLICE,
            timer_freq_hz: LAPIC_TIMER_INTR_FREQ,
            ram_pages: 2048,
            shared_page: None,
        }
    }
}

impl KernelConfig {
    /// Milliseconds accounted per timer tick for this configuration.
    pub fn tick_ms(&self) -> u64 {
        1000 / self.timer_freq_hz
    }
}
