//! Process creation and the first entry into user mode.
//!
//! A process is a thread plus an address space plus a saved user
//! context. `proc_create` assembles the three and primes the trap frame;
//! `proc_start_user` is the kernel entry every new process starts in,
//! which installs the address space and returns to the user trap frame.
//! ELF parsing stays outside the kernel behind [`ProgramImage`].

pub mod uctx;

pub use uctx::{UctxPool, UserContext};

use crate::config::{PAGESIZE, SHARED_PAGE_VADDR, VM_USERHI};
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::mm::{FrameAlloc, MemoryManager, MmError, PtePerm};
use crate::sched::Pid;

use self::uctx::{FL_IF, GDT_UCODE, GDT_UDATA, RPL_USER};

/// A loadable program image. The ELF reader lives with the boot
/// collaborator; the kernel only consumes entry point and segments.
pub trait ProgramImage: Send + Sync {
    /// User-mode entry point.
    fn entry(&self) -> u32;
    /// Map the image's segments into the address space of `pid`.
    fn load(&self, pid: Pid, mm: &mut MemoryManager) -> Result<(), MmError>;
}

/// Kernel-side entry of every user process.
///
/// Runs with no locks held: the scheduler lock was dropped before the
/// context switch that started this thread. Installs the kernel stack
/// and the address space, then returns to the saved user trap frame.
pub fn proc_start_user(kernel: &Kernel, cpu: usize) {
    let cur = kernel
        .sched
        .cur_pid(cpu)
        .expect("proc_start_user with no current thread");

    crate::log_service::log_init();

    let stack_top = kernel
        .sched
        .with_inner(|inner| inner.tcbs.get(cur).kstack.as_ref().map(|s| s.top()))
        .expect("user process without a kernel stack");
    kernel.platform.kstack_switch(stack_top);

    let root = kernel.mm.lock().pt.install(cur.as_usize());
    kernel.platform.install_pdir(root);

    kernel.sched.note_user_entry(cpu, cur);

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let frame = kernel.uctx.lock().get(cur) as *const UserContext;
        // SAFETY: The frame was primed by proc_create and stays pinned in
        // the uctx pool; trap_return never returns.
        unsafe { crate::arch::x86::trap_return(frame) }
    }
}

/// Bare-metal thread entry wrapper around [`proc_start_user`].
#[cfg(target_os = "none")]
pub extern "C" fn user_entry() -> ! {
    let kernel = crate::kernel::global();
    let cpu = crate::arch::cpu_id();
    proc_start_user(kernel, cpu);
    unreachable!("trap_return came back")
}

/// Hosted stand-in for the thread entry; never executed because the
/// hosted context switch records instead of jumping.
#[cfg(not(target_os = "none"))]
pub extern "C" fn user_entry() -> ! {
    unreachable!("user_entry executed on a hosted target")
}

/// Create a process from `image` on the caller's CPU.
///
/// Allocates a thread whose kernel entry is [`user_entry`], builds the
/// address space (user stack page, optional shared page, image
/// segments), pairs a channel with the parent and primes the user trap
/// frame. Partial state is rolled back on every failure path.
pub fn proc_create(
    kernel: &Kernel,
    cpu: usize,
    image: &dyn ProgramImage,
    quota: u32,
) -> Result<Pid, KernelError> {
    let parent = kernel
        .sched
        .cur_pid(cpu)
        .expect("proc_create with no current thread");
    let pid = kernel.sched.spawn(cpu, user_entry, parent, quota)?;

    let stack_frame = {
        let mut mm = kernel.mm.lock();
        mm.pt.pdir_init(pid.as_usize());

        let stack_frame = match mm.frames.alloc_frame() {
            Some(f) => f,
            None => {
                drop(mm);
                kernel.sched.cancel_spawn(pid);
                return Err(KernelError::OutOfMemory);
            }
        };
        if let Err(e) = mm.map_page(
            pid.as_usize(),
            VM_USERHI - PAGESIZE as u32,
            stack_frame,
            PtePerm::P | PtePerm::U | PtePerm::W,
        ) {
            mm.frames.free_frame(stack_frame);
            drop(mm);
            kernel.sched.cancel_spawn(pid);
            return Err(e.into());
        }

        if let Some(shared) = kernel.config.shared_page {
            // The shared frame is spliced identically into every process.
            mm.map_page(
                pid.as_usize(),
                SHARED_PAGE_VADDR,
                shared,
                PtePerm::P | PtePerm::U | PtePerm::W,
            )
            .expect("could not map shared page");
        }

        if let Err(e) = image.load(pid, &mut mm) {
            mm.frames.free_frame(stack_frame);
            drop(mm);
            kernel.sched.cancel_spawn(pid);
            return Err(e.into());
        }
        stack_frame
    };

    let channel = match kernel
        .channels
        .alloc(parent, pid, crate::ipc::ChannelType::Bidirect)
    {
        Ok(ch) => ch,
        Err(e) => {
            kernel.mm.lock().frames.free_frame(stack_frame);
            kernel.sched.cancel_spawn(pid);
            return Err(e.into());
        }
    };
    kernel
        .sched
        .with_inner(|inner| inner.tcbs.get_mut(pid).parent_channel = Some(channel));

    {
        let mut pool = kernel.uctx.lock();
        let frame = pool.get_mut(pid);
        *frame = UserContext::default();
        frame.es = GDT_UDATA | RPL_USER;
        frame.ds = GDT_UDATA | RPL_USER;
        frame.cs = GDT_UCODE | RPL_USER;
        frame.ss = GDT_UDATA | RPL_USER;
        frame.esp = VM_USERHI;
        frame.eflags = FL_IF;
        frame.eip = image.entry();
    }

    log::debug!("[proc] created process {} (parent {})", pid, parent);
    Ok(pid)
}

/// Save a trap frame for the running process of `cpu` (trap entry path).
pub fn proc_save(kernel: &Kernel, cpu: usize, frame: &UserContext) {
    let cur = kernel
        .sched
        .cur_pid(cpu)
        .expect("proc_save with no current thread");
    kernel.uctx.lock().save(cur, frame);
}

/// Reap one dead process of `cpu`: recycle the TCB and free the
/// resources the thread layer does not own (parent channel).
pub fn proc_reap(kernel: &Kernel, cpu: usize) -> Option<Pid> {
    let reaped = kernel.sched.reap(cpu)?;
    if let Some(ch) = reaped.parent_channel {
        let _ = kernel.channels.free(ch);
    }
    Some(reaped.pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchEvent;
    use crate::config::{KernelConfig, VM_USERLO};
    use crate::sched::ThreadState;

    struct FlatImage {
        entry: u32,
        pages: u32,
    }

    impl ProgramImage for FlatImage {
        fn entry(&self) -> u32 {
            self.entry
        }

        fn load(&self, pid: Pid, mm: &mut MemoryManager) -> Result<(), MmError> {
            for i in 0..self.pages {
                let frame = mm.frames.alloc_frame().ok_or(MmError::NoMem)?;
                mm.map_page(
                    pid.as_usize(),
                    VM_USERLO + i * PAGESIZE as u32,
                    frame,
                    PtePerm::P | PtePerm::U | PtePerm::W,
                )?;
            }
            Ok(())
        }
    }

    #[test]
    fn proc_create_builds_thread_space_and_frame() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.sched.init_cpu(0);
        let image = FlatImage {
            entry: VM_USERLO + 0x100,
            pages: 2,
        };

        let pid = proc_create(&kernel, 0, &image, 64).unwrap();
        assert_eq!(pid, Pid(1));
        assert_eq!(kernel.sched.thread_state(pid), ThreadState::Inited);
        assert_eq!(kernel.sched.ready_pids(0), [pid]);

        // Stack page mapped just below VM_USERHI, user-writable.
        let mm = kernel.mm.lock();
        let (_, perm) = mm
            .resolve(pid.as_usize(), VM_USERHI - PAGESIZE as u32)
            .expect("stack page not mapped");
        assert_eq!(perm, PtePerm::P | PtePerm::U | PtePerm::W);
        drop(mm);

        // Trap frame primed for ring 3 with interrupts enabled.
        let pool = kernel.uctx.lock();
        let frame = pool.get(pid);
        assert_eq!(frame.cs, GDT_UCODE | RPL_USER);
        assert_eq!(frame.ss, GDT_UDATA | RPL_USER);
        assert_eq!(frame.esp, VM_USERHI);
        assert_eq!(frame.eflags, FL_IF);
        assert_eq!(frame.eip, image.entry());
        drop(pool);

        // Paired with the parent through a fresh channel.
        let ch = kernel
            .sched
            .with_inner(|inner| inner.tcbs.get(pid).parent_channel)
            .unwrap();
        assert_eq!(kernel.channels.endpoints(ch).unwrap(), (Pid(0), pid));
    }

    #[test]
    fn shared_page_is_spliced_when_configured() {
        let kernel = Kernel::new(KernelConfig {
            shared_page: Some(0x700),
            ..KernelConfig::default()
        });
        kernel.sched.init_cpu(0);
        let image = FlatImage {
            entry: VM_USERLO,
            pages: 0,
        };

        let a = proc_create(&kernel, 0, &image, 8).unwrap();
        let b = proc_create(&kernel, 0, &image, 8).unwrap();

        let mm = kernel.mm.lock();
        let (fa, pa) = mm.resolve(a.as_usize(), SHARED_PAGE_VADDR).unwrap();
        let (fb, pb) = mm.resolve(b.as_usize(), SHARED_PAGE_VADDR).unwrap();
        assert_eq!(fa, 0x700);
        assert_eq!(fa, fb);
        assert_eq!(pa, pb);
    }

    #[test]
    fn failed_load_rolls_back_the_spawn() {
        struct FailingImage;
        impl ProgramImage for FailingImage {
            fn entry(&self) -> u32 {
                VM_USERLO
            }
            fn load(&self, _pid: Pid, _mm: &mut MemoryManager) -> Result<(), MmError> {
                Err(MmError::NoMem)
            }
        }

        let kernel = Kernel::new(KernelConfig::default());
        kernel.sched.init_cpu(0);
        let err = proc_create(&kernel, 0, &FailingImage, 8).unwrap_err();
        assert_eq!(err, KernelError::OutOfMemory);
        assert_eq!(kernel.sched.thread_state(Pid(1)), ThreadState::Free);
        assert!(kernel.sched.ready_pids(0).is_empty());
        kernel.sched.check_invariants();
    }

    #[test]
    fn first_user_entry_installs_space_and_stack() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.sched.init_cpu(0);
        let image = FlatImage {
            entry: VM_USERLO,
            pages: 1,
        };
        let pid = proc_create(&kernel, 0, &image, 8).unwrap();
        kernel.sched.yield_cpu(&kernel.platform, 0);
        assert_eq!(kernel.sched.cur_pid(0), Some(pid));
        kernel.platform.take_events();

        proc_start_user(&kernel, 0);

        assert_eq!(kernel.sched.last_active(0), Some(pid));
        assert_eq!(kernel.mm.lock().pt.current(), Some(pid.as_usize()));
        let events = kernel.platform.take_events();
        assert!(matches!(events[0], ArchEvent::KstackSwitch(_)));
        assert!(matches!(events[1], ArchEvent::InstallPdir(_)));
    }

    #[test]
    fn reap_frees_the_parent_channel() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.sched.init_cpu(0);
        let image = FlatImage {
            entry: VM_USERLO,
            pages: 0,
        };
        let pid = proc_create(&kernel, 0, &image, 8).unwrap();
        let ch = kernel
            .sched
            .with_inner(|inner| inner.tcbs.get(pid).parent_channel)
            .unwrap();

        kernel.sched.yield_cpu(&kernel.platform, 0);
        kernel.sched.exit_cur(&kernel.platform, 0);
        assert_eq!(proc_reap(&kernel, 0), Some(pid));
        assert_eq!(
            kernel.channels.endpoints(ch),
            Err(crate::ipc::IpcError::BadChannel)
        );
    }
}
