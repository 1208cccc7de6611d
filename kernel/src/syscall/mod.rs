//! System call argument marshalling and dispatch.
//!
//! The ABI is register-based: arguments arrive in
//! `eax, ebx, ecx, edx, esi, edi` (arg1..arg6) of the saved trap frame,
//! return values go back in `ebx, ecx, edx, esi, edi` (ret1..ret5), and
//! the error number lands in the frame's `err` slot. The handlers here
//! are the kernel-facing entry points; argument semantics beyond the
//! marshalling contract live with the user library.

use crate::error::KernelError;
use crate::ipc::{RecvOutcome, SendOutcome};
use crate::kernel::Kernel;
use crate::sched::Pid;

/// Syscall numbers (arg1).
pub const SYS_PUTS: u32 = 0;
pub const SYS_SPAWN: u32 = 1;
pub const SYS_YIELD: u32 = 2;
pub const SYS_FORK: u32 = 3;
pub const SYS_SEND: u32 = 4;
pub const SYS_RECV: u32 = 5;

/// Errno value of a successful syscall.
pub const E_SUCC: u32 = 0;

fn cur(kernel: &Kernel, cpu: usize) -> Pid {
    kernel
        .sched
        .cur_pid(cpu)
        .expect("syscall with no current thread")
}

pub fn syscall_get_arg1(kernel: &Kernel, cpu: usize) -> u32 {
    kernel.uctx.lock().get(cur(kernel, cpu)).regs.eax
}

pub fn syscall_get_arg2(kernel: &Kernel, cpu: usize) -> u32 {
    kernel.uctx.lock().get(cur(kernel, cpu)).regs.ebx
}

pub fn syscall_get_arg3(kernel: &Kernel, cpu: usize) -> u32 {
    kernel.uctx.lock().get(cur(kernel, cpu)).regs.ecx
}

pub fn syscall_get_arg4(kernel: &Kernel, cpu: usize) -> u32 {
    kernel.uctx.lock().get(cur(kernel, cpu)).regs.edx
}

pub fn syscall_get_arg5(kernel: &Kernel, cpu: usize) -> u32 {
    kernel.uctx.lock().get(cur(kernel, cpu)).regs.esi
}

pub fn syscall_get_arg6(kernel: &Kernel, cpu: usize) -> u32 {
    kernel.uctx.lock().get(cur(kernel, cpu)).regs.edi
}

pub fn syscall_set_errno(kernel: &Kernel, cpu: usize, errno: u32) {
    kernel.uctx.lock().get_mut(cur(kernel, cpu)).err = errno;
}

pub fn syscall_set_retval1(kernel: &Kernel, cpu: usize, val: u32) {
    kernel.uctx.lock().get_mut(cur(kernel, cpu)).regs.ebx = val;
}

pub fn syscall_set_retval2(kernel: &Kernel, cpu: usize, val: u32) {
    kernel.uctx.lock().get_mut(cur(kernel, cpu)).regs.ecx = val;
}

pub fn syscall_set_retval3(kernel: &Kernel, cpu: usize, val: u32) {
    kernel.uctx.lock().get_mut(cur(kernel, cpu)).regs.edx = val;
}

pub fn syscall_set_retval4(kernel: &Kernel, cpu: usize, val: u32) {
    kernel.uctx.lock().get_mut(cur(kernel, cpu)).regs.esi = val;
}

pub fn syscall_set_retval5(kernel: &Kernel, cpu: usize, val: u32) {
    kernel.uctx.lock().get_mut(cur(kernel, cpu)).regs.edi = val;
}

/// Dispatch the syscall of the current thread of `cpu`.
///
/// The handlers write return values and the errno into the trap frame;
/// a blocking IPC operation leaves the frame untouched so the syscall
/// restarts when the thread is woken.
pub fn dispatch(kernel: &Kernel, cpu: usize) {
    let nr = syscall_get_arg1(kernel, cpu);
    match nr {
        SYS_PUTS => sys_puts(kernel, cpu),
        SYS_SPAWN => sys_spawn(kernel, cpu),
        SYS_YIELD => sys_yield(kernel, cpu),
        SYS_FORK => sys_fork(kernel, cpu),
        SYS_SEND => sys_send(kernel, cpu),
        SYS_RECV => sys_recv(kernel, cpu),
        _ => syscall_set_errno(kernel, cpu, KernelError::BadArg.to_errno()),
    }
}

/// Write a user string to the console. Copying from user space belongs
/// to the marshalling collaborator; the kernel side only logs the call.
fn sys_puts(kernel: &Kernel, cpu: usize) {
    let pid = cur(kernel, cpu);
    crate::log_service::klog(crate::log_service::LogLevel::Info, "sys", "puts");
    log::trace!("[sys] puts from {}", pid);
    syscall_set_errno(kernel, cpu, E_SUCC);
}

/// Spawn a process from a registered program image.
/// arg2 = image id, arg3 = quota; ret1 = child pid.
fn sys_spawn(kernel: &Kernel, cpu: usize) {
    let image_id = syscall_get_arg2(kernel, cpu);
    let quota = syscall_get_arg3(kernel, cpu);
    match kernel.spawn_image(cpu, image_id, quota) {
        Ok(pid) => {
            syscall_set_retval1(kernel, cpu, pid.0);
            syscall_set_errno(kernel, cpu, E_SUCC);
        }
        Err(e) => syscall_set_errno(kernel, cpu, e.to_errno()),
    }
}

fn sys_yield(kernel: &Kernel, cpu: usize) {
    syscall_set_errno(kernel, cpu, E_SUCC);
    kernel.sched.yield_cpu(&kernel.platform, cpu);
}

/// Fork is carried by the resource-container subsystem, which is not
/// part of this kernel.
fn sys_fork(kernel: &Kernel, cpu: usize) {
    syscall_set_errno(kernel, cpu, KernelError::NotSupported.to_errno());
}

/// Send on the channel shared with the parent.
/// arg2 = channel id, arg3 = payload word; blocking leaves the frame
/// untouched for restart.
fn sys_send(kernel: &Kernel, cpu: usize) {
    let ch = crate::ipc::ChannelId(syscall_get_arg2(kernel, cpu));
    let payload = syscall_get_arg3(kernel, cpu).to_le_bytes();
    match crate::ipc::send_msg(
        &kernel.sched,
        &kernel.channels,
        &kernel.platform,
        cpu,
        ch,
        &payload,
    ) {
        Ok(SendOutcome::Sent) => syscall_set_errno(kernel, cpu, E_SUCC),
        Ok(SendOutcome::Blocked) => {}
        Err(e) => syscall_set_errno(kernel, cpu, KernelError::from(e).to_errno()),
    }
}

/// Receive from a channel. arg2 = channel id; ret1 = payload word.
fn sys_recv(kernel: &Kernel, cpu: usize) {
    let ch = crate::ipc::ChannelId(syscall_get_arg2(kernel, cpu));
    let mut buf = [0u8; crate::config::CHANNEL_BUFFER_SIZE];
    match crate::ipc::recv_msg(
        &kernel.sched,
        &kernel.channels,
        &kernel.platform,
        cpu,
        ch,
        &mut buf,
    ) {
        Ok(RecvOutcome::Received(len)) => {
            let mut word = [0u8; 4];
            let n = len.min(4);
            word[..n].copy_from_slice(&buf[..n]);
            syscall_set_retval1(kernel, cpu, u32::from_le_bytes(word));
            syscall_set_errno(kernel, cpu, E_SUCC);
        }
        Ok(RecvOutcome::Blocked) => {}
        Err(e) => syscall_set_errno(kernel, cpu, KernelError::from(e).to_errno()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn world() -> Kernel {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.sched.init_cpu(0);
        kernel
    }

    fn set_args(kernel: &Kernel, cpu: usize, args: [u32; 6]) {
        let pid = cur(kernel, cpu);
        let mut pool = kernel.uctx.lock();
        let regs = &mut pool.get_mut(pid).regs;
        regs.eax = args[0];
        regs.ebx = args[1];
        regs.ecx = args[2];
        regs.edx = args[3];
        regs.esi = args[4];
        regs.edi = args[5];
    }

    #[test]
    fn argument_registers_follow_the_abi() {
        let kernel = world();
        set_args(&kernel, 0, [10, 20, 30, 40, 50, 60]);
        assert_eq!(syscall_get_arg1(&kernel, 0), 10);
        assert_eq!(syscall_get_arg2(&kernel, 0), 20);
        assert_eq!(syscall_get_arg3(&kernel, 0), 30);
        assert_eq!(syscall_get_arg4(&kernel, 0), 40);
        assert_eq!(syscall_get_arg5(&kernel, 0), 50);
        assert_eq!(syscall_get_arg6(&kernel, 0), 60);
    }

    #[test]
    fn return_registers_follow_the_abi() {
        let kernel = world();
        syscall_set_retval1(&kernel, 0, 1);
        syscall_set_retval2(&kernel, 0, 2);
        syscall_set_retval3(&kernel, 0, 3);
        syscall_set_retval4(&kernel, 0, 4);
        syscall_set_retval5(&kernel, 0, 5);
        syscall_set_errno(&kernel, 0, 9);
        let pool = kernel.uctx.lock();
        let frame = pool.get(Pid(0));
        assert_eq!(frame.regs.ebx, 1);
        assert_eq!(frame.regs.ecx, 2);
        assert_eq!(frame.regs.edx, 3);
        assert_eq!(frame.regs.esi, 4);
        assert_eq!(frame.regs.edi, 5);
        assert_eq!(frame.err, 9);
    }

    #[test]
    fn unknown_syscall_sets_bad_arg() {
        let kernel = world();
        set_args(&kernel, 0, [999, 0, 0, 0, 0, 0]);
        dispatch(&kernel, 0);
        assert_eq!(
            kernel.uctx.lock().get(Pid(0)).err,
            KernelError::BadArg.to_errno()
        );
    }

    #[test]
    fn fork_is_not_supported() {
        let kernel = world();
        set_args(&kernel, 0, [SYS_FORK, 0, 0, 0, 0, 0]);
        dispatch(&kernel, 0);
        assert_eq!(
            kernel.uctx.lock().get(Pid(0)).err,
            KernelError::NotSupported.to_errno()
        );
    }

    #[test]
    fn yield_syscall_succeeds() {
        let kernel = world();
        set_args(&kernel, 0, [SYS_YIELD, 0, 0, 0, 0, 0]);
        dispatch(&kernel, 0);
        assert_eq!(kernel.uctx.lock().get(Pid(0)).err, E_SUCC);
    }
}
