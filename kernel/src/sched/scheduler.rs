//! The per-CPU round-robin scheduler.
//!
//! All scheduler state (the TCB arena, the free pool and every per-CPU
//! queue) sits behind a single thread lock. Cross-CPU wakeups mutate the
//! remote CPU's queues under the same lock and then nudge the remote core
//! with a reschedule IPI.
//!
//! The lock is released before the outgoing kernel context is suspended;
//! the switch itself touches only the two context records whose pointers
//! were captured under the lock. A thread entered for the first time
//! starts in its entry function with no locks held.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

use super::context::{kctx_prime, KernelContext, KernelStack};
use super::tcb::{QueueId, TcbQueue, TcbTable};
use super::{BlockReason, KernelEntry, Pid, SchedError, ThreadState};
use crate::arch::Platform;
use crate::config::KernelConfig;
use crate::ipc::ChannelId;
use crate::sync::SpinLock;

/// Per-CPU scheduler block.
pub struct SchedCpu {
    /// The running thread of this CPU.
    pub cur: Option<Pid>,
    /// Milliseconds accounted since the last scheduling point.
    pub run_ticks: u64,
    pub ready: TcbQueue,
    pub blocked: TcbQueue,
    pub dead: TcbQueue,
    /// Last thread that entered user mode on this CPU (diagnostic).
    pub last_active: Option<Pid>,
}

impl SchedCpu {
    fn new(cpu: usize) -> Self {
        Self {
            cur: None,
            run_ticks: 0,
            ready: TcbQueue::new(QueueId::Ready(cpu)),
            blocked: TcbQueue::new(QueueId::Blocked(cpu)),
            dead: TcbQueue::new(QueueId::Dead(cpu)),
            last_active: None,
        }
    }
}

/// Everything the thread lock guards.
pub struct SchedInner {
    pub tcbs: TcbTable,
    free: TcbQueue,
    cpus: Vec<SchedCpu>,
    slice_ms: u64,
    tick_ms: u64,
}

/// A context switch decided under the lock and performed after it is
/// released.
struct SwitchPlan {
    from: Option<Pid>,
    to: Pid,
    from_kctx: *mut KernelContext,
    to_kctx: *const KernelContext,
}

/// A thread returned to the free pool by [`Scheduler::reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    /// Channel pairing the thread with its parent, to be freed by the
    /// caller along with the address space.
    pub parent_channel: Option<ChannelId>,
}

/// The scheduler: the thread lock plus the state it guards.
pub struct Scheduler {
    state: SpinLock<SchedInner>,
}

impl Scheduler {
    pub fn new(config: &KernelConfig) -> Self {
        let mut tcbs = TcbTable::new(crate::config::MAX_PID);
        let mut free = TcbQueue::new(QueueId::Free);
        for pid in 0..crate::config::MAX_PID {
            free.enqueue_tail(&mut tcbs, Pid(pid as u32));
        }
        let mut cpus = Vec::with_capacity(config.num_cpus);
        for cpu in 0..config.num_cpus {
            cpus.push(SchedCpu::new(cpu));
        }
        Self {
            state: SpinLock::new(
                "thread",
                SchedInner {
                    tcbs,
                    free,
                    cpus,
                    slice_ms: config.sched_slice_ms,
                    tick_ms: config.tick_ms(),
                },
            ),
        }
    }

    /// Install the bootstrap/idle thread of `cpu`. On CPU 0 this claims
    /// pid 0. The idle thread guarantees the ready queue invariant: a
    /// blocking thread always has a successor.
    pub fn init_cpu(&self, cpu: usize) -> Pid {
        let mut guard = self.state.lock();
        let inner = &mut *guard;
        let pid = inner
            .free
            .dequeue_head(&mut inner.tcbs)
            .expect("tcb pool exhausted during cpu bring-up");
        let tcb = inner.tcbs.get_mut(pid);
        tcb.state = ThreadState::Running;
        tcb.cpu = cpu;
        tcb.kstack = Some(KernelStack::alloc());
        inner.cpus[cpu].cur = Some(pid);
        inner.cpus[cpu].run_ticks = 0;
        pid
    }

    /// Spawn a thread on `cpu`: allocate a TCB and kernel stack, prime
    /// the kernel context to enter `entry`, and enqueue at the head of
    /// the ready queue in state `Inited`.
    pub fn spawn(
        &self,
        cpu: usize,
        entry: KernelEntry,
        parent: Pid,
        quota: u32,
    ) -> Result<Pid, SchedError> {
        let mut guard = self.state.lock();
        let inner = &mut *guard;
        let pid = inner
            .free
            .dequeue_head(&mut inner.tcbs)
            .ok_or(SchedError::NoFreePid)?;

        {
            let tcb = inner.tcbs.get_mut(pid);
            tcb.state = ThreadState::Inited;
            tcb.cpu = cpu;
            tcb.parent = Some(parent);
            tcb.quota = quota;
            tcb.block_reason = None;
            tcb.block_channel = None;
            let mut stack = KernelStack::alloc();
            kctx_prime(&mut tcb.kctx, &mut stack, entry);
            tcb.kstack = Some(stack);
        }
        inner.tcbs.get_mut(parent).children.push(pid);
        inner.cpus[cpu].ready.enqueue_head(&mut inner.tcbs, pid);

        log::debug!("[sched] spawned thread {} on cpu {}", pid, cpu);
        Ok(pid)
    }

    /// Undo a spawn whose process construction failed: the thread must
    /// still be `Inited` and is returned to the free pool.
    pub fn cancel_spawn(&self, pid: Pid) {
        let mut guard = self.state.lock();
        let inner = &mut *guard;
        let cpu = {
            let tcb = inner.tcbs.get(pid);
            assert_eq!(
                tcb.state,
                ThreadState::Inited,
                "cancel_spawn: thread {} already scheduled",
                pid
            );
            tcb.cpu
        };
        inner.cpus[cpu].ready.remove(&mut inner.tcbs, pid);
        let parent = inner.tcbs.get(pid).parent;
        if let Some(parent) = parent {
            let children = &mut inner.tcbs.get_mut(parent).children;
            if let Some(at) = children.iter().position(|&c| c == pid) {
                children.swap_remove(at);
            }
        }
        {
            let tcb = inner.tcbs.get_mut(pid);
            tcb.state = ThreadState::Free;
            tcb.parent = None;
            tcb.parent_channel = None;
            tcb.kstack = None;
            tcb.kctx = KernelContext::zeroed();
        }
        inner.free.enqueue_tail(&mut inner.tcbs, pid);
    }

    /// Yield the CPU: current thread to the ready-queue tail, head of the
    /// ready queue becomes current. No-op when nothing else is runnable.
    pub fn yield_cpu(&self, plat: &Platform, cpu: usize) {
        let plan = {
            let mut guard = self.state.lock();
            let inner = &mut *guard;
            if inner.cpus[cpu].ready.is_empty() {
                return;
            }
            let cur = inner.cpus[cpu].cur.expect("yield with no current thread");
            inner.tcbs.get_mut(cur).state = ThreadState::Ready;
            inner.cpus[cpu].ready.enqueue_tail(&mut inner.tcbs, cur);
            inner.sched_locked(cpu, true)
        };
        self.finish_switch(plat, plan);
    }

    /// Block the current thread of `cpu` on `channel` and hand the CPU to
    /// the next ready thread.
    ///
    /// Panics when the ready queue is empty: the per-CPU idle thread is a
    /// configuration invariant.
    pub fn block(&self, plat: &Platform, cpu: usize, reason: BlockReason, channel: ChannelId) {
        let plan = {
            let mut guard = self.state.lock();
            let inner = &mut *guard;
            let cur = inner.cpus[cpu].cur.expect("block with no current thread");
            {
                let tcb = inner.tcbs.get_mut(cur);
                assert_eq!(
                    tcb.state,
                    ThreadState::Running,
                    "block: thread {} is not running",
                    cur
                );
                tcb.state = ThreadState::Blocked;
                tcb.block_reason = Some(reason);
                tcb.block_channel = Some(channel);
            }
            inner.cpus[cpu].blocked.enqueue_tail(&mut inner.tcbs, cur);
            log::debug!("[sched] thread {} blocked on channel {:?}", cur, channel);
            inner.sched_locked(cpu, true)
        };
        self.finish_switch(plat, plan);
    }

    /// Unblock `pid`, moving it to the head of its CPU's ready queue.
    /// `cpu` names the caller's CPU; a wakeup of a thread pinned
    /// elsewhere sends that CPU a reschedule IPI.
    pub fn unblock(&self, plat: &Platform, cpu: usize, pid: Pid) {
        let mut guard = self.state.lock();
        let inner = &mut *guard;
        assert_eq!(
            inner.tcbs.get(pid).state,
            ThreadState::Blocked,
            "unblock: thread {} is not blocked",
            pid
        );
        let target_cpu = inner.unblock_locked(pid);
        if target_cpu != cpu {
            plat.send_reschedule_ipi(target_cpu);
        }
    }

    /// Wake `pid` only if it is blocked for `reason` on `channel`.
    /// The check and the wakeup are one atomic step under the thread
    /// lock, so a state change is answered by exactly one wakeup.
    /// Returns whether the thread was woken.
    pub fn unblock_if_waiting(
        &self,
        plat: &Platform,
        cpu: usize,
        pid: Pid,
        reason: BlockReason,
        channel: ChannelId,
    ) -> bool {
        let mut guard = self.state.lock();
        let inner = &mut *guard;
        {
            let tcb = inner.tcbs.get(pid);
            if tcb.state != ThreadState::Blocked
                || tcb.block_reason != Some(reason)
                || tcb.block_channel != Some(channel)
            {
                return false;
            }
        }
        let target_cpu = inner.unblock_locked(pid);
        if target_cpu != cpu {
            plat.send_reschedule_ipi(target_cpu);
        }
        true
    }

    /// The scheduling decision procedure; `need_sched` forces a
    /// round-robin rotation even when the quantum has not expired.
    pub fn sched(&self, plat: &Platform, cpu: usize, need_sched: bool) {
        let plan = {
            let mut guard = self.state.lock();
            guard.sched_locked(cpu, need_sched)
        };
        self.finish_switch(plat, plan);
    }

    /// LAPIC timer tick: account one tick against the running thread and
    /// preempt once the quantum is used up.
    pub fn tick(&self, plat: &Platform, cpu: usize) {
        let expired = {
            let mut guard = self.state.lock();
            let inner = &mut *guard;
            let c = &mut inner.cpus[cpu];
            c.run_ticks += inner.tick_ms;
            c.run_ticks >= inner.slice_ms
        };
        if expired {
            self.yield_cpu(plat, cpu);
        }
    }

    /// Terminate the current thread of `cpu`; it parks on the dead queue
    /// until reaped.
    pub fn exit_cur(&self, plat: &Platform, cpu: usize) {
        let plan = {
            let mut guard = self.state.lock();
            let inner = &mut *guard;
            let cur = inner.cpus[cpu].cur.expect("exit with no current thread");
            inner.tcbs.get_mut(cur).state = ThreadState::Dead;
            inner.cpus[cpu].dead.enqueue_tail(&mut inner.tcbs, cur);
            inner.sched_locked(cpu, false)
        };
        self.finish_switch(plat, plan);
    }

    /// Reclaim one dead thread of `cpu`, returning its TCB to the free
    /// pool. The caller destroys the address space and frees the parent
    /// channel.
    pub fn reap(&self, cpu: usize) -> Option<Reaped> {
        let mut guard = self.state.lock();
        let inner = &mut *guard;
        let pid = inner.cpus[cpu].dead.dequeue_head(&mut inner.tcbs)?;
        let parent = inner.tcbs.get(pid).parent;
        if let Some(parent) = parent {
            let children = &mut inner.tcbs.get_mut(parent).children;
            if let Some(at) = children.iter().position(|&c| c == pid) {
                children.swap_remove(at);
            }
        }
        let parent_channel = {
            let tcb = inner.tcbs.get_mut(pid);
            let ch = tcb.parent_channel.take();
            tcb.state = ThreadState::Free;
            tcb.parent = None;
            tcb.children.clear();
            tcb.block_reason = None;
            tcb.block_channel = None;
            tcb.vm = None;
            tcb.kstack = None;
            tcb.kctx = KernelContext::zeroed();
            ch
        };
        inner.free.enqueue_tail(&mut inner.tcbs, pid);
        Some(Reaped {
            pid,
            parent_channel,
        })
    }

    /// Current thread of `cpu`.
    pub fn cur_pid(&self, cpu: usize) -> Option<Pid> {
        self.state.lock().cpus[cpu].cur
    }

    /// Milliseconds accounted since the last scheduling point on `cpu`.
    pub fn run_ticks(&self, cpu: usize) -> u64 {
        self.state.lock().cpus[cpu].run_ticks
    }

    pub fn thread_state(&self, pid: Pid) -> ThreadState {
        self.state.lock().tcbs.get(pid).state
    }

    pub fn block_info(&self, pid: Pid) -> (Option<BlockReason>, Option<ChannelId>) {
        let inner = self.state.lock();
        let tcb = inner.tcbs.get(pid);
        (tcb.block_reason, tcb.block_channel)
    }

    /// Snapshot of the ready queue of `cpu`, front to back.
    pub fn ready_pids(&self, cpu: usize) -> Vec<Pid> {
        let inner = self.state.lock();
        inner.cpus[cpu].ready.iter_pids(&inner.tcbs)
    }

    /// Record that `pid` entered user mode on `cpu` (diagnostic).
    pub fn note_user_entry(&self, cpu: usize, pid: Pid) {
        self.state.lock().cpus[cpu].last_active = Some(pid);
    }

    pub fn last_active(&self, cpu: usize) -> Option<Pid> {
        self.state.lock().cpus[cpu].last_active
    }

    /// Run `f` against the locked scheduler state. Used by the process
    /// layer for spawn bookkeeping and by tests for invariant checks.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut SchedInner) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Verify that queue membership matches thread state everywhere.
    /// Panics on any violation; a violation is a state-machine bug.
    pub fn check_invariants(&self) {
        let inner = self.state.lock();
        for raw in 0..inner.tcbs.capacity() {
            let pid = Pid(raw as u32);
            let tcb = inner.tcbs.get(pid);
            let expected = match tcb.state {
                ThreadState::Free => Some(QueueId::Free),
                ThreadState::Inited | ThreadState::Ready => Some(QueueId::Ready(tcb.cpu)),
                ThreadState::Blocked => Some(QueueId::Blocked(tcb.cpu)),
                ThreadState::Dead => Some(QueueId::Dead(tcb.cpu)),
                ThreadState::Running => None,
            };
            assert_eq!(
                tcb.queue(),
                expected,
                "thread {} in state {:?} on queue {:?}",
                pid,
                tcb.state,
                tcb.queue()
            );
            if tcb.state == ThreadState::Running {
                assert_eq!(inner.cpus[tcb.cpu].cur, Some(pid));
            }
            if tcb.state == ThreadState::Blocked {
                assert!(tcb.block_reason.is_some());
            }
        }
    }

    fn finish_switch(&self, plat: &Platform, plan: Option<SwitchPlan>) {
        if let Some(plan) = plan {
            // SAFETY: The pointers were captured under the thread lock and
            // point into the TCB arena, which is never moved or freed for
            // the lifetime of the scheduler. The incoming thread's state
            // was published before the lock was released.
            unsafe {
                plat.context_switch(plan.from, plan.to, plan.from_kctx, plan.to_kctx);
            }
        }
    }
}

impl SchedInner {
    /// Move a blocked thread to the head of its CPU's ready queue.
    /// Returns the CPU the thread is pinned to.
    fn unblock_locked(&mut self, pid: Pid) -> usize {
        let target_cpu = self.tcbs.get(pid).cpu;
        self.cpus[target_cpu].blocked.remove(&mut self.tcbs, pid);
        {
            let tcb = self.tcbs.get_mut(pid);
            tcb.state = ThreadState::Ready;
            tcb.block_reason = None;
            tcb.block_channel = None;
        }
        self.cpus[target_cpu]
            .ready
            .enqueue_head(&mut self.tcbs, pid);
        log::debug!("[sched] thread {} unblocked on cpu {}", pid, target_cpu);
        target_cpu
    }

    /// The decision procedure, under the lock. Returns the switch to
    /// perform once the lock has been released.
    fn sched_locked(&mut self, cpu: usize, need_sched: bool) -> Option<SwitchPlan> {
        let cur = self.cpus[cpu].cur;
        let cur_state = cur.map(|pid| self.tcbs.get(pid).state);

        if (cur.is_none() || cur_state == Some(ThreadState::Ready))
            && self.cpus[cpu].ready.is_empty()
        {
            panic!("no schedulable process on cpu {}", cpu);
        }

        let mut select_new = false;
        if cur.is_some() && cur_state != Some(ThreadState::Running) {
            // The current thread was already moved to the ready or
            // blocked queue by the caller; a new one must be selected.
            select_new = true;
        } else if let Some(cur) = cur {
            if (need_sched || self.cpus[cpu].run_ticks > self.slice_ms)
                && !self.cpus[cpu].ready.is_empty()
            {
                self.tcbs.get_mut(cur).state = ThreadState::Ready;
                self.cpus[cpu].ready.enqueue_tail(&mut self.tcbs, cur);
                select_new = true;
            }
        }

        if cur.is_none() || select_new {
            let new = self.cpus[cpu]
                .ready
                .dequeue_head(&mut self.tcbs)
                .unwrap_or_else(|| panic!("no schedulable process on cpu {}", cpu));
            self.tcbs.get_mut(new).state = ThreadState::Running;
            self.cpus[cpu].cur = Some(new);
            self.cpus[cpu].run_ticks = 0;

            if cur != Some(new) {
                let from_kctx = match cur {
                    Some(old) => &mut self.tcbs.get_mut(old).kctx as *mut KernelContext,
                    None => core::ptr::null_mut(),
                };
                let to_kctx = &self.tcbs.get(new).kctx as *const KernelContext;
                return Some(SwitchPlan {
                    from: cur,
                    to: new,
                    from_kctx,
                    to_kctx,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchEvent;

    extern "C" fn idle_entry() -> ! {
        unreachable!("test entry is never executed")
    }

    fn setup(num_cpus: usize) -> (Scheduler, Platform) {
        let config = KernelConfig {
            num_cpus,
            ..KernelConfig::default()
        };
        let sched = Scheduler::new(&config);
        for cpu in 0..num_cpus {
            sched.init_cpu(cpu);
        }
        (sched, Platform::new())
    }

    #[test]
    fn bootstrap_claims_pid_zero() {
        let (sched, _) = setup(2);
        assert_eq!(sched.cur_pid(0), Some(Pid(0)));
        assert_eq!(sched.cur_pid(1), Some(Pid(1)));
        assert_eq!(sched.thread_state(Pid(0)), ThreadState::Running);
        sched.check_invariants();
    }

    #[test]
    fn spawn_enqueues_inited_at_head() {
        let (sched, _) = setup(1);
        let pid = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();
        assert_eq!(pid, Pid(1));
        assert_eq!(sched.thread_state(pid), ThreadState::Inited);
        assert_eq!(sched.ready_pids(0), [pid]);
        assert_eq!(sched.cur_pid(0), Some(Pid(0)));
        sched.check_invariants();
    }

    #[test]
    fn yield_rotates_round_robin() {
        let (sched, plat) = setup(1);
        let child = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();

        sched.yield_cpu(&plat, 0);
        assert_eq!(sched.cur_pid(0), Some(child));
        assert_eq!(sched.thread_state(Pid(0)), ThreadState::Ready);
        assert_eq!(sched.run_ticks(0), 0);
        assert_eq!(
            plat.take_events(),
            [ArchEvent::ContextSwitch {
                from: Some(Pid(0)),
                to: child
            }]
        );

        sched.yield_cpu(&plat, 0);
        assert_eq!(sched.cur_pid(0), Some(Pid(0)));
        sched.check_invariants();
    }

    #[test]
    fn yield_alone_is_a_noop() {
        let (sched, plat) = setup(1);
        sched.yield_cpu(&plat, 0);
        assert_eq!(sched.cur_pid(0), Some(Pid(0)));
        assert!(plat.take_events().is_empty());
    }

    #[test]
    fn quantum_expiry_preempts() {
        let (sched, plat) = setup(1);
        let child = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();

        // SCHED_SLICE = 100 ms at 100 Hz: ten ticks per quantum.
        for _ in 0..9 {
            sched.tick(&plat, 0);
            assert_eq!(sched.cur_pid(0), Some(Pid(0)));
        }
        sched.tick(&plat, 0);
        assert_eq!(sched.cur_pid(0), Some(child));

        for _ in 0..10 {
            sched.tick(&plat, 0);
        }
        assert_eq!(sched.cur_pid(0), Some(Pid(0)));
        sched.check_invariants();
    }

    #[test]
    fn block_hands_off_and_unblock_front_runs() {
        let (sched, plat) = setup(1);
        let a = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();
        let b = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();
        sched.yield_cpu(&plat, 0); // b (head) becomes current

        assert_eq!(sched.cur_pid(0), Some(b));
        sched.block(&plat, 0, BlockReason::WaitingForReceiving, ChannelId(3));
        assert_eq!(sched.thread_state(b), ThreadState::Blocked);
        assert_eq!(
            sched.block_info(b),
            (
                Some(BlockReason::WaitingForReceiving),
                Some(ChannelId(3))
            )
        );
        assert_eq!(sched.cur_pid(0), Some(a));

        sched.unblock(&plat, 0, b);
        assert_eq!(sched.thread_state(b), ThreadState::Ready);
        // Woken threads jump the queue.
        assert_eq!(sched.ready_pids(0)[0], b);
        sched.check_invariants();
    }

    #[test]
    fn cross_cpu_unblock_sends_ipi() {
        let (sched, plat) = setup(2);
        let t = sched.spawn(1, idle_entry, Pid(1), 64).unwrap();
        sched.yield_cpu(&plat, 1);
        assert_eq!(sched.cur_pid(1), Some(t));
        sched.block(&plat, 1, BlockReason::WaitingForSending, ChannelId(0));
        plat.take_events();

        sched.unblock(&plat, 0, t);
        assert!(plat
            .take_events()
            .contains(&ArchEvent::RescheduleIpi(1)));
        sched.check_invariants();
    }

    #[test]
    #[should_panic(expected = "no schedulable process")]
    fn blocking_the_last_thread_panics() {
        let (sched, plat) = setup(1);
        sched.block(&plat, 0, BlockReason::WaitingForSending, ChannelId(0));
    }

    #[test]
    fn exit_and_reap_recycle_the_pid() {
        let (sched, plat) = setup(1);
        let child = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();
        sched.yield_cpu(&plat, 0);
        assert_eq!(sched.cur_pid(0), Some(child));

        sched.exit_cur(&plat, 0);
        assert_eq!(sched.thread_state(child), ThreadState::Dead);
        assert_eq!(sched.cur_pid(0), Some(Pid(0)));

        let reaped = sched.reap(0).unwrap();
        assert_eq!(reaped.pid, child);
        assert_eq!(sched.thread_state(child), ThreadState::Free);
        assert_eq!(sched.reap(0), None);

        // The pid is reusable.
        let again = sched.spawn(0, idle_entry, Pid(0), 64).unwrap();
        assert_eq!(sched.thread_state(again), ThreadState::Inited);
        sched.check_invariants();
    }

    #[test]
    fn pool_exhaustion_reports_no_free_pid() {
        let (sched, _) = setup(1);
        let mut spawned = 0;
        loop {
            match sched.spawn(0, idle_entry, Pid(0), 1) {
                Ok(_) => spawned += 1,
                Err(SchedError::NoFreePid) => break,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(spawned, crate::config::MAX_PID - 1);
    }
}
