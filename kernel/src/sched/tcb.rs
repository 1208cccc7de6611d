//! Thread control blocks and the embedded queue discipline.
//!
//! TCBs live in a fixed arena indexed by [`Pid`]; the ready, blocked,
//! dead and free queues are doubly linked lists whose nodes are embedded
//! in the TCBs themselves, so every queue operation is O(1) and a TCB
//! can be on at most one queue at any moment. Membership is checked on
//! every transition; a violation is a state-machine bug and panics.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use super::context::{KernelContext, KernelStack};
use super::{BlockReason, Pid, ThreadState};
use crate::ipc::ChannelId;

/// Identity of a TCB queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    /// The free pool.
    Free,
    /// Per-CPU ready queue.
    Ready(usize),
    /// Per-CPU blocked queue.
    Blocked(usize),
    /// Per-CPU dead queue.
    Dead(usize),
}

/// Embedded queue node.
#[derive(Debug, Clone, Copy, Default)]
struct QueueLink {
    prev: Option<Pid>,
    next: Option<Pid>,
    queue: Option<QueueId>,
}

/// One thread control block.
pub struct Tcb {
    pub state: ThreadState,
    /// CPU the thread is pinned to; threads never migrate.
    pub cpu: usize,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub quota: u32,
    pub block_reason: Option<BlockReason>,
    pub block_channel: Option<ChannelId>,
    /// Channel pairing this thread with its parent, allocated at spawn.
    pub parent_channel: Option<ChannelId>,
    /// vCPU handle when this thread hosts a guest.
    pub vm: Option<u32>,
    pub kctx: KernelContext,
    pub kstack: Option<Box<KernelStack>>,
    link: QueueLink,
}

impl Tcb {
    fn unused() -> Self {
        Self {
            state: ThreadState::Free,
            cpu: 0,
            parent: None,
            children: Vec::new(),
            quota: 0,
            block_reason: None,
            block_channel: None,
            parent_channel: None,
            vm: None,
            kctx: KernelContext::zeroed(),
            kstack: None,
            link: QueueLink::default(),
        }
    }

    /// Queue this TCB is currently on, if any.
    pub fn queue(&self) -> Option<QueueId> {
        self.link.queue
    }
}

/// The fixed TCB arena.
pub struct TcbTable {
    tcbs: Vec<Tcb>,
}

impl TcbTable {
    pub fn new(capacity: usize) -> Self {
        let mut tcbs = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            tcbs.push(Tcb::unused());
        }
        Self { tcbs }
    }

    pub fn capacity(&self) -> usize {
        self.tcbs.len()
    }

    pub fn get(&self, pid: Pid) -> &Tcb {
        &self.tcbs[pid.as_usize()]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Tcb {
        &mut self.tcbs[pid.as_usize()]
    }
}

/// A doubly linked TCB queue with embedded storage.
pub struct TcbQueue {
    id: QueueId,
    head: Option<Pid>,
    tail: Option<Pid>,
    len: usize,
}

impl TcbQueue {
    pub const fn new(id: QueueId) -> Self {
        Self {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<Pid> {
        self.head
    }

    /// Insert at the head.
    pub fn enqueue_head(&mut self, table: &mut TcbTable, pid: Pid) {
        self.attach(table, pid);
        let tcb = table.get_mut(pid);
        tcb.link.prev = None;
        tcb.link.next = self.head;
        match self.head {
            Some(old) => table.get_mut(old).link.prev = Some(pid),
            None => self.tail = Some(pid),
        }
        self.head = Some(pid);
        self.len += 1;
    }

    /// Insert at the tail.
    pub fn enqueue_tail(&mut self, table: &mut TcbTable, pid: Pid) {
        self.attach(table, pid);
        let tcb = table.get_mut(pid);
        tcb.link.next = None;
        tcb.link.prev = self.tail;
        match self.tail {
            Some(old) => table.get_mut(old).link.next = Some(pid),
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.len += 1;
    }

    /// Pop the head, or `None` when empty.
    pub fn dequeue_head(&mut self, table: &mut TcbTable) -> Option<Pid> {
        let pid = self.head?;
        self.unlink(table, pid);
        Some(pid)
    }

    /// Remove `pid` from the middle of the queue.
    pub fn remove(&mut self, table: &mut TcbTable, pid: Pid) {
        assert_eq!(
            table.get(pid).link.queue,
            Some(self.id),
            "tcb {} not on expected queue",
            pid
        );
        self.unlink(table, pid);
    }

    fn attach(&mut self, table: &mut TcbTable, pid: Pid) {
        let tcb = table.get_mut(pid);
        assert!(
            tcb.link.queue.is_none(),
            "tcb {} already on a queue",
            pid
        );
        tcb.link.queue = Some(self.id);
    }

    fn unlink(&mut self, table: &mut TcbTable, pid: Pid) {
        let (prev, next) = {
            let link = &mut table.get_mut(pid).link;
            debug_assert_eq!(link.queue, Some(self.id));
            let pair = (link.prev, link.next);
            *link = QueueLink::default();
            pair
        };
        match prev {
            Some(p) => table.get_mut(p).link.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => table.get_mut(n).link.prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Snapshot of the queue front to back.
    pub fn iter_pids(&self, table: &TcbTable) -> Vec<Pid> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(pid) = cur {
            out.push(pid);
            cur = table.get(pid).link.next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TcbTable, TcbQueue) {
        (TcbTable::new(8), TcbQueue::new(QueueId::Ready(0)))
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (mut t, mut q) = setup();
        q.enqueue_tail(&mut t, Pid(1));
        q.enqueue_tail(&mut t, Pid(2));
        q.enqueue_tail(&mut t, Pid(3));
        assert_eq!(q.iter_pids(&t), [Pid(1), Pid(2), Pid(3)]);
        assert_eq!(q.dequeue_head(&mut t), Some(Pid(1)));
        assert_eq!(q.dequeue_head(&mut t), Some(Pid(2)));
        assert_eq!(q.dequeue_head(&mut t), Some(Pid(3)));
        assert_eq!(q.dequeue_head(&mut t), None);
    }

    #[test]
    fn head_insertion_jumps_the_queue() {
        let (mut t, mut q) = setup();
        q.enqueue_tail(&mut t, Pid(1));
        q.enqueue_head(&mut t, Pid(2));
        assert_eq!(q.front(), Some(Pid(2)));
        assert_eq!(q.iter_pids(&t), [Pid(2), Pid(1)]);
    }

    #[test]
    fn remove_from_middle_relinks() {
        let (mut t, mut q) = setup();
        for p in 1..=4 {
            q.enqueue_tail(&mut t, Pid(p));
        }
        q.remove(&mut t, Pid(2));
        assert_eq!(q.iter_pids(&t), [Pid(1), Pid(3), Pid(4)]);
        assert_eq!(q.len(), 3);
        assert_eq!(t.get(Pid(2)).queue(), None);
    }

    #[test]
    #[should_panic(expected = "already on a queue")]
    fn double_enqueue_panics() {
        let (mut t, mut q) = setup();
        q.enqueue_tail(&mut t, Pid(1));
        q.enqueue_tail(&mut t, Pid(1));
    }
}
