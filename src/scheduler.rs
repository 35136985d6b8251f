//! # Scheduler
//!
//! Preemptive fixed-priority scheduler with round robin among equals.
//!
//! ## Ready Queue
//!
//! One FIFO list per priority plus a 32-bit ready bitmap. Bit `p` is set
//! exactly when list `p` is non-empty, so the most urgent ready priority is
//! the lowest set bit, found in constant time.
//!
//! ```text
//!  ready_group  0b...0000_0000_0001_0010
//!                                 │  └── prio 1: [A] ─ [B]
//!                                 └───── prio 4: [C]
//! ```
//!
//! The running thread is *not* in the ready queue. `schedule()` puts it back
//! at the tail of its list only when it is switched out while still Running.
//!
//! ## Decision
//!
//! The current thread keeps the CPU when it is strictly more urgent than the
//! best ready thread, or equally urgent without a pending yield. Otherwise
//! the best ready thread is dequeued and the port is asked for a switch:
//! directly from thread context, deferred from interrupt context.

use crate::arch::Port;
use crate::config::PRIO_MAX;
use crate::kernel::Kernel;
use crate::list::{Link, LinkStore, ListHead, NodeId};
use crate::object::{KernelObject, Slab};
use crate::sync;
use crate::thread::{Queue, Thread, ThreadId, ThreadState};

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// Per-priority FIFO lists and the ready bitmap.
#[derive(Debug)]
pub struct ReadyQueue {
    table: [ListHead; PRIO_MAX],
    ready_group: u32,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            table: [ListHead::new(); PRIO_MAX],
            ready_group: 0,
        }
    }

    /// Most urgent priority with a ready thread.
    #[inline]
    pub fn highest_priority(&self) -> Option<u8> {
        if self.ready_group == 0 {
            None
        } else {
            Some(self.ready_group.trailing_zeros() as u8)
        }
    }

    #[inline]
    pub fn bitmap(&self) -> u32 {
        self.ready_group
    }

    #[inline]
    pub fn list(&self, priority: u8) -> &ListHead {
        &self.table[priority as usize]
    }

    /// Append `node` to the tail of its priority list.
    pub fn push<S: LinkStore + ?Sized>(&mut self, store: &mut S, priority: u8, node: NodeId) {
        self.table[priority as usize].push_back(store, node);
        self.ready_group |= 1 << priority;
    }

    /// Unlink `node`, clearing the bitmap bit if its list became empty.
    pub fn remove<S: LinkStore + ?Sized>(&mut self, store: &mut S, priority: u8, node: NodeId) -> bool {
        let list = &mut self.table[priority as usize];
        let removed = list.remove(store, node);
        if list.is_empty() {
            self.ready_group &= !(1 << priority);
        }
        removed
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The thread table links threads through their `tlist` node.
impl<P: Port, const N: usize> LinkStore for Slab<Thread<P>, N> {
    fn link(&self, node: NodeId) -> &Link {
        &self.at(node).tlist
    }

    fn link_mut(&mut self, node: NodeId) -> &mut Link {
        &mut self.at_mut(node).tlist
    }
}

// ---------------------------------------------------------------------------
// Scheduling operations
// ---------------------------------------------------------------------------

impl<P: Port> Kernel<P> {
    /// Handle of the running thread, `None` before the scheduler started.
    #[inline]
    pub fn thread_self(&self) -> Option<ThreadId> {
        self.current
    }

    /// Make `tid` ready.
    ///
    /// The current thread is never queued; it is only marked Running.
    pub(crate) fn schedule_insert_thread(&mut self, tid: ThreadId) {
        assert!(self.threads.contains(tid.0), "stale thread handle {:?}", tid);
        sync::masked(|| {
            if self.current == Some(tid) {
                self.threads.get_mut(tid.0).state = ThreadState::Running;
                return;
            }
            let thread = self.threads.get_mut(tid.0);
            thread.state = ThreadState::Ready;
            thread.queue = Queue::Ready;
            let priority = thread.current_priority;
            self.ready.push(&mut self.threads, priority, tid.0.index());
            log::trace!(
                "insert thread[{}], the priority: {}",
                self.threads.get(tid.0).name(),
                priority
            );
        });
    }

    /// Take `tid` out of the ready queue. No-op if it is not queued.
    pub(crate) fn schedule_remove_thread(&mut self, tid: ThreadId) {
        assert!(self.threads.contains(tid.0), "stale thread handle {:?}", tid);
        sync::masked(|| {
            let thread = self.threads.get_mut(tid.0);
            if thread.queue != Queue::Ready {
                return;
            }
            thread.queue = Queue::None;
            let priority = thread.current_priority;
            self.ready.remove(&mut self.threads, priority, tid.0.index());
            log::trace!(
                "remove thread[{}], the priority: {}",
                self.threads.get(tid.0).name(),
                priority
            );
        });
    }

    /// Pick the most urgent ready thread and switch to it if needed.
    ///
    /// Does nothing while the scheduler is locked, before the scheduler
    /// started, or when no thread is ready.
    pub fn schedule(&mut self) {
        let level = sync::interrupt_disable();
        let switch = self.pick_next();
        if let Some((from, to)) = switch {
            let from_sp = &mut self.threads.get_mut(from.0).sp as *mut usize;
            let to_sp = &self.threads.get(to.0).sp as *const usize;
            if self.interrupt_nest == 0 {
                // SAFETY: both cells live in the thread table, which does not
                // move while the kernel is installed.
                unsafe { self.port.context_switch(from_sp, to_sp) };
            } else {
                log::trace!("switch in interrupt");
                unsafe { self.port.context_switch_interrupt(from_sp, to_sp) };
            }
        }
        sync::interrupt_enable(level);
    }

    /// Scheduling decision. Returns the `(from, to)` pair to switch, after
    /// updating queue and thread state.
    fn pick_next(&mut self) -> Option<(ThreadId, ThreadId)> {
        if self.lock_nest > 0 {
            return None;
        }
        let current = self.current?;
        let highest = self.ready.highest_priority()?;
        let head = self.ready.list(highest).front()?;
        let mut to = self.threads.handle_at(head).map(ThreadId)?;

        let mut insert_from = false;
        let cur = self.threads.get_mut(current.0);
        if cur.state == ThreadState::Running {
            if cur.current_priority < highest
                || (cur.current_priority == highest && !cur.yield_pending)
            {
                to = current;
            } else {
                insert_from = true;
            }
            cur.yield_pending = false;
        }

        if to == current {
            // Keep running; make sure the current thread is not queued.
            self.schedule_remove_thread(current);
            self.threads.get_mut(current.0).state = ThreadState::Running;
            return None;
        }

        self.current = Some(to);
        if insert_from {
            self.schedule_insert_thread(current);
        }
        self.schedule_remove_thread(to);
        self.threads.get_mut(to.0).state = ThreadState::Running;

        log::trace!(
            "[{}]switch to priority#{} thread:{}, from thread:{}",
            self.interrupt_nest,
            highest,
            self.threads.get(to.0).name(),
            self.threads.get(current.0).name()
        );
        Some((current, to))
    }

    /// Start scheduling: run the most urgent ready thread.
    ///
    /// On hardware the switch happens once the caller unmasks interrupts
    /// and `main` is never resumed.
    pub fn scheduler_start(&mut self) {
        assert!(self.current.is_none(), "scheduler already started");
        let highest = match self.ready.highest_priority() {
            Some(p) => p,
            None => panic!("no thread to schedule"),
        };
        let to = match self.ready.list(highest).front().and_then(|n| self.threads.handle_at(n)) {
            Some(h) => ThreadId(h),
            None => panic!("ready bitmap out of sync with the ready lists"),
        };

        sync::masked(|| {
            self.current = Some(to);
            self.schedule_remove_thread(to);
            self.threads.get_mut(to.0).state = ThreadState::Running;
            log::debug!("scheduler start: thread {}", self.threads.get(to.0).name());
            let to_sp = &self.threads.get(to.0).sp as *const usize;
            // SAFETY: the cell lives in the thread table.
            unsafe { self.port.context_switch_to(to_sp) };
        });
    }

    // -----------------------------------------------------------------------
    // Scheduler lock
    // -----------------------------------------------------------------------

    /// Lock the scheduler. Nests; interrupts still run.
    pub fn enter_critical(&mut self) {
        sync::masked(|| self.lock_nest += 1);
    }

    /// Unlock the scheduler. The outermost unlock reschedules.
    pub fn exit_critical(&mut self) {
        assert!(self.lock_nest > 0, "exit_critical without enter_critical");
        let reschedule = sync::masked(|| {
            self.lock_nest -= 1;
            self.lock_nest == 0
        });
        if reschedule && self.current.is_some() {
            self.schedule();
        }
    }

    /// Current scheduler lock nesting depth.
    #[inline]
    pub fn critical_level(&self) -> u16 {
        self.lock_nest
    }

    pub fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{kernel, noop_entry, stack};
    use std::vec::Vec;

    fn spawn(k: &mut Kernel<crate::arch::sim::SimPort>, name: &str, prio: u8) -> ThreadId {
        let tid = k.thread_init(name, noop_entry, 0, stack(512), prio, 10).unwrap();
        k.thread_startup(tid);
        tid
    }

    fn ready_order(k: &Kernel<crate::arch::sim::SimPort>, prio: u8) -> Vec<ThreadId> {
        k.ready
            .list(prio)
            .iter(&k.threads)
            .map(|n| ThreadId(k.threads.handle_at(n).unwrap()))
            .collect()
    }

    fn assert_bitmap_consistent(k: &Kernel<crate::arch::sim::SimPort>) {
        for p in 0..PRIO_MAX as u8 {
            let set = k.ready.bitmap() & (1 << p) != 0;
            assert_eq!(set, !k.ready.list(p).is_empty(), "bitmap bit {} out of sync", p);
        }
    }

    #[test]
    fn test_ready_queue_highest_priority() {
        let mut rq = ReadyQueue::new();
        assert_eq!(rq.highest_priority(), None);
        struct Nodes([Link; 4]);
        impl LinkStore for Nodes {
            fn link(&self, n: NodeId) -> &Link {
                &self.0[n as usize]
            }
            fn link_mut(&mut self, n: NodeId) -> &mut Link {
                &mut self.0[n as usize]
            }
        }
        let mut nodes = Nodes([Link::new(); 4]);
        rq.push(&mut nodes, 9, 0);
        rq.push(&mut nodes, 3, 1);
        rq.push(&mut nodes, 3, 2);
        assert_eq!(rq.highest_priority(), Some(3));
        rq.remove(&mut nodes, 3, 1);
        assert_eq!(rq.highest_priority(), Some(3));
        rq.remove(&mut nodes, 3, 2);
        assert_eq!(rq.highest_priority(), Some(9));
        assert_eq!(rq.bitmap(), 1 << 9);
    }

    #[test]
    fn test_start_runs_most_urgent_thread() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 10);
        let b = spawn(&mut k, "b", 5);
        k.scheduler_start();
        assert_eq!(k.thread_self(), Some(b));
        assert_eq!(k.thread_get(b).state, ThreadState::Running);
        assert_eq!(k.thread_get(a).state, ThreadState::Ready);
        assert!(k.port().started.is_some());
        assert_bitmap_consistent(&k);
    }

    #[test]
    fn test_more_urgent_thread_preempts() {
        let mut k = kernel();
        let low = spawn(&mut k, "low", 10);
        k.scheduler_start();
        assert_eq!(k.thread_self(), Some(low));

        let high = spawn(&mut k, "high", 2);
        assert_eq!(k.thread_self(), Some(high));
        assert_eq!(k.thread_get(low).state, ThreadState::Ready);
        assert_eq!(ready_order(&k, 10), [low]);
        assert_eq!(k.port().switches, 1);
    }

    #[test]
    fn test_less_urgent_thread_does_not_preempt() {
        let mut k = kernel();
        let high = spawn(&mut k, "high", 2);
        k.scheduler_start();
        spawn(&mut k, "low", 10);
        assert_eq!(k.thread_self(), Some(high));
        assert_eq!(k.port().total_switches(), 0);
    }

    #[test]
    fn test_equal_priority_is_fifo_and_yield_rotates_once() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 7);
        let b = spawn(&mut k, "b", 7);
        let c = spawn(&mut k, "c", 7);
        k.scheduler_start();
        assert_eq!(k.thread_self(), Some(a));
        assert_eq!(ready_order(&k, 7), [b, c]);

        // Without a yield an equal-priority peer never preempts.
        k.schedule();
        assert_eq!(k.thread_self(), Some(a));

        k.thread_yield();
        assert_eq!(k.thread_self(), Some(b));
        assert_eq!(ready_order(&k, 7), [c, a]);
        assert!(!k.thread_get(a).yield_pending);

        k.thread_yield();
        assert_eq!(k.thread_self(), Some(c));
        assert_eq!(ready_order(&k, 7), [a, b]);
    }

    #[test]
    fn test_yield_with_no_peer_keeps_running() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 7);
        spawn(&mut k, "z", 20);
        k.scheduler_start();
        k.thread_yield();
        assert_eq!(k.thread_self(), Some(a));
        assert!(!k.thread_get(a).yield_pending);
        assert_eq!(k.port().total_switches(), 0);
    }

    #[test]
    fn test_scheduler_lock_defers_preemption() {
        let mut k = kernel();
        let low = spawn(&mut k, "low", 10);
        k.scheduler_start();

        k.enter_critical();
        k.enter_critical();
        let high = spawn(&mut k, "high", 1);
        assert_eq!(k.thread_self(), Some(low));
        k.exit_critical();
        assert_eq!(k.critical_level(), 1);
        assert_eq!(k.thread_self(), Some(low));
        k.exit_critical();
        assert_eq!(k.critical_level(), 0);
        assert_eq!(k.thread_self(), Some(high));
    }

    #[test]
    #[should_panic(expected = "exit_critical without enter_critical")]
    fn test_unbalanced_exit_critical_panics() {
        let mut k = kernel();
        k.enter_critical();
        k.exit_critical();
        k.exit_critical();
    }

    #[test]
    fn test_switch_from_interrupt_is_deferred() {
        let mut k = kernel();
        let low = spawn(&mut k, "low", 10);
        let high = k.thread_init("high", noop_entry, 0, stack(512), 1, 10).unwrap();
        k.scheduler_start();
        assert_eq!(k.thread_self(), Some(low));

        k.interrupt_enter();
        k.thread_startup(high);
        k.interrupt_leave();
        assert_eq!(k.thread_self(), Some(high));
        assert_eq!(k.port().interrupt_switches, 1);
        assert_eq!(k.port().switches, 0);
    }

    #[test]
    fn test_random_insert_remove_keeps_bitmap_consistent() {
        let mut k = kernel();
        let mut rng = crate::kernel::tests::XorShift(0x9e37_79b9);
        let mut threads = Vec::new();
        for i in 0..8u8 {
            let prio = (rng.next() % 12) as u8;
            let name = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7"][i as usize];
            threads.push(k.thread_init(name, noop_entry, 0, stack(256), prio, 5).unwrap());
        }
        // Threads start suspended; toggle them in and out of the ready queue
        // without ever starting the scheduler.
        for t in &threads {
            k.thread_get_mut(*t).state = ThreadState::Suspended;
        }
        for _ in 0..500 {
            let t = threads[rng.next() as usize % threads.len()];
            if k.thread_get(t).state == ThreadState::Ready {
                k.schedule_remove_thread(t);
                k.thread_get_mut(t).state = ThreadState::Suspended;
            } else {
                k.schedule_insert_thread(t);
            }
            assert_bitmap_consistent(&k);
            let expect = threads
                .iter()
                .filter(|t| k.thread_get(**t).state == ThreadState::Ready)
                .map(|t| k.thread_get(*t).current_priority)
                .min()
                .unwrap_or(PRIO_MAX as u8 - 1);
            // The idle thread is always ready at the lowest priority.
            assert_eq!(k.ready.highest_priority(), Some(expect));
        }
    }
}
