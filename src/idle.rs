//! # Idle Thread
//!
//! The idle thread runs at the lowest priority (`PRIO_MAX - 1`) and is
//! always ready, so the ready bitmap is never empty once the kernel is
//! built. Each pass of its loop ([`Kernel::idle_step`]) calls the installed
//! idle hooks, then reclaims every thread on the defunct list.
//!
//! ```text
//!   thread_close ──► defunct list ──► idle_step ──► stack freed (heap)
//!                    [T3] ─ [T7]                    slot released
//! ```
//!
//! Cleanup callbacks already ran when the thread closed; the reaper only
//! releases memory, so a thread's stack is never freed while it may still
//! be executing on it.

use crate::arch::Port;
use crate::config::{IDLE_HOOK_LIST_SIZE, IDLE_THREAD_TICK, PRIO_MAX};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sync;
use crate::thread::{Queue, ThreadId};

/// Idle hook, called on every idle pass. Must not block.
pub type IdleHook<P> = fn(&mut Kernel<P>);

impl<P: Port> Kernel<P> {
    /// Create and ready the idle thread.
    pub(crate) fn idle_thread_init(&mut self, stack: &'static mut [u8]) -> KernelResult<ThreadId> {
        let tid = self.thread_init(
            "tidle",
            P::IDLE_ENTRY,
            0,
            stack,
            (PRIO_MAX - 1) as u8,
            IDLE_THREAD_TICK,
        )?;
        self.thread_startup(tid);
        self.idle = Some(tid);
        Ok(tid)
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        self.idle
    }

    /// Install an idle hook in the first free slot.
    pub fn idle_sethook(&mut self, hook: IdleHook<P>) -> KernelResult<()> {
        sync::masked(|| {
            let slot = self
                .idle_hooks
                .iter_mut()
                .find(|h| h.is_none())
                .ok_or(KernelError::Full)?;
            *slot = Some(hook);
            Ok(())
        })
    }

    /// Remove a previously installed idle hook.
    pub fn idle_delhook(&mut self, hook: IdleHook<P>) -> KernelResult<()> {
        sync::masked(|| {
            let slot = self
                .idle_hooks
                .iter_mut()
                .find(|h| matches!(h, Some(f) if *f as usize == hook as usize))
                .ok_or(KernelError::NoSys)?;
            *slot = None;
            Ok(())
        })
    }

    /// One pass of the idle loop.
    pub fn idle_step(&mut self) {
        for i in 0..IDLE_HOOK_LIST_SIZE {
            if let Some(hook) = self.idle_hooks[i] {
                hook(self);
            }
        }
        self.defunct_execute();
    }

    // -----------------------------------------------------------------------
    // Defunct list
    // -----------------------------------------------------------------------

    /// Queue a closed thread for reclamation by the idle thread.
    pub fn defunct_enqueue(&mut self, tid: ThreadId) {
        sync::masked(|| {
            let thread = self.threads.get_mut(tid.0);
            debug_assert!(thread.queue == Queue::None, "defunct thread still queued");
            thread.queue = Queue::Defunct;
            self.defunct.push_back(&mut self.threads, tid.0.index());
        });
    }

    /// Pop the oldest defunct thread.
    pub(crate) fn defunct_dequeue(&mut self) -> Option<ThreadId> {
        sync::masked(|| {
            let node = self.defunct.pop_front(&mut self.threads)?;
            let tid = ThreadId(self.threads.handle_at(node)?);
            self.threads.get_mut(tid.0).queue = Queue::None;
            Some(tid)
        })
    }

    /// Reclaim every defunct thread.
    pub(crate) fn defunct_execute(&mut self) {
        while let Some(tid) = self.defunct_dequeue() {
            assert!(self.current != Some(tid), "reaping the running thread");
            // No-op unless the thread closed without running it.
            self.thread_cleanup_execute(tid);

            let thread = self.threads.remove(tid.0);
            log::debug!("reclaim thread {}", thread.header.name);
            if !thread.header.is_system_object() {
                self.free(thread.stack.base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::kernel::tests::{kernel, noop_entry};
    use crate::thread::ThreadState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::vec::Vec;

    type K = Kernel<SimPort>;

    #[test]
    fn test_idle_thread_is_ready_at_lowest_priority() {
        let k = kernel();
        let idle = k.idle_thread().unwrap();
        assert_eq!(k.thread_get(idle).priority(), (PRIO_MAX - 1) as u8);
        assert_eq!(k.thread_get(idle).state(), ThreadState::Ready);
        assert_eq!(k.ready_queue().bitmap(), 1 << (PRIO_MAX - 1));
    }

    #[test]
    fn test_idle_runs_when_nothing_else_is_ready() {
        let mut k = kernel();
        k.scheduler_start();
        assert_eq!(k.thread_self(), k.idle_thread());
    }

    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_hook(_: &mut K) {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn other_hook(_: &mut K) {}

    #[test]
    fn test_hook_table_full_and_missing() {
        let mut k = kernel();
        k.idle_sethook(count_hook).unwrap();
        for _ in 1..IDLE_HOOK_LIST_SIZE {
            k.idle_sethook(other_hook).unwrap();
        }
        assert_eq!(k.idle_sethook(other_hook), Err(KernelError::Full));

        let before = HOOK_CALLS.load(Ordering::SeqCst);
        k.idle_step();
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before + 1);

        k.idle_delhook(count_hook).unwrap();
        assert_eq!(k.idle_delhook(count_hook), Err(KernelError::NoSys));
        k.idle_step();
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before + 1);
        k.idle_sethook(count_hook).unwrap();
    }

    static UNMASKED_HOOK_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn unmasked_hook(_: &mut K) {
        crate::kernel::tests::assert_unmasked();
        UNMASKED_HOOK_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_hooks_run_with_interrupts_unmasked() {
        let mut k = kernel();
        k.idle_sethook(unmasked_hook).unwrap();
        k.idle_step();
        assert_eq!(UNMASKED_HOOK_RUNS.load(Ordering::SeqCst), 1);
    }

    /// (event, heap bytes in use when it happened)
    static EVENTS: Mutex<Vec<(&'static str, usize)>> = Mutex::new(Vec::new());

    fn cleanup_record(k: &mut K, _: ThreadId) {
        let used = k.heap_info().map_or(0, |i| i.used);
        EVENTS.lock().unwrap().push(("cleanup", used));
    }

    #[test]
    fn test_cleanup_runs_before_stack_release_and_release_only_in_reaper() {
        let mut k = kernel();
        let base = k.heap_info().unwrap().used;
        let ids: Vec<ThreadId> = ["d0", "d1", "d2"]
            .iter()
            .map(|name| {
                let t = k.thread_create(name, noop_entry, 0, 384, 9, 5).unwrap();
                k.thread_get_mut(t).set_cleanup(Some(cleanup_record));
                k.thread_startup(t);
                t
            })
            .collect();
        let live = k.heap_info().unwrap().used;

        for t in &ids {
            k.thread_delete(*t).unwrap();
        }
        {
            let events = EVENTS.lock().unwrap();
            let mine: Vec<_> = events.iter().filter(|e| e.1 == live).collect();
            // Every cleanup saw all stacks still allocated.
            assert!(mine.len() >= ids.len());
        }
        assert_eq!(k.heap_info().unwrap().used, live);
        assert_eq!(k.defunct.len(), 3);

        k.idle_step();
        assert_eq!(k.heap_info().unwrap().used, base);
        assert!(k.defunct.is_empty());
        for name in ["d0", "d1", "d2"] {
            assert!(k.thread_find(name).is_none());
        }
        // Reaping again finds nothing.
        k.idle_step();
        assert_eq!(k.heap_info().unwrap().used, base);
    }

    #[test]
    fn test_reaped_slot_is_reused_with_new_generation() {
        let mut k = kernel();
        let old = k.thread_create("a", noop_entry, 0, 256, 9, 5).unwrap();
        k.thread_delete(old).unwrap();
        k.idle_step();
        let new = k.thread_create("b", noop_entry, 0, 256, 9, 5).unwrap();
        assert_eq!(old.0.index(), new.0.index());
        assert_ne!(old, new);
        assert!(!k.threads.contains(old.0));
    }
}
