//! # Threads
//!
//! Thread objects and their lifecycle.
//!
//! ```text
//!            startup            schedule()
//!   Init ───────────► Ready ◄──────────────► Running
//!                      ▲  │                    │
//!           resume /   │  │ suspend            │ suspend / sleep
//!           timeout    │  ▼                    ▼
//!                     Suspended ◄──────────────┘
//!
//!   any state ── detach / delete / exit ──► Close ──► (idle reaper)
//! ```
//!
//! Each thread owns an embedded one-shot timer used by sleep and delay; on
//! expiry it calls [`Kernel::thread_timeout`], which readies the thread with
//! its error set to `Timeout`.
//!
//! ## Termination
//!
//! Closing a thread removes it from the ready queue, runs its cleanup
//! callback (exactly once), detaches its timer and marks it `Close`. A heap
//! thread, or any thread closing itself, is then queued on the defunct list
//! and reclaimed by the idle thread; its stack is only freed there. A static
//! thread closed by another thread leaves the registry at once.

use core::ptr::NonNull;

use crate::arch::{Port, ThreadEntry};
use crate::clock::{tick_from_millisecond, Tick};
use crate::config::{PRIO_MAX, STACK_FILL};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::Link;
use crate::object::{Handle, KernelObject, ObjectClass, ObjectHeader};
use crate::sync;
use crate::timer::{TimerCtrl, TimerFlags, TimerId, Timeout};

/// Handle of a thread object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(pub(crate) Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never started.
    Init,
    /// Queued in the ready queue.
    Ready,
    /// The current thread.
    Running,
    Suspended,
    /// Terminated; waiting for, or past, reclamation.
    Close,
}

/// List the thread's `tlist` node is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queue {
    None,
    Ready,
    Defunct,
}

/// Called once when a thread is closed, before its stack is released.
pub type CleanupFn<P> = fn(&mut Kernel<P>, ThreadId);

/// Thread control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCtrl {
    ChangePriority(u8),
    Startup,
    Close,
}

/// Stack memory of a thread.
pub(crate) struct Stack {
    pub(crate) base: NonNull<u8>,
    pub(crate) size: usize,
}

impl Stack {
    /// # Safety
    /// The stack memory must be owned by the thread and still allocated.
    unsafe fn as_slice_mut(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size)
    }

    unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.base.as_ptr(), self.size)
    }
}

/// Thread object.
pub struct Thread<P: Port> {
    pub(crate) header: ObjectHeader,
    pub(crate) state: ThreadState,
    /// Set when the time slice ran out or the thread yielded; consumed by
    /// the next scheduling decision.
    pub(crate) yield_pending: bool,
    pub(crate) init_priority: u8,
    pub(crate) current_priority: u8,
    pub(crate) number_mask: u32,
    pub(crate) stack: Stack,
    /// Saved stack pointer, written and read by the port.
    pub(crate) sp: usize,
    pub(crate) entry: ThreadEntry,
    pub(crate) parameter: usize,
    pub(crate) init_tick: Tick,
    pub(crate) remaining_tick: Tick,
    pub(crate) timer: TimerId,
    pub(crate) cleanup: Option<CleanupFn<P>>,
    pub(crate) error: Option<KernelError>,
    pub(crate) tlist: Link,
    pub(crate) queue: Queue,
    pub user_data: usize,
}

// Safety: the stack pointer is owned by the thread; kernel state is only
// touched with interrupts masked.
unsafe impl<P: Port> Send for Thread<P> {}

impl<P: Port> Thread<P> {
    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.current_priority
    }

    pub fn init_priority(&self) -> u8 {
        self.init_priority
    }

    pub fn remaining_tick(&self) -> Tick {
        self.remaining_tick
    }

    /// Error of the last blocking operation, `Timeout` after a timed wake.
    pub fn error(&self) -> Option<KernelError> {
        self.error
    }

    pub fn stack_size(&self) -> usize {
        self.stack.size
    }

    pub fn entry(&self) -> (ThreadEntry, usize) {
        (self.entry, self.parameter)
    }

    pub fn set_cleanup(&mut self, cleanup: Option<CleanupFn<P>>) {
        self.cleanup = cleanup;
    }
}

impl<P: Port> KernelObject for Thread<P> {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl<P: Port> Kernel<P> {
    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Initialize a thread over a caller-provided stack.
    ///
    /// The thread starts in `Init`; call [`thread_startup`](Self::thread_startup)
    /// to make it schedulable.
    pub fn thread_init(
        &mut self,
        name: &str,
        entry: ThreadEntry,
        parameter: usize,
        stack: &'static mut [u8],
        priority: u8,
        tick: Tick,
    ) -> KernelResult<ThreadId> {
        let size = stack.len();
        let base = NonNull::from(stack).cast::<u8>();
        self.thread_object_new(name, entry, parameter, Stack { base, size }, priority, tick, true)
    }

    /// Create a thread whose stack comes from the kernel heap.
    pub fn thread_create(
        &mut self,
        name: &str,
        entry: ThreadEntry,
        parameter: usize,
        stack_size: usize,
        priority: u8,
        tick: Tick,
    ) -> KernelResult<ThreadId> {
        let base = self.malloc(stack_size).ok_or(KernelError::NoMemory)?;
        let stack = Stack {
            base,
            size: stack_size,
        };
        self.thread_object_new(name, entry, parameter, stack, priority, tick, false)
            .map_err(|e| {
                self.free(base);
                e
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn thread_object_new(
        &mut self,
        name: &str,
        entry: ThreadEntry,
        parameter: usize,
        mut stack: Stack,
        priority: u8,
        tick: Tick,
        is_static: bool,
    ) -> KernelResult<ThreadId> {
        assert!((priority as usize) < PRIO_MAX, "thread priority out of range");
        assert!(tick > 0, "thread time slice must be at least one tick");

        let handle = self.threads.vacant_handle().ok_or(KernelError::Full)?;
        let timer = self.timer_object_new(
            name,
            Timeout::Wake(ThreadId(handle)),
            0,
            TimerFlags::ONE_SHOT | TimerFlags::HARD_TIMER,
            true,
        )?;

        // SAFETY: the stack is exclusively owned by the new thread.
        let sp = unsafe {
            let memory = stack.as_slice_mut();
            memory.fill(STACK_FILL);
            self.port.stack_init(entry, parameter, memory)
        };

        let inserted = self.threads.insert_with(|_| Thread {
            header: ObjectHeader::new(name, ObjectClass::Thread, is_static),
            state: ThreadState::Init,
            yield_pending: false,
            init_priority: priority,
            current_priority: priority,
            number_mask: 0,
            stack,
            sp,
            entry,
            parameter,
            init_tick: tick,
            remaining_tick: tick,
            timer,
            cleanup: None,
            error: None,
            tlist: Link::new(),
            queue: Queue::None,
            user_data: 0,
        });
        debug_assert_eq!(inserted, Some(handle));
        log::debug!("thread {} created, priority {}", name, priority);
        Ok(ThreadId(handle))
    }

    pub fn thread_get(&self, tid: ThreadId) -> &Thread<P> {
        self.threads.get(tid.0)
    }

    pub fn thread_get_mut(&mut self, tid: ThreadId) -> &mut Thread<P> {
        self.threads.get_mut(tid.0)
    }

    pub fn thread_find(&self, name: &str) -> Option<ThreadId> {
        self.threads.find(name).map(ThreadId)
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Init -> Suspended with the scheduling priority fixed.
    pub(crate) fn thread_prepare(&mut self, tid: ThreadId) {
        let thread = self.threads.get_mut(tid.0);
        assert!(
            thread.state == ThreadState::Init,
            "thread {} started twice",
            thread.name()
        );
        thread.current_priority = thread.init_priority;
        thread.number_mask = 1 << thread.current_priority;
        thread.state = ThreadState::Suspended;
    }

    /// Make an `Init` thread schedulable.
    pub fn thread_startup(&mut self, tid: ThreadId) {
        self.thread_prepare(tid);
        log::debug!(
            "startup a thread:{} with priority:{}",
            self.threads.get(tid.0).name(),
            self.threads.get(tid.0).current_priority
        );
        let resumed = self.thread_resume(tid);
        debug_assert!(resumed.is_ok(), "freshly prepared thread not suspended");
        if self.current.is_some() {
            self.schedule();
        }
    }

    /// Stop a Ready or Running thread. Suspending the running thread takes
    /// effect at the next `schedule()`.
    pub fn thread_suspend(&mut self, tid: ThreadId) -> KernelResult<()> {
        let thread = self.threads.get(tid.0);
        if !matches!(thread.state, ThreadState::Ready | ThreadState::Running) {
            log::debug!("thread suspend: thread disorder, {:?}", thread.state);
            return Err(KernelError::Error);
        }
        assert!(
            thread.state != ThreadState::Running || self.current == Some(tid),
            "suspending a running thread that is not current"
        );
        log::trace!("thread suspend: {}", thread.name());

        let timer = thread.timer;
        sync::masked(|| {
            self.schedule_remove_thread(tid);
            self.threads.get_mut(tid.0).state = ThreadState::Suspended;
        });
        let _ = self.timer_stop(timer);
        Ok(())
    }

    /// Ready a Suspended thread. Does not reschedule.
    pub fn thread_resume(&mut self, tid: ThreadId) -> KernelResult<()> {
        let thread = self.threads.get(tid.0);
        if thread.state != ThreadState::Suspended {
            log::debug!("thread resume: thread disorder, {:?}", thread.state);
            return Err(KernelError::Error);
        }
        log::trace!("thread resume: {}", thread.name());
        let timer = thread.timer;
        let _ = self.timer_stop(timer);
        self.schedule_insert_thread(tid);
        Ok(())
    }

    /// Embedded timer expiry: wake `tid` with `Timeout` and reschedule.
    pub fn thread_timeout(&mut self, tid: ThreadId) {
        assert!(
            self.threads.get(tid.0).state == ThreadState::Suspended,
            "timed out thread is not suspended"
        );
        self.threads.get_mut(tid.0).error = Some(KernelError::Timeout);
        self.schedule_insert_thread(tid);
        self.schedule();
    }

    /// Give up the rest of the time slice to equal-priority peers.
    pub fn thread_yield(&mut self) {
        let Some(current) = self.current else {
            return;
        };
        sync::masked(|| {
            let thread = self.threads.get_mut(current.0);
            thread.remaining_tick = thread.init_tick;
            thread.yield_pending = true;
        });
        self.schedule();
    }

    /// Suspend the current thread for `tick` ticks.
    pub fn thread_sleep(&mut self, tick: Tick) -> KernelResult<()> {
        let current = match self.current {
            Some(t) => t,
            None => panic!("thread_sleep before the scheduler started"),
        };
        let timer = self.threads.get(current.0).timer;
        self.threads.get_mut(current.0).error = None;
        self.thread_suspend(current)?;
        self.timer_control(timer, TimerCtrl::SetTime(tick))?;
        self.timer_start(timer)?;
        self.schedule();
        Ok(())
    }

    pub fn thread_delay(&mut self, tick: Tick) -> KernelResult<()> {
        self.thread_sleep(tick)
    }

    pub fn thread_mdelay(&mut self, ms: u32) -> KernelResult<()> {
        self.thread_sleep(tick_from_millisecond(ms))
    }

    /// Periodic delay: sleep until `*tick + inc_tick`, then advance `*tick`
    /// by `inc_tick`. Returns at once if that point already passed.
    pub fn thread_delay_until(&mut self, tick: &mut Tick, inc_tick: Tick) -> KernelResult<()> {
        let now = self.tick;
        let elapsed = now.wrapping_sub(*tick);
        if elapsed < inc_tick {
            self.thread_sleep(inc_tick - elapsed)?;
        }
        *tick = tick.wrapping_add(inc_tick);
        Ok(())
    }

    pub fn thread_control(&mut self, tid: ThreadId, cmd: ThreadCtrl) -> KernelResult<()> {
        match cmd {
            ThreadCtrl::ChangePriority(priority) => {
                assert!((priority as usize) < PRIO_MAX, "thread priority out of range");
                sync::masked(|| {
                    let ready = self.threads.get(tid.0).state == ThreadState::Ready;
                    if ready {
                        self.schedule_remove_thread(tid);
                    }
                    let thread = self.threads.get_mut(tid.0);
                    thread.current_priority = priority;
                    thread.number_mask = 1 << priority;
                    if ready {
                        self.schedule_insert_thread(tid);
                    }
                });
                Ok(())
            }
            ThreadCtrl::Startup => {
                self.thread_startup(tid);
                Ok(())
            }
            ThreadCtrl::Close => {
                if self.threads.get(tid.0).header.is_system_object() {
                    self.thread_detach(tid)
                } else {
                    self.thread_delete(tid)
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Terminate a thread initialized with [`thread_init`](Self::thread_init).
    pub fn thread_detach(&mut self, tid: ThreadId) -> KernelResult<()> {
        assert!(
            self.threads.get(tid.0).header.is_system_object(),
            "thread_detach on a heap thread"
        );
        self.thread_close(tid);
        Ok(())
    }

    /// Terminate a thread made with [`thread_create`](Self::thread_create).
    pub fn thread_delete(&mut self, tid: ThreadId) -> KernelResult<()> {
        assert!(
            !self.threads.get(tid.0).header.is_system_object(),
            "thread_delete on a static thread"
        );
        self.thread_close(tid);
        Ok(())
    }

    /// Entry-return path: terminate the current thread and switch away.
    pub fn thread_exit(&mut self) {
        let current = match self.current {
            Some(t) => t,
            None => panic!("thread_exit without a running thread"),
        };
        self.thread_close(current);
    }

    fn thread_close(&mut self, tid: ThreadId) {
        let thread = self.threads.get(tid.0);
        if thread.state == ThreadState::Close {
            return;
        }
        log::debug!("thread {} closed", thread.name());
        let is_static = thread.header.is_system_object();
        let timer = thread.timer;

        if thread.state != ThreadState::Init {
            self.schedule_remove_thread(tid);
        }
        self.thread_cleanup_execute(tid);
        self.timer_detach(timer);
        self.threads.get_mut(tid.0).state = ThreadState::Close;

        let is_self = self.current == Some(tid);
        if is_static && !is_self {
            // Nothing to free: drop it from the registry now.
            self.threads.remove(tid.0);
        } else {
            self.defunct_enqueue(tid);
        }
        if is_self {
            self.schedule();
        }
    }

    /// Run the cleanup callback if it has not run yet.
    pub(crate) fn thread_cleanup_execute(&mut self, tid: ThreadId) {
        let cleanup = self.threads.get_mut(tid.0).cleanup.take();
        if let Some(cleanup) = cleanup {
            sync::masked(|| cleanup(self, tid));
        }
    }

    // -----------------------------------------------------------------------
    // Stack
    // -----------------------------------------------------------------------

    /// Bytes at the far end of the stack never written since creation.
    pub fn thread_stack_unused(&self, tid: ThreadId) -> usize {
        let thread = self.threads.get(tid.0);
        // SAFETY: the stack is alive as long as the thread object is.
        let memory = unsafe { thread.stack.as_slice() };
        memory.iter().take_while(|&&b| b == STACK_FILL).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::kernel::tests::{kernel, noop_entry, stack};
    use std::sync::Mutex;
    use std::vec::Vec;

    type K = Kernel<SimPort>;

    fn spawn(k: &mut K, name: &str, prio: u8) -> ThreadId {
        let tid = k.thread_init(name, noop_entry, 0, stack(512), prio, 10).unwrap();
        k.thread_startup(tid);
        tid
    }

    #[test]
    fn test_init_fills_stack_and_lays_frame() {
        let mut k = kernel();
        let tid = k.thread_init("t", noop_entry, 42, stack(512), 5, 10).unwrap();
        let thread = k.thread_get(tid);
        assert_eq!(thread.state(), ThreadState::Init);
        assert_eq!(thread.name(), "t");
        let unused = k.thread_stack_unused(tid);
        assert!(unused < 512 && unused >= 512 - 16 * core::mem::size_of::<usize>() - 8);
        assert_eq!(k.thread_find("t"), Some(tid));
    }

    #[test]
    fn test_startup_sets_priority_bit_and_readies() {
        let mut k = kernel();
        let tid = k.thread_init("t", noop_entry, 0, stack(512), 6, 10).unwrap();
        k.thread_startup(tid);
        let thread = k.thread_get(tid);
        assert_eq!(thread.state(), ThreadState::Ready);
        assert_eq!(thread.number_mask, 1 << 6);
        assert_ne!(k.ready_queue().bitmap() & (1 << 6), 0);
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn test_double_startup_panics() {
        let mut k = kernel();
        let tid = spawn(&mut k, "t", 6);
        k.thread_startup(tid);
    }

    #[test]
    fn test_suspend_resume_legality() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.scheduler_start();

        // Ready -> Suspended
        k.thread_suspend(b).unwrap();
        assert_eq!(k.thread_get(b).state(), ThreadState::Suspended);
        assert_eq!(k.thread_suspend(b), Err(KernelError::Error));
        assert_eq!(k.ready_queue().bitmap() & (1 << 6), 0);

        // Running resume is refused
        assert_eq!(k.thread_resume(a), Err(KernelError::Error));

        k.thread_resume(b).unwrap();
        assert_eq!(k.thread_get(b).state(), ThreadState::Ready);
        assert_eq!(k.thread_self(), Some(a));

        // Running (current) -> Suspended, then switch away on schedule.
        k.thread_suspend(a).unwrap();
        k.schedule();
        assert_eq!(k.thread_self(), Some(b));
    }

    #[test]
    fn test_init_thread_cannot_be_suspended_or_resumed() {
        let mut k = kernel();
        let t = k.thread_init("t", noop_entry, 0, stack(512), 5, 10).unwrap();
        assert_eq!(k.thread_suspend(t), Err(KernelError::Error));
        assert_eq!(k.thread_resume(t), Err(KernelError::Error));
    }

    #[test]
    fn test_sleep_times_out_with_timeout_error() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 9);
        k.scheduler_start();

        k.thread_delay(3).unwrap();
        assert_eq!(k.thread_get(a).state(), ThreadState::Suspended);
        assert_eq!(k.thread_self(), Some(b));

        for _ in 0..3 {
            k.tick_increase();
        }
        assert_eq!(k.thread_self(), Some(a));
        assert_eq!(k.thread_get(a).error(), Some(KernelError::Timeout));
        assert!(!k.timer_get(k.thread_get(a).timer).is_active());
    }

    #[test]
    fn test_resume_cancels_pending_sleep() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 5);
        spawn(&mut k, "b", 9);
        k.scheduler_start();
        k.thread_delay(100).unwrap();
        assert!(k.timer_get(k.thread_get(a).timer).is_active());
        k.thread_resume(a).unwrap();
        assert!(!k.timer_get(k.thread_get(a).timer).is_active());
        k.schedule();
        assert_eq!(k.thread_self(), Some(a));
    }

    #[test]
    fn test_delay_until_keeps_period_anchor() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 5);
        spawn(&mut k, "b", 9);
        k.scheduler_start();

        let mut last = k.tick_get();
        k.tick_set(4);
        k.thread_delay_until(&mut last, 10).unwrap();
        assert_eq!(last, 10);
        assert_eq!(k.timer_get(k.thread_get(a).timer).timeout_tick(), 10);

        for _ in 0..6 {
            k.tick_increase();
        }
        assert_eq!(k.thread_self(), Some(a));

        // Already late: no sleep, anchor still advances by one period.
        k.tick_set(25);
        k.thread_delay_until(&mut last, 10).unwrap();
        assert_eq!(last, 20);
        assert_eq!(k.thread_self(), Some(a));
    }

    #[test]
    fn test_change_priority_requeues_ready_thread() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 9);
        k.scheduler_start();
        k.thread_control(b, ThreadCtrl::ChangePriority(3)).unwrap();
        assert_eq!(k.thread_get(b).priority(), 3);
        assert_eq!(k.ready_queue().bitmap() & (1 << 9), 0);
        assert_ne!(k.ready_queue().bitmap() & (1 << 3), 0);
        k.schedule();
        assert_eq!(k.thread_self(), Some(b));
        assert_eq!(k.thread_get(a).state(), ThreadState::Ready);
    }

    static CLEANUPS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn note_cleanup(k: &mut K, tid: ThreadId) {
        let name = match k.thread_get(tid).name() {
            "heap" => "heap",
            "self" => "self",
            _ => "other",
        };
        CLEANUPS.lock().unwrap().push(name);
    }

    #[test]
    fn test_delete_runs_cleanup_once_and_defers_stack_release() {
        let mut k = kernel();
        let used_before = k.heap_info().unwrap().used;
        let t = k.thread_create("heap", noop_entry, 0, 256, 7, 10).unwrap();
        k.thread_get_mut(t).set_cleanup(Some(note_cleanup));
        k.thread_startup(t);
        let used_live = k.heap_info().unwrap().used;
        assert!(used_live > used_before);

        k.thread_delete(t).unwrap();
        assert_eq!(k.thread_get(t).state(), ThreadState::Close);
        // Idempotent.
        k.thread_delete(t).unwrap();
        assert_eq!(CLEANUPS.lock().unwrap().iter().filter(|n| **n == "heap").count(), 1);
        // Stack still allocated until the reaper runs.
        assert_eq!(k.heap_info().unwrap().used, used_live);

        k.idle_step();
        assert_eq!(k.heap_info().unwrap().used, used_before);
        assert!(k.thread_find("heap").is_none());
        assert_eq!(CLEANUPS.lock().unwrap().iter().filter(|n| **n == "heap").count(), 1);
    }

    #[test]
    fn test_detach_static_thread_leaves_registry_immediately() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        let timers_before = k.timers.len();
        k.scheduler_start();
        k.thread_detach(b).unwrap();
        assert!(k.thread_find("b").is_none());
        assert_eq!(k.timers.len(), timers_before - 1);
        assert_eq!(k.ready_queue().bitmap() & (1 << 6), 0);
        assert_eq!(k.thread_self(), Some(a));
    }

    #[test]
    fn test_exit_switches_away_and_reaper_detaches() {
        let mut k = kernel();
        let me = spawn(&mut k, "self", 5);
        let other = spawn(&mut k, "other", 6);
        k.thread_get_mut(me).set_cleanup(Some(note_cleanup));
        k.scheduler_start();
        assert_eq!(k.thread_self(), Some(me));

        k.thread_exit();
        assert_eq!(k.thread_self(), Some(other));
        assert_eq!(k.thread_get(me).state(), ThreadState::Close);
        // Still registered: it was running on its stack when it closed.
        assert_eq!(k.thread_find("self"), Some(me));

        k.idle_step();
        assert!(k.thread_find("self").is_none());
        assert_eq!(CLEANUPS.lock().unwrap().iter().filter(|n| **n == "self").count(), 1);
    }

    #[test]
    fn test_closing_init_thread_skips_ready_queue() {
        let mut k = kernel();
        let t = k.thread_init("t", noop_entry, 0, stack(512), 5, 10).unwrap();
        let bitmap = k.ready_queue().bitmap();
        k.thread_control(t, ThreadCtrl::Close).unwrap();
        assert_eq!(k.ready_queue().bitmap(), bitmap);
        assert!(k.thread_find("t").is_none());
    }

    #[test]
    fn test_create_without_memory_fails() {
        let mut k = kernel();
        assert_eq!(
            k.thread_create("big", noop_entry, 0, 1 << 20, 5, 10),
            Err(KernelError::NoMemory)
        );
    }

    #[test]
    #[should_panic(expected = "thread_delete on a static thread")]
    fn test_delete_static_thread_panics() {
        let mut k = kernel();
        let t = spawn(&mut k, "t", 5);
        let _ = k.thread_delete(t);
    }
}
