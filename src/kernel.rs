//! # Kernel
//!
//! The [`Kernel`] value owns every piece of kernel state: tick counter,
//! ready queue, thread and timer tables, timer lists, defunct list and the
//! optional system heap. Operations are methods on it, spread over the
//! subsystem modules (`scheduler`, `thread`, `timer`, `idle`, `clock`,
//! `irq`).
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► Kernel::new(port, boot)  ← idle thread ready, timer thread parked
//!         ├─► kernel::install(k)       ← move into the global slot (firmware)
//!         ├─► thread_init / startup    ← application threads (×N)
//!         └─► scheduler_start()        ← first thread runs when its masked region ends
//!               ├─► Set interrupt priorities
//!               ├─► Configure SysTick
//!               └─► Pend PendSV with no outgoing context
//! ```
//!
//! Stack pointer cells handed to the port live inside the thread table, so
//! the kernel must not move once the scheduler has started.

use core::ptr::NonNull;

use crate::arch::Port;
use crate::clock::Tick;
use crate::config::{IDLE_HOOK_LIST_SIZE, MAX_THREADS, MAX_TIMERS, TIMER_SKIP_LIST_LEVEL};
use crate::error::KernelResult;
use crate::idle::IdleHook;
use crate::list::ListHead;
use crate::mem::{MemInfo, SmallMem};
use crate::object::Slab;
use crate::scheduler::ReadyQueue;
use crate::sync;
use crate::thread::{Thread, ThreadId};
use crate::timer::Timer;

/// Memory handed to the kernel at boot.
pub struct BootMemory {
    /// Arena of the system heap. Without one, `thread_create` fails with
    /// `NoMemory`.
    pub heap: Option<&'static mut [u8]>,
    pub idle_stack: &'static mut [u8],
    pub timer_stack: &'static mut [u8],
}

/// Kernel state.
pub struct Kernel<P: Port> {
    pub(crate) port: P,
    pub(crate) tick: Tick,
    pub(crate) interrupt_nest: u8,
    pub(crate) ready: ReadyQueue,
    pub(crate) current: Option<ThreadId>,
    /// Scheduler lock nesting.
    pub(crate) lock_nest: u16,
    pub(crate) threads: Slab<Thread<P>, MAX_THREADS>,
    pub(crate) timers: Slab<Timer<P>, MAX_TIMERS>,
    pub(crate) hard_list: [ListHead; TIMER_SKIP_LIST_LEVEL],
    pub(crate) soft_list: [ListHead; TIMER_SKIP_LIST_LEVEL],
    /// Skip-list level counter.
    pub(crate) random_nr: u32,
    /// Set while the timer thread runs soft timer actions.
    pub(crate) soft_timer_busy: bool,
    pub(crate) timer_thread: Option<ThreadId>,
    pub(crate) idle: Option<ThreadId>,
    pub(crate) idle_hooks: [Option<IdleHook<P>>; IDLE_HOOK_LIST_SIZE],
    pub(crate) defunct: ListHead,
    pub(crate) heap: Option<SmallMem<'static>>,
}

impl<P: Port> Kernel<P> {
    /// Build a kernel with its idle thread ready and its timer thread
    /// parked. Application threads are added before
    /// [`scheduler_start`](Self::scheduler_start).
    pub fn new(port: P, boot: BootMemory) -> KernelResult<Self> {
        let heap = boot.heap.and_then(SmallMem::new);
        if let Some(info) = heap.as_ref().map(SmallMem::info) {
            log::debug!("system heap: {} bytes", info.total);
        }

        let mut kernel = Self {
            port,
            tick: 0,
            interrupt_nest: 0,
            ready: ReadyQueue::new(),
            current: None,
            lock_nest: 0,
            threads: Slab::new(),
            timers: Slab::new(),
            hard_list: [ListHead::new(); TIMER_SKIP_LIST_LEVEL],
            soft_list: [ListHead::new(); TIMER_SKIP_LIST_LEVEL],
            random_nr: 0,
            soft_timer_busy: false,
            timer_thread: None,
            idle: None,
            idle_hooks: [None; IDLE_HOOK_LIST_SIZE],
            defunct: ListHead::new(),
            heap,
        };
        kernel.timer_thread_init(boot.timer_stack)?;
        kernel.idle_thread_init(boot.idle_stack)?;
        Ok(kernel)
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    // -----------------------------------------------------------------------
    // System heap
    // -----------------------------------------------------------------------

    /// Allocate from the system heap. `None` when there is no heap or no
    /// block is large enough.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let heap = self.heap.as_mut()?;
        sync::masked(|| heap.alloc(size))
    }

    pub fn free(&mut self, ptr: NonNull<u8>) {
        let heap = match self.heap.as_mut() {
            Some(h) => h,
            None => panic!("free without a system heap"),
        };
        sync::masked(|| heap.free(ptr));
    }

    pub fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let heap = self.heap.as_mut()?;
        sync::masked(|| heap.realloc(ptr, size))
    }

    pub fn heap_info(&self) -> Option<MemInfo> {
        self.heap.as_ref().map(SmallMem::info)
    }
}

// ---------------------------------------------------------------------------
// Global kernel instance (firmware)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod global {
    use core::ptr::{addr_of_mut, null_mut};

    use super::Kernel;
    use crate::arch::cortex_m4::CortexM4;
    use crate::sync;

    /// The kernel, reachable from exception handlers and thread bodies.
    ///
    /// # Safety
    /// Accessed via `KERNEL_PTR` once `install` has run. Shared state is
    /// only touched inside the kernel's own masked regions.
    static mut KERNEL: Option<Kernel<CortexM4>> = None;

    /// Raw pointer to the installed kernel. Set once by `install`.
    static mut KERNEL_PTR: *mut Kernel<CortexM4> = null_mut();

    /// Move the kernel into its final place. Must happen before the
    /// scheduler starts.
    pub fn install(kernel: Kernel<CortexM4>) {
        sync::masked(|| unsafe {
            let slot = &mut *addr_of_mut!(KERNEL);
            assert!(slot.is_none(), "kernel installed twice");
            KERNEL_PTR = slot.insert(kernel) as *mut Kernel<CortexM4>;
        });
    }

    /// Run `f` on the installed kernel. Interrupts stay unmasked outside
    /// the kernel's own critical regions, so timer actions and idle hooks
    /// run preemptible and a switch pended inside `f` is taken as soon as
    /// the region that pended it ends.
    pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<CortexM4>) -> R) -> R {
        // SAFETY: set once by `install` and never cleared.
        let ptr = unsafe { KERNEL_PTR };
        assert!(!ptr.is_null(), "kernel not installed");
        f(unsafe { &mut *ptr })
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use global::{install, with_kernel};

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::config::{IDLE_STACK_SIZE, TIMER_THREAD_STACK_SIZE};
    use crate::thread::ThreadState;
    use std::boxed::Box;
    use std::vec;

    pub(crate) const HEAP_SIZE: usize = 16 * 1024;

    /// Leaked zeroed buffer, standing in for a `static mut` array.
    pub(crate) fn stack(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    pub(crate) extern "C" fn noop_entry(_: usize) {}

    /// Kernel over a simulated port with a 16 KiB heap.
    pub(crate) fn kernel() -> Kernel<SimPort> {
        let boot = BootMemory {
            heap: Some(stack(HEAP_SIZE)),
            idle_stack: stack(IDLE_STACK_SIZE),
            timer_stack: stack(TIMER_THREAD_STACK_SIZE),
        };
        Kernel::new(SimPort::new(), boot).unwrap()
    }

    /// Panics unless interrupts are unmasked on the calling thread: another
    /// thread must be able to take the critical section meanwhile.
    pub(crate) fn assert_unmasked() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            critical_section::with(|_| ());
            let _ = tx.send(());
        });
        assert!(
            rx.recv_timeout(std::time::Duration::from_secs(1)).is_ok(),
            "interrupts masked"
        );
    }

    /// Minimal xorshift generator for randomized sequences.
    pub(crate) struct XorShift(pub u32);

    impl XorShift {
        pub(crate) fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_boot_creates_kernel_threads() {
        let k = kernel();
        let idle = k.idle_thread().unwrap();
        let worker = k.timer_thread().unwrap();
        assert_eq!(k.thread_find("tidle"), Some(idle));
        assert_eq!(k.thread_find("timer"), Some(worker));
        assert_eq!(k.thread_get(worker).state(), ThreadState::Suspended);
        assert_eq!(k.thread_self(), None);
        assert_eq!(k.tick_get(), 0);
        assert_eq!(k.port().frames, 2);
        // One embedded timer per thread.
        assert_eq!(k.timers.len(), 2);
    }

    #[test]
    fn test_heap_facade() {
        let mut k = kernel();
        let info = k.heap_info().unwrap();
        assert_eq!(info.used, 0);
        assert!(info.total > HEAP_SIZE - 64);

        let p = k.malloc(100).unwrap();
        assert!(k.heap_info().unwrap().used >= 100);
        let q = k.realloc(Some(p), 300).unwrap();
        k.free(q);
        assert_eq!(k.heap_info().unwrap().used, 0);
        assert!(k.heap_info().unwrap().max_used >= 300);
    }

    #[test]
    fn test_huge_heap_requests_fail_cleanly() {
        let mut k = kernel();
        assert!(k.malloc(usize::MAX).is_none());
        let p = k.malloc(64).unwrap();
        let used = k.heap_info().unwrap().used;
        assert!(k.realloc(Some(p), usize::MAX - 1).is_none());
        assert_eq!(k.heap_info().unwrap().used, used);
        assert_eq!(
            k.thread_create("big", noop_entry, 0, usize::MAX, 5, 10),
            Err(crate::error::KernelError::NoMemory)
        );
        k.free(p);
        assert_eq!(k.heap_info().unwrap().used, 0);
    }

    #[test]
    fn test_without_heap_creation_fails() {
        let boot = BootMemory {
            heap: None,
            idle_stack: stack(IDLE_STACK_SIZE),
            timer_stack: stack(TIMER_THREAD_STACK_SIZE),
        };
        let mut k = Kernel::new(SimPort::new(), boot).unwrap();
        assert!(k.malloc(8).is_none());
        assert!(k.heap_info().is_none());
        assert_eq!(
            k.thread_create("t", noop_entry, 0, 256, 5, 10),
            Err(crate::error::KernelError::NoMemory)
        );
    }
}
