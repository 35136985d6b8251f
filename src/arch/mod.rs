//! # Architecture Abstraction Layer
//!
//! The kernel never touches CPU registers itself. Everything that depends on
//! the core (initial stack frame, context switch, first thread launch) goes
//! through the [`Port`] trait, which the kernel is generic over.
//!
//! ```text
//!            Kernel<P: Port>
//!                  │
//!        ┌─────────┴──────────┐
//!        ▼                    ▼
//!  cortex_m4::CortexM4     sim::SimPort
//!  PendSV / SysTick        records switch requests
//!  (thumbv7em-none-*)      (hosted builds and tests)
//! ```

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
pub mod sim;

/// Thread entry point. Receives the parameter given at thread creation.
///
/// Returning from the entry terminates the thread through the port's exit
/// path.
pub type ThreadEntry = extern "C" fn(usize);

/// CPU port consumed by the kernel.
///
/// Stack pointers are exchanged through *cells*: the address of the `sp`
/// field of a thread record. The port writes the outgoing thread's stack
/// pointer through `from` and reads the incoming one from `to`, possibly
/// later than the call (deferred switch).
pub trait Port {
    /// Body of the idle thread on this port: loops over `Kernel::idle_step`.
    const IDLE_ENTRY: ThreadEntry;

    /// Body of the soft-timer thread on this port: loops over
    /// `Kernel::soft_timer_wait` and `Kernel::soft_timer_check`.
    const TIMER_ENTRY: ThreadEntry;

    /// Lay out the initial register frame of a new thread at the top of
    /// `stack` and return the initial stack pointer. The frame must make the
    /// thread start in `entry(parameter)` and leave through the port's exit
    /// path when `entry` returns.
    fn stack_init(&mut self, entry: ThreadEntry, parameter: usize, stack: &mut [u8]) -> usize;

    /// Switch from the current thread to another, from thread context.
    ///
    /// # Safety
    /// `from` and `to` must point at stack pointer cells that stay valid
    /// until the switch has completed.
    unsafe fn context_switch(&mut self, from: *mut usize, to: *const usize);

    /// Request a switch from interrupt context. The switch happens when the
    /// outermost interrupt returns; repeated requests before that keep the
    /// first `from` and the last `to`.
    ///
    /// # Safety
    /// Same as [`context_switch`](Self::context_switch).
    unsafe fn context_switch_interrupt(&mut self, from: *mut usize, to: *const usize);

    /// Launch the first thread. No context is saved.
    ///
    /// # Safety
    /// `to` must point at a valid stack pointer cell of an initialized
    /// thread.
    unsafe fn context_switch_to(&mut self, to: *const usize);
}
