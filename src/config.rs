//! # Kernel Configuration
//!
//! Compile-time constants governing the scheduler, timers and allocator.
//! All limits are fixed at compile time; kernel objects live in fixed-size
//! tables and only thread stacks may come from the system heap.

/// Number of priority levels. Priority `0` is the most urgent, priority
/// `PRIO_MAX - 1` is reserved for the idle thread. Bounded by the width of
/// the ready bitmap (`u32`).
pub const PRIO_MAX: usize = 32;

/// Maximum number of thread objects (including the idle and timer threads).
pub const MAX_THREADS: usize = 16;

/// Maximum number of timer objects. Every thread consumes one slot for its
/// embedded sleep timer, so this must be at least `MAX_THREADS`.
pub const MAX_TIMERS: usize = 32;

/// Maximum length of an object name in bytes. Longer names are truncated.
pub const NAME_MAX: usize = 8;

/// Tick interrupt frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Largest value of the tick counter; the counter wraps to zero after it.
pub const TICK_MAX: u32 = u32::MAX;

/// Number of skip-list levels used by both timer lists. Level
/// `TIMER_SKIP_LIST_LEVEL - 1` holds every active timer.
pub const TIMER_SKIP_LIST_LEVEL: usize = 3;

/// One out of `TIMER_SKIP_LIST_MASK + 1` insertions climbs one level.
/// Must be `1` or `3`.
pub const TIMER_SKIP_LIST_MASK: u32 = 0x3;

/// Priority of the soft-timer worker thread.
pub const TIMER_THREAD_PRIO: u8 = 4;

/// Stack size of the soft-timer worker thread in bytes.
pub const TIMER_THREAD_STACK_SIZE: usize = 512;

/// Time slice of the soft-timer worker thread in ticks.
pub const TIMER_THREAD_TICK: u32 = 10;

/// Stack size of the idle thread in bytes.
pub const IDLE_STACK_SIZE: usize = 256;

/// Time slice of the idle thread in ticks.
pub const IDLE_THREAD_TICK: u32 = 32;

/// Number of idle hook slots.
pub const IDLE_HOOK_LIST_SIZE: usize = 4;

/// Allocator alignment in bytes. Matches the AAPCS stack alignment.
pub const ALIGN_SIZE: usize = 8;

/// Smallest payload handed out by the small-block allocator.
pub const MIN_BLOCK_SIZE: usize = 12;

/// Byte pattern written over a fresh thread stack; used to measure the
/// stack high-water mark.
pub const STACK_FILL: u8 = b'#';

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round `size` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}
