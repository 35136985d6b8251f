//! # Synchronization Primitives
//!
//! Interrupt masking is the only lock in the kernel. Every shared structure
//! (ready queue, timer lists, heap, defunct list) is touched exclusively
//! inside a masked region, and masked regions never block.
//!
//! The mask itself comes from the `critical-section` implementation linked
//! for the target: `cortex-m`'s single-core implementation (PRIMASK) on the
//! board, the process-wide `std` implementation on a host.

use critical_section::RestoreState;

/// Opaque restore token returned by [`interrupt_disable`].
///
/// Tokens must be handed back to [`interrupt_enable`] in reverse order of
/// acquisition.
#[must_use = "dropping the level leaves interrupts masked"]
pub struct IrqLevel(RestoreState);

/// Mask interrupts and return the previous state.
///
/// Nested calls are allowed; only the outermost [`interrupt_enable`]
/// unmasks.
#[inline]
pub fn interrupt_disable() -> IrqLevel {
    // SAFETY: the token is consumed by `interrupt_enable`, which restores in
    // LIFO order by construction of every call site.
    IrqLevel(unsafe { critical_section::acquire() })
}

/// Restore the interrupt state captured by [`interrupt_disable`].
#[inline]
pub fn interrupt_enable(level: IrqLevel) {
    // SAFETY: `level` came from the matching `interrupt_disable`.
    unsafe { critical_section::release(level.0) }
}

/// Execute a closure with interrupts masked.
///
/// This is the scoped form used for short list surgery. Keep the closure
/// short: interrupt latency is bounded by the longest masked region.
///
/// # Usage
/// ```ignore
/// sync::masked(|| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn masked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    critical_section::with(|_cs| f())
}
