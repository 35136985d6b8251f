//! Interrupt nesting.
//!
//! Interrupt handlers that call into the kernel bracket their body with
//! [`Kernel::interrupt_enter`] and [`Kernel::interrupt_leave`]. While the
//! nest is non-zero, `schedule()` only *requests* a switch; the port performs
//! it when the outermost handler returns.

use crate::arch::Port;
use crate::kernel::Kernel;
use crate::sync;

impl<P: Port> Kernel<P> {
    pub fn interrupt_enter(&mut self) {
        sync::masked(|| self.interrupt_nest += 1);
        log::trace!("irq enter, nest: {}", self.interrupt_nest);
    }

    pub fn interrupt_leave(&mut self) {
        assert!(self.interrupt_nest > 0, "interrupt_leave without interrupt_enter");
        log::trace!("irq leave, nest: {}", self.interrupt_nest);
        sync::masked(|| self.interrupt_nest -= 1);
    }

    /// Current interrupt nesting depth; 0 in thread context.
    #[inline]
    pub fn interrupt_nest(&self) -> u8 {
        self.interrupt_nest
    }
}
