//! System tick.
//!
//! The tick counter is owned by the kernel and advanced once per tick
//! interrupt. It wraps; every comparison between ticks goes through
//! wrapping subtraction against `TICK_MAX / 2`.

use crate::arch::Port;
use crate::config::TICK_HZ;
use crate::kernel::Kernel;
use crate::sync;

/// Tick counter value.
pub type Tick = u32;

/// Convert milliseconds to ticks, rounding up.
pub const fn tick_from_millisecond(ms: u32) -> Tick {
    TICK_HZ * (ms / 1000) + (TICK_HZ * (ms % 1000) + 999) / 1000
}

impl<P: Port> Kernel<P> {
    #[inline]
    pub fn tick_get(&self) -> Tick {
        self.tick
    }

    pub fn tick_set(&mut self, tick: Tick) {
        sync::masked(|| self.tick = tick);
    }

    /// Tick interrupt body.
    ///
    /// Advances the counter, charges the tick to the running thread's time
    /// slice (an exhausted slice is refilled and turned into a yield), then
    /// runs the hard timer check.
    pub fn tick_increase(&mut self) {
        let slice_done = sync::masked(|| {
            self.tick = self.tick.wrapping_add(1);
            let Some(current) = self.current else {
                return false;
            };
            let thread = self.threads.get_mut(current.0);
            thread.remaining_tick = thread.remaining_tick.saturating_sub(1);
            if thread.remaining_tick == 0 {
                thread.remaining_tick = thread.init_tick;
                thread.yield_pending = true;
                true
            } else {
                false
            }
        });
        if slice_done {
            self.schedule();
        }
        self.timer_check();
    }
}
