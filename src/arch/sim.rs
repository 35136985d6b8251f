//! Hosted simulation port.
//!
//! No code ever runs on the simulated stacks. The port lays out a frame the
//! same size as the Cortex-M4 one (so stack usage measurements behave alike) and
//! records every switch request for inspection.

use super::{Port, ThreadEntry};

/// Words in the initial frame: 8 software-saved plus 8 hardware-stacked
/// registers.
const FRAME_WORDS: usize = 16;

/// Simulation port recording switch requests.
#[derive(Debug, Default)]
pub struct SimPort {
    /// Thread-context switches requested.
    pub switches: usize,
    /// Interrupt-context switches requested.
    pub interrupt_switches: usize,
    /// Last `(from, to)` cell pair handed to either switch call.
    pub last_switch: Option<(usize, usize)>,
    /// Cell handed to `context_switch_to`, once the scheduler started.
    pub started: Option<usize>,
    /// Frames laid out by `stack_init`.
    pub frames: usize,
}

impl SimPort {
    pub const fn new() -> Self {
        Self {
            switches: 0,
            interrupt_switches: 0,
            last_switch: None,
            started: None,
            frames: 0,
        }
    }

    /// Total switch requests of either kind.
    pub fn total_switches(&self) -> usize {
        self.switches + self.interrupt_switches
    }
}

/// Kernel threads never run in the simulation; tests drive `idle_step`
/// and the timer worker halves directly.
extern "C" fn parked(_: usize) {}

impl Port for SimPort {
    const IDLE_ENTRY: ThreadEntry = parked;
    const TIMER_ENTRY: ThreadEntry = parked;

    fn stack_init(&mut self, entry: ThreadEntry, parameter: usize, stack: &mut [u8]) -> usize {
        let word = core::mem::size_of::<usize>();
        let base = stack.as_ptr() as usize;
        let top = (base + stack.len()) & !0x07;
        let sp = top - FRAME_WORDS * word;
        assert!(sp >= base, "stack too small for the initial frame");

        let frame = &mut stack[sp - base..top - base];
        frame.fill(0);
        // r0 and pc slots, in the Cortex-M4 frame order.
        frame[8 * word..9 * word].copy_from_slice(&parameter.to_ne_bytes());
        frame[14 * word..15 * word].copy_from_slice(&(entry as usize).to_ne_bytes());
        self.frames += 1;
        sp
    }

    unsafe fn context_switch(&mut self, from: *mut usize, to: *const usize) {
        self.switches += 1;
        self.last_switch = Some((from as usize, to as usize));
    }

    unsafe fn context_switch_interrupt(&mut self, from: *mut usize, to: *const usize) {
        self.interrupt_switches += 1;
        self.last_switch = Some((from as usize, to as usize));
    }

    unsafe fn context_switch_to(&mut self, to: *const usize) {
        self.started = Some(to as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn entry(_: usize) {}

    #[test]
    fn test_stack_init_places_frame_at_aligned_top() {
        let mut port = SimPort::new();
        let mut stack = [0xAAu8; 256];
        let base = stack.as_ptr() as usize;
        let sp = port.stack_init(entry, 0x1234, &mut stack);
        let word = core::mem::size_of::<usize>();
        assert_eq!(sp % 8, 0);
        assert!(sp >= base && sp + FRAME_WORDS * word <= base + 256);
        let r0 = &stack[sp - base + 8 * word..sp - base + 9 * word];
        assert_eq!(usize::from_ne_bytes(r0.try_into().unwrap()), 0x1234);
        // Bytes below the frame are untouched.
        assert_eq!(stack[0], 0xAA);
        assert_eq!(port.frames, 1);
    }

    #[test]
    fn test_switch_requests_are_recorded() {
        let mut port = SimPort::new();
        let mut a = 0usize;
        let b = 0usize;
        unsafe {
            port.context_switch(&mut a, &b);
            port.context_switch_interrupt(&mut a, &b);
        }
        assert_eq!(port.switches, 1);
        assert_eq!(port.interrupt_switches, 1);
        assert_eq!(port.total_switches(), 2);
        assert_eq!(
            port.last_switch,
            Some((&mut a as *mut usize as usize, &b as *const usize as usize))
        );
    }
}
