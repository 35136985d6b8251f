//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, the SysTick tick source, and
//! the initial thread stack frame.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by `main` before the scheduler
//!   starts and by every interrupt handler
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! Every switch is deferred: the kernel stores the `from`/`to` stack
//! pointer cells and pends PendSV. On exception entry the hardware stacks
//! R0–R3, R12, LR, PC and xPSR onto the process stack; the PendSV handler
//! saves R4–R11 below them, stores PSP into the `from` cell, then reloads
//! R4–R11 and PSP from the `to` cell.
//!
//! ```text
//!  kernel (masked)                    PendSV (lowest priority)
//!  ───────────────                    ────────────────────────
//!  SWITCH_FROM = &from.sp   ──────►   if FLAG: FLAG = 0
//!  SWITCH_TO   = &to.sp                 if FROM: push r4-r11, *FROM = psp
//!  FLAG = 1, pend PendSV                psp = *TO, pop r4-r11
//!                                     bx EXC_RETURN (thread mode, PSP)
//! ```
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest), can be preempted
//! - PendSV: Priority 0xFF (lowest), runs only when no other ISR is active
//!
//! Threads are assumed not to use the FPU (`thumbv7em-none-eabi`); the
//! handler does not save the extended frame.

use core::arch::global_asm;

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;
use cortex_m_rt::exception;

use super::{Port, ThreadEntry};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

// ---------------------------------------------------------------------------
// Switch request cells (shared with the PendSV handler)
// ---------------------------------------------------------------------------

/// Address of the outgoing thread's `sp` cell, 0 for the first switch.
#[no_mangle]
static mut RTCORE_SWITCH_FROM: usize = 0;

/// Address of the incoming thread's `sp` cell.
#[no_mangle]
static mut RTCORE_SWITCH_TO: usize = 0;

/// Set while a switch is pending.
#[no_mangle]
static mut RTCORE_SWITCH_FLAG: u32 = 0;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Cortex-M4 port. Owns the SysTick peripheral, which is started together
/// with the first thread.
pub struct CortexM4 {
    syst: SYST,
}

impl CortexM4 {
    pub fn new(syst: SYST) -> Self {
        Self { syst }
    }

    /// Configure SysTick to fire at `TICK_HZ` from the core clock.
    fn configure_systick(&mut self) {
        let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
        self.syst.set_reload(reload);
        self.syst.clear_current();
        self.syst.set_clock_source(SystClkSource::Core);
        self.syst.enable_counter();
        self.syst.enable_interrupt();
    }
}

/// Trigger a PendSV exception.
///
/// Sets the PENDSVSET bit in the Interrupt Control and State Register (ICSR).
#[inline]
fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

/// Set PendSV and SysTick to the lowest interrupt priority.
fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        core::ptr::write_volatile(shpr3, val | (0xFF << 16) | (0xFF << 24));
    }
}

impl Port for CortexM4 {
    const IDLE_ENTRY: ThreadEntry = idle_thread_entry;
    const TIMER_ENTRY: ThreadEntry = timer_thread_entry;

    /// Initial frame (top = high address, growing down):
    ///
    /// ```text
    /// [Hardware stacked frame]
    ///   xPSR  (Thumb bit set)
    ///   PC    (thread entry)
    ///   LR    (exit trampoline)
    ///   R12, R3, R2, R1 (0)
    ///   R0    (parameter)
    /// [Software saved context]
    ///   R11 .. R4 (0)          <- returned stack pointer
    /// ```
    fn stack_init(&mut self, entry: ThreadEntry, parameter: usize, stack: &mut [u8]) -> usize {
        let base = stack.as_mut_ptr() as usize;
        // AAPCS: 8-byte aligned stack
        let top = (base + stack.len()) & !0x07;
        let frame = (top - 16 * 4) as *mut u32;
        assert!(frame as usize >= base, "stack too small for the initial frame");

        unsafe {
            for i in 0..8 {
                *frame.add(i) = 0; // R4..R11
            }
            *frame.add(8) = parameter as u32; // R0
            *frame.add(9) = 0; // R1
            *frame.add(10) = 0; // R2
            *frame.add(11) = 0; // R3
            *frame.add(12) = 0; // R12
            *frame.add(13) = thread_exit_trampoline as usize as u32; // LR
            *frame.add(14) = entry as usize as u32; // PC
            *frame.add(15) = 0x0100_0000; // xPSR
        }
        frame as usize
    }

    unsafe fn context_switch(&mut self, from: *mut usize, to: *const usize) {
        self.context_switch_interrupt(from, to);
    }

    unsafe fn context_switch_interrupt(&mut self, from: *mut usize, to: *const usize) {
        if RTCORE_SWITCH_FLAG == 0 {
            RTCORE_SWITCH_FLAG = 1;
            RTCORE_SWITCH_FROM = from as usize;
        }
        RTCORE_SWITCH_TO = to as usize;
        trigger_pendsv();
    }

    unsafe fn context_switch_to(&mut self, to: *const usize) {
        RTCORE_SWITCH_FROM = 0;
        RTCORE_SWITCH_TO = to as usize;
        RTCORE_SWITCH_FLAG = 1;
        set_interrupt_priorities();
        self.configure_systick();
        // Taken as soon as the caller unmasks interrupts.
        trigger_pendsv();
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r2, primask",
    "    cpsid i",
    "    ldr r0, =RTCORE_SWITCH_FLAG",
    "    ldr r1, [r0]",
    "    cbz r1, 2f",
    "    movs r1, #0",
    "    str r1, [r0]",
    // skip the save on the very first switch
    "    ldr r0, =RTCORE_SWITCH_FROM",
    "    ldr r0, [r0]",
    "    cbz r0, 1f",
    "    mrs r1, psp",
    "    stmdb r1!, {{r4-r11}}",
    "    str r1, [r0]",
    "1:",
    "    ldr r1, =RTCORE_SWITCH_TO",
    "    ldr r1, [r1]",
    "    ldr r1, [r1]",
    "    ldmia r1!, {{r4-r11}}",
    "    msr psp, r1",
    "2:",
    "    msr primask, r2",
    // return to thread mode on PSP
    "    orr lr, lr, #0x04",
    "    bx lr",
    ".size PendSV, . - PendSV",
);

/// Tick interrupt: advance the kernel clock inside an interrupt nest.
#[exception]
fn SysTick() {
    crate::kernel::with_kernel(|k| {
        k.interrupt_enter();
        k.tick_increase();
        k.interrupt_leave();
    });
}

extern "C" fn idle_thread_entry(_: usize) {
    loop {
        crate::kernel::with_kernel(|k| k.idle_step());
    }
}

/// A park or sleep in the wait half switches away before the check half
/// runs. Soft timer actions run with interrupts unmasked.
extern "C" fn timer_thread_entry(_: usize) {
    loop {
        crate::kernel::with_kernel(|k| k.soft_timer_wait());
        crate::kernel::with_kernel(|k| k.soft_timer_check());
    }
}

/// Return address of every thread entry: a thread whose entry returns is
/// closed and never scheduled again.
extern "C" fn thread_exit_trampoline() -> ! {
    crate::kernel::with_kernel(|k| k.thread_exit());
    loop {
        cortex_m::asm::wfi();
    }
}
