//! # rtcore Demo Firmware
//!
//! Three threads on top of the two kernel threads:
//!
//! | Thread   | Stack  | Priority | Behavior |
//! |----------|--------|----------|----------|
//! | `worker` | static | 8        | Sleeps 100 ms, counts a round |
//! | `burst`  | heap   | 12       | Counts ten rounds of 50 ms, then returns |
//! | `timer`  | static | 4        | Runs the periodic soft `blink` timer (250 ms) |
//! | `tidle`  | static | 31       | Reclaims `burst` once it has returned |
//!
//! On the Cortex-M4 target the threads run for real. On a host the same
//! setup runs over the simulation port: the loop below plays the tick
//! interrupt and stands in for whatever thread the scheduler picked.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use core::sync::atomic::{AtomicU32, Ordering};

use rtcore::arch::Port;
use rtcore::{Kernel, TimerFlags};

static BLINKS: AtomicU32 = AtomicU32::new(0);
static WORKER_ROUNDS: AtomicU32 = AtomicU32::new(0);
static BURST_ROUNDS: AtomicU32 = AtomicU32::new(0);

const BURST_LIMIT: u32 = 10;

/// Periodic soft timer action.
fn blink<P: Port>(_: &mut Kernel<P>, _: usize) {
    BLINKS.fetch_add(1, Ordering::Relaxed);
}

/// Create the demo objects on a freshly built kernel.
fn setup<P: Port>(
    k: &mut Kernel<P>,
    worker_entry: rtcore::arch::ThreadEntry,
    burst_entry: rtcore::arch::ThreadEntry,
    worker_stack: &'static mut [u8],
) -> rtcore::KernelResult<()> {
    let timer = k.timer_create(
        "blink",
        blink::<P>,
        0,
        rtcore::clock::tick_from_millisecond(250),
        TimerFlags::PERIODIC | TimerFlags::SOFT_TIMER,
    )?;
    k.timer_start(timer)?;

    let worker = k.thread_init("worker", worker_entry, 0, worker_stack, 8, 10)?;
    k.thread_startup(worker);
    let burst = k.thread_create("burst", burst_entry, 0, 1024, 12, 5)?;
    k.thread_startup(burst);
    Ok(())
}

// ---------------------------------------------------------------------------
// Cortex-M4 firmware
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::ptr::addr_of_mut;
    use core::sync::atomic::Ordering;

    use cortex_m_rt::entry;
    use panic_halt as _;

    use rtcore::arch::cortex_m4::CortexM4;
    use rtcore::config::{IDLE_STACK_SIZE, TIMER_THREAD_STACK_SIZE};
    use rtcore::kernel::{self, with_kernel};
    use rtcore::{BootMemory, Kernel};

    use super::{setup, BURST_LIMIT, BURST_ROUNDS, WORKER_ROUNDS};

    static mut HEAP: [u8; 8 * 1024] = [0; 8 * 1024];
    static mut IDLE_STACK: [u8; IDLE_STACK_SIZE] = [0; IDLE_STACK_SIZE];
    static mut TIMER_STACK: [u8; TIMER_THREAD_STACK_SIZE] = [0; TIMER_THREAD_STACK_SIZE];
    static mut WORKER_STACK: [u8; 1024] = [0; 1024];

    /// **Worker** (priority 8): sleeps, then counts a round. Never returns.
    extern "C" fn worker(_: usize) {
        loop {
            let _ = with_kernel(|k| k.thread_mdelay(100));
            WORKER_ROUNDS.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// **Burst** (priority 12): a few rounds, then returns. The exit path
    /// closes it and the idle thread frees its heap stack.
    extern "C" fn burst(_: usize) {
        while BURST_ROUNDS.load(Ordering::Relaxed) < BURST_LIMIT {
            let _ = with_kernel(|k| k.thread_mdelay(50));
            BURST_ROUNDS.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[entry]
    fn main() -> ! {
        let cp = cortex_m::Peripherals::take().expect("core peripherals taken twice");

        // SAFETY: `main` runs once; each buffer is handed out exactly once.
        let boot = unsafe {
            BootMemory {
                heap: Some(&mut *addr_of_mut!(HEAP)),
                idle_stack: &mut *addr_of_mut!(IDLE_STACK),
                timer_stack: &mut *addr_of_mut!(TIMER_STACK),
            }
        };
        let worker_stack = unsafe { &mut *addr_of_mut!(WORKER_STACK) };

        let k = Kernel::new(CortexM4::new(cp.SYST), boot).expect("kernel boot failed");
        kernel::install(k);
        with_kernel(|k| setup(k, worker, burst, worker_stack)).expect("demo setup failed");

        // The first thread is entered when the start's masked region ends.
        with_kernel(|k| k.scheduler_start());
        loop {
            cortex_m::asm::wfi();
        }
    }
}

// ---------------------------------------------------------------------------
// Hosted simulation
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "none"))]
fn main() {
    use rtcore::arch::sim::SimPort;
    use rtcore::config::{IDLE_STACK_SIZE, TIMER_THREAD_STACK_SIZE};
    use rtcore::BootMemory;

    extern "C" fn parked(_: usize) {}

    fn leak(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    let boot = BootMemory {
        heap: Some(leak(8 * 1024)),
        idle_stack: leak(IDLE_STACK_SIZE),
        timer_stack: leak(TIMER_THREAD_STACK_SIZE),
    };
    let mut k = match Kernel::new(SimPort::new(), boot) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("kernel boot failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = setup(&mut k, parked, parked, leak(1024)) {
        eprintln!("demo setup failed: {}", e);
        std::process::exit(1);
    }
    let worker = k.thread_find("worker");
    let burst = k.thread_find("burst");
    k.scheduler_start();

    for _ in 0..2000 {
        k.interrupt_enter();
        k.tick_increase();
        k.interrupt_leave();

        // One step of the thread the scheduler picked.
        let current = k.thread_self();
        if current == k.timer_thread() {
            k.soft_timer_check();
            k.soft_timer_wait();
        } else if current == worker {
            WORKER_ROUNDS.fetch_add(1, Ordering::Relaxed);
            let _ = k.thread_mdelay(100);
        } else if current == burst {
            if BURST_ROUNDS.load(Ordering::Relaxed) < BURST_LIMIT {
                BURST_ROUNDS.fetch_add(1, Ordering::Relaxed);
                let _ = k.thread_mdelay(50);
            } else {
                k.thread_exit();
            }
        } else if current == k.idle_thread() {
            k.idle_step();
        }
    }

    let heap = k.heap_info();
    println!("ticks:          {}", k.tick_get());
    println!("blinks:         {}", BLINKS.load(Ordering::Relaxed));
    println!("worker rounds:  {}", WORKER_ROUNDS.load(Ordering::Relaxed));
    println!("burst rounds:   {}", BURST_ROUNDS.load(Ordering::Relaxed));
    println!("switches:       {}", k.port().total_switches());
    println!("burst reclaimed: {}", k.thread_find("burst").is_none());
    if let Some(info) = heap {
        println!("heap:           {} / {} bytes (max {})", info.used, info.total, info.max_used);
    }
}
