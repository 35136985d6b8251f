//! # rtcore
//!
//! A small-footprint, single-core RTOS kernel core for ARM Cortex-M
//! microcontrollers, runnable on a host through a simulated port.
//!
//! ## Overview
//!
//! - **Preemptive priority scheduler**: 32 priorities, FIFO round robin
//!   among equals, O(1) selection through a ready bitmap
//! - **Timers**: one-shot and periodic, hard (tick interrupt) and soft
//!   (timer thread), kept in ordered skip lists, wrap-safe
//! - **Small-block allocator**: first fit over one arena with immediate
//!   coalescing, used for heap thread stacks
//! - **Thread lifecycle**: startup, suspend/resume, sleep, termination with
//!   deferred reclamation by the idle thread
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │            Kernel<P: Port> (kernel.rs)                  │
//! │    thread_* · timer_* · schedule · malloc · tick_*      │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Scheduler   │  Timers          │  Threads / Idle      │
//! │  scheduler.rs│  timer.rs        │  thread.rs, idle.rs  │
//! │  ─ bitmap    │  ─ skip lists    │  ─ lifecycle         │
//! │  ─ schedule()│  ─ check / soft  │  ─ defunct reaper    │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │  object.rs (handles, slabs) · list.rs · mem.rs · sync.rs│
//! ├────────────────────────────────────────────────────────┤
//! │   Port: arch/cortex_m4.rs (PendSV, SysTick) · arch/sim  │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2) / host         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Fixed tables**: threads and timers live in fixed-capacity slabs and
//!   are named by generation-checked handles
//! - **Index links**: every list (ready queue, timer levels, defunct list)
//!   links slab slots by index, O(1) insert and remove
//! - **Optional heap**: only thread stacks created with `thread_create`
//!   come from the system heap
//! - **Interrupt masking** is the only lock (`sync::masked`)

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod clock;
pub mod config;
pub mod error;
pub mod idle;
pub mod irq;
pub mod kernel;
pub mod list;
pub mod mem;
pub mod object;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod timer;

pub use error::{KernelError, KernelResult};
pub use kernel::{BootMemory, Kernel};
pub use thread::{ThreadCtrl, ThreadId, ThreadState};
pub use timer::{TimerCtrl, TimerFlags, TimerId};
