//! # Timers
//!
//! One-shot and periodic timers kept in two ordered skip lists: the *hard*
//! list, checked from the tick interrupt, and the *soft* list, checked by
//! the timer worker thread.
//!
//! ## Skip list
//!
//! Every timer carries one link per level. Level `L-1` holds all active
//! timers in expiry order; each level above holds roughly one in
//! `TIMER_SKIP_LIST_MASK + 1` of the timers of the level below, so an
//! insertion scans the sparse top level first and drops down.
//!
//! ```text
//! level 0   head ───────────────────────► T5 ──────────────► nil
//! level 1   head ─────────► T2 ─────────► T5 ──────────────► nil
//! level 2   head ─► T1 ──► T2 ──► T3 ──► T5 ──► T6 ──► T9 ─► nil
//!                  (ascending timeout_tick, ties in arming order)
//! ```
//!
//! Ticks wrap. `a` is at or before `b` when `b - a < TICK_MAX / 2`, which
//! is why no timer may be armed for half the tick range or more.
//!
//! ## Expiry
//!
//! A check pass pops expired timers from the head of level `L-1` one by
//! one and runs each action with interrupts unmasked. A periodic timer is
//! re-armed at its previous deadline plus its interval, unless its own
//! action restarted, stopped or destroyed it.

use bitflags::bitflags;

use crate::arch::Port;
use crate::clock::Tick;
use crate::config::{
    MAX_TIMERS, TICK_MAX, TIMER_SKIP_LIST_LEVEL, TIMER_SKIP_LIST_MASK, TIMER_THREAD_PRIO,
    TIMER_THREAD_TICK,
};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{Link, LinkStore, ListHead, NodeId};
use crate::object::{Handle, KernelObject, ObjectClass, ObjectHeader, Slab};
use crate::sync;
use crate::thread::{ThreadId, ThreadState};

const LEVELS: usize = TIMER_SKIP_LIST_LEVEL;
const HALF_RANGE: Tick = TICK_MAX / 2;

bitflags! {
    /// Timer mode and state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerFlags: u8 {
        /// Linked in a timer list.
        const ACTIVATED = 0x1;
        const PERIODIC = 0x2;
        /// Checked by the timer thread instead of the tick interrupt.
        const SOFT_TIMER = 0x4;
    }
}

impl TimerFlags {
    pub const ONE_SHOT: Self = Self::empty();
    pub const HARD_TIMER: Self = Self::empty();
}

/// Handle of a timer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) Handle);

/// User timer callback.
pub type TimerFn<P> = fn(&mut Kernel<P>, usize);

/// What a timer does when it expires.
pub enum Timeout<P: Port> {
    /// Time out a suspended thread (sleep, delay).
    Wake(ThreadId),
    Call { func: TimerFn<P>, parameter: usize },
}

impl<P: Port> Clone for Timeout<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Timeout<P> {}

/// Timer control command.
pub enum TimerCtrl<P: Port> {
    GetTime,
    SetTime(Tick),
    SetOneShot,
    SetPeriodic,
    /// Reply is `State(activated)`.
    GetState,
    /// Reply is the absolute expiry tick.
    GetRemainTime,
    GetFunc,
    SetFunc(TimerFn<P>),
    GetParm,
    SetParm(usize),
}

/// Reply to a [`TimerCtrl`] command.
pub enum TimerReply<P: Port> {
    Done,
    Time(Tick),
    State(bool),
    Func(TimerFn<P>),
    Parm(usize),
}

/// Timer object.
pub struct Timer<P: Port> {
    pub(crate) header: ObjectHeader,
    pub(crate) timeout: Timeout<P>,
    pub(crate) init_tick: Tick,
    pub(crate) timeout_tick: Tick,
    pub(crate) flags: TimerFlags,
    pub(crate) row: [Link; LEVELS],
    /// Set while the action runs from a check pass. Any unlink clears it,
    /// telling the pass the action re-armed or stopped the timer itself.
    pub(crate) firing: bool,
}

impl<P: Port> Timer<P> {
    pub fn flags(&self) -> TimerFlags {
        self.flags
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(TimerFlags::ACTIVATED)
    }

    pub fn init_tick(&self) -> Tick {
        self.init_tick
    }

    pub fn timeout_tick(&self) -> Tick {
        self.timeout_tick
    }
}

impl<P: Port> KernelObject for Timer<P> {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// One skip-list level of the timer table, as a link store.
pub(crate) struct Row<'a, P: Port> {
    timers: &'a mut Slab<Timer<P>, MAX_TIMERS>,
    level: usize,
}

impl<P: Port> LinkStore for Row<'_, P> {
    fn link(&self, node: NodeId) -> &Link {
        &self.timers.at(node).row[self.level]
    }

    fn link_mut(&mut self, node: NodeId) -> &mut Link {
        &mut self.timers.at_mut(node).row[self.level]
    }
}

impl<P: Port> Kernel<P> {
    // -----------------------------------------------------------------------
    // Object lifecycle
    // -----------------------------------------------------------------------

    pub(crate) fn timer_object_new(
        &mut self,
        name: &str,
        timeout: Timeout<P>,
        time: Tick,
        flags: TimerFlags,
        is_static: bool,
    ) -> KernelResult<TimerId> {
        let flags = flags - TimerFlags::ACTIVATED;
        let handle = self
            .timers
            .insert_with(|_| Timer {
                header: ObjectHeader::new(name, ObjectClass::Timer, is_static),
                timeout,
                init_tick: time,
                timeout_tick: 0,
                flags,
                row: [Link::new(); LEVELS],
                firing: false,
            })
            .ok_or(KernelError::Full)?;
        Ok(TimerId(handle))
    }

    /// Initialize a statically allocated timer.
    pub fn timer_init(
        &mut self,
        name: &str,
        func: TimerFn<P>,
        parameter: usize,
        time: Tick,
        flags: TimerFlags,
    ) -> KernelResult<TimerId> {
        self.timer_object_new(name, Timeout::Call { func, parameter }, time, flags, true)
    }

    /// Create a dynamically allocated timer.
    pub fn timer_create(
        &mut self,
        name: &str,
        func: TimerFn<P>,
        parameter: usize,
        time: Tick,
        flags: TimerFlags,
    ) -> KernelResult<TimerId> {
        self.timer_object_new(name, Timeout::Call { func, parameter }, time, flags, false)
    }

    /// Stop and unregister a static timer.
    pub fn timer_detach(&mut self, id: TimerId) {
        assert!(
            self.timers.get(id.0).header.is_system_object(),
            "timer_detach on a dynamic timer"
        );
        self.timer_destroy(id);
    }

    /// Stop and free a dynamic timer.
    pub fn timer_delete(&mut self, id: TimerId) {
        assert!(
            !self.timers.get(id.0).header.is_system_object(),
            "timer_delete on a static timer"
        );
        self.timer_destroy(id);
    }

    fn timer_destroy(&mut self, id: TimerId) {
        sync::masked(|| {
            self.timer_unlink(id);
            self.timers.remove(id.0);
        });
    }

    pub fn timer_get(&self, id: TimerId) -> &Timer<P> {
        self.timers.get(id.0)
    }

    pub fn timer_find(&self, name: &str) -> Option<TimerId> {
        self.timers.find(name).map(TimerId)
    }

    // -----------------------------------------------------------------------
    // Skip-list surgery
    // -----------------------------------------------------------------------

    /// Unlink from every level. Leaves the flags alone.
    fn timer_unlink(&mut self, id: TimerId) {
        let node = id.0.index();
        let timer = self.timers.get_mut(id.0);
        timer.firing = false;
        let lists = if timer.flags.contains(TimerFlags::SOFT_TIMER) {
            &mut self.soft_list
        } else {
            &mut self.hard_list
        };
        for (level, list) in lists.iter_mut().enumerate() {
            list.remove(
                &mut Row {
                    timers: &mut self.timers,
                    level,
                },
                node,
            );
        }
    }

    /// Link an unlinked timer by its current `timeout_tick`.
    fn timer_insert(&mut self, id: TimerId) {
        let node = id.0.index();
        let timer = self.timers.get(id.0);
        let timeout = timer.timeout_tick;
        let lists = if timer.flags.contains(TimerFlags::SOFT_TIMER) {
            &mut self.soft_list
        } else {
            &mut self.hard_list
        };
        let timers = &mut self.timers;

        // Last node not after the new timer, per level; None is the head.
        let mut row_head: [Option<NodeId>; LEVELS] = [None; LEVELS];
        for level in 0..LEVELS {
            let row = Row {
                timers: &mut *timers,
                level,
            };
            let mut pos = row_head[level];
            while let Some(next) = lists[level].next(&row, pos) {
                let t = row.timers.at(next).timeout_tick;
                if t != timeout && t.wrapping_sub(timeout) < HALF_RANGE {
                    break;
                }
                pos = Some(next);
            }
            row_head[level] = pos;
            // Continue one level down from the same node.
            if level + 1 < LEVELS {
                row_head[level + 1] = pos;
            }
        }

        self.random_nr = self.random_nr.wrapping_add(1);
        let mut tst_nr = self.random_nr;

        lists[LEVELS - 1].insert_after(
            &mut Row {
                timers: &mut *timers,
                level: LEVELS - 1,
            },
            row_head[LEVELS - 1],
            node,
        );
        for level in (0..LEVELS - 1).rev() {
            if tst_nr & TIMER_SKIP_LIST_MASK != 0 {
                break;
            }
            lists[level].insert_after(
                &mut Row {
                    timers: &mut *timers,
                    level,
                },
                row_head[level],
                node,
            );
            // Each level up needs the next bits of the counter clear too.
            tst_nr >>= (TIMER_SKIP_LIST_MASK + 1) >> 1;
        }
    }

    // -----------------------------------------------------------------------
    // Start / stop / control
    // -----------------------------------------------------------------------

    /// Arm a timer `init_tick` ticks from now, restarting it if active.
    pub fn timer_start(&mut self, id: TimerId) -> KernelResult<()> {
        let timer = self.timers.get(id.0);
        assert!(timer.init_tick < HALF_RANGE, "timer interval out of range");
        assert!(
            timer.init_tick > 0 || !timer.flags.contains(TimerFlags::PERIODIC),
            "periodic timer with a zero interval"
        );
        let soft = timer.flags.contains(TimerFlags::SOFT_TIMER);

        sync::masked(|| {
            self.timer_unlink(id);
            let now = self.tick;
            let timer = self.timers.get_mut(id.0);
            timer.flags.remove(TimerFlags::ACTIVATED);
            timer.timeout_tick = now.wrapping_add(timer.init_tick);
            self.timer_insert(id);
            self.timers.get_mut(id.0).flags.insert(TimerFlags::ACTIVATED);
        });
        log::trace!(
            "start timer {} until tick {}",
            self.timers.get(id.0).name(),
            self.timers.get(id.0).timeout_tick
        );

        if soft && !self.soft_timer_busy {
            if let Some(worker) = self.timer_thread {
                if self.threads.get(worker.0).state == ThreadState::Suspended {
                    // Wakes the worker whether it is parked or sleeping
                    // until a later deadline.
                    self.thread_resume(worker)?;
                    self.schedule();
                }
            }
        }
        Ok(())
    }

    /// Disarm a timer. Fails with `NotActive` if it is not armed.
    pub fn timer_stop(&mut self, id: TimerId) -> KernelResult<()> {
        if !self.timers.get(id.0).is_active() {
            return Err(KernelError::NotActive);
        }
        sync::masked(|| {
            self.timer_unlink(id);
            self.timers.get_mut(id.0).flags.remove(TimerFlags::ACTIVATED);
        });
        Ok(())
    }

    /// Query or change timer parameters. Changes take effect at the next
    /// start (or periodic re-arm).
    pub fn timer_control(&mut self, id: TimerId, cmd: TimerCtrl<P>) -> KernelResult<TimerReply<P>> {
        let timer = self.timers.get_mut(id.0);
        let reply = match cmd {
            TimerCtrl::GetTime => TimerReply::Time(timer.init_tick),
            TimerCtrl::SetTime(time) => {
                timer.init_tick = time;
                TimerReply::Done
            }
            TimerCtrl::SetOneShot => {
                timer.flags.remove(TimerFlags::PERIODIC);
                TimerReply::Done
            }
            TimerCtrl::SetPeriodic => {
                timer.flags.insert(TimerFlags::PERIODIC);
                TimerReply::Done
            }
            TimerCtrl::GetState => TimerReply::State(timer.is_active()),
            TimerCtrl::GetRemainTime => TimerReply::Time(timer.timeout_tick),
            TimerCtrl::GetFunc => match timer.timeout {
                Timeout::Call { func, .. } => TimerReply::Func(func),
                Timeout::Wake(_) => return Err(KernelError::Error),
            },
            TimerCtrl::SetFunc(new) => match &mut timer.timeout {
                Timeout::Call { func, .. } => {
                    *func = new;
                    TimerReply::Done
                }
                Timeout::Wake(_) => return Err(KernelError::Error),
            },
            TimerCtrl::GetParm => match timer.timeout {
                Timeout::Call { parameter, .. } => TimerReply::Parm(parameter),
                Timeout::Wake(_) => return Err(KernelError::Error),
            },
            TimerCtrl::SetParm(new) => match &mut timer.timeout {
                Timeout::Call { parameter, .. } => {
                    *parameter = new;
                    TimerReply::Done
                }
                Timeout::Wake(_) => return Err(KernelError::Error),
            },
        };
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    /// Earliest deadline of a list, `Err(Empty)` if nothing is armed.
    fn timer_list_next_timeout(&self, soft: bool) -> KernelResult<Tick> {
        let lists = if soft { &self.soft_list } else { &self.hard_list };
        sync::masked(|| {
            lists[LEVELS - 1]
                .front()
                .map(|n| self.timers.at(n).timeout_tick)
                .ok_or(KernelError::Empty)
        })
    }

    /// Earliest hard-timer deadline, or `TICK_MAX` when none is armed.
    pub fn timer_next_timeout_tick(&self) -> Tick {
        self.timer_list_next_timeout(false).unwrap_or(TICK_MAX)
    }

    /// Run every expired hard timer. Called from the tick interrupt.
    pub fn timer_check(&mut self) {
        log::trace!("timer check enter");
        self.timer_run_expired(false);
        log::trace!("timer check leave");
    }

    /// Run every expired soft timer. Called by the timer thread.
    pub fn soft_timer_check(&mut self) {
        log::trace!("software timer check enter");
        self.timer_run_expired(true);
        log::trace!("software timer check leave");
    }

    fn timer_run_expired(&mut self, soft: bool) {
        loop {
            let expired = sync::masked(|| {
                let lists = if soft { &self.soft_list } else { &self.hard_list };
                let head = lists[LEVELS - 1].front()?;
                let id = TimerId(self.timers.handle_at(head)?);
                let now = self.tick;
                if now.wrapping_sub(self.timers.get(id.0).timeout_tick) >= HALF_RANGE {
                    return None;
                }
                self.timer_unlink(id);
                let timer = self.timers.get_mut(id.0);
                if !timer.flags.contains(TimerFlags::PERIODIC) {
                    timer.flags.remove(TimerFlags::ACTIVATED);
                }
                timer.firing = true;
                let action = timer.timeout;
                if soft {
                    self.soft_timer_busy = true;
                }
                Some((id, action))
            });
            let Some((id, action)) = expired else {
                break;
            };

            self.timer_fire(action);

            sync::masked(|| {
                if soft {
                    self.soft_timer_busy = false;
                }
                // Gone if the action destroyed it.
                let Some(timer) = self.timers.try_get_mut(id.0) else {
                    return;
                };
                if !timer.firing {
                    return;
                }
                timer.firing = false;
                if timer.flags.contains(TimerFlags::PERIODIC | TimerFlags::ACTIVATED) {
                    timer.timeout_tick = timer.timeout_tick.wrapping_add(timer.init_tick);
                    self.timer_insert(id);
                } else {
                    // Unlinked and not re-armed, e.g. switched to one-shot
                    // by its own action.
                    timer.flags.remove(TimerFlags::ACTIVATED);
                }
            });
        }
    }

    fn timer_fire(&mut self, action: Timeout<P>) {
        match action {
            Timeout::Wake(tid) => self.thread_timeout(tid),
            Timeout::Call { func, parameter } => func(self, parameter),
        }
    }

    // -----------------------------------------------------------------------
    // Timer thread
    // -----------------------------------------------------------------------

    /// Create the soft-timer worker. It stays suspended until the first
    /// soft timer is started.
    pub(crate) fn timer_thread_init(&mut self, stack: &'static mut [u8]) -> KernelResult<ThreadId> {
        let tid = self.thread_init(
            "timer",
            P::TIMER_ENTRY,
            0,
            stack,
            TIMER_THREAD_PRIO,
            TIMER_THREAD_TICK,
        )?;
        self.thread_prepare(tid);
        self.timer_thread = Some(tid);
        Ok(tid)
    }

    pub fn timer_thread(&self) -> Option<ThreadId> {
        self.timer_thread
    }

    /// Wait half of the worker loop: park until a soft timer is started, or
    /// sleep until the earliest soft deadline. Must run on the timer thread.
    pub fn soft_timer_wait(&mut self) {
        let me = match self.current {
            Some(t) if Some(t) == self.timer_thread => t,
            _ => panic!("soft_timer_wait outside the timer thread"),
        };
        match self.timer_list_next_timeout(true) {
            Err(_) => {
                if self.thread_suspend(me).is_ok() {
                    self.schedule();
                }
            }
            Ok(next) => {
                let left = next.wrapping_sub(self.tick);
                if left != 0 && left < HALF_RANGE {
                    let slept = self.thread_delay(left);
                    debug_assert!(slept.is_ok(), "timer thread not running");
                }
            }
        }
    }
}
