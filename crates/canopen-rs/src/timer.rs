//! Tick-driven timer service.
//!
//! A single delta-list scheduler feeds every time-driven behavior of the
//! node (heartbeat production and monitoring, PDO inhibit/event timers,
//! SYNC production, SDO client timeouts and application timers). Actions
//! are kept in a bounded pool; each live action stores the tick delta to
//! its predecessor, so advancing time only decrements the list head.
//! Actions sharing a deadline fire in insertion order.

use crate::hal::CoError;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// User time units accepted by [`Timer::get_ticks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmrUnit {
    /// One millisecond.
    Ms1,
    /// One hundred microseconds.
    Us100,
    /// One microsecond.
    Us1,
}

impl TmrUnit {
    /// Number of units per second.
    fn per_second(&self) -> u64 {
        match self {
            TmrUnit::Ms1 => 1_000,
            TmrUnit::Us100 => 10_000,
            TmrUnit::Us1 => 1_000_000,
        }
    }
}

/// The deferred work a timer action stands for.
///
/// The scheduler itself never calls back into the services; it hands
/// the due actions to the node which dispatches them. This keeps the
/// pool free of interior references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Emit one heartbeat frame.
    HbProduce,
    /// A heartbeat consumer slot missed its window.
    HbConsMonitor(u8),
    /// The event timer of a transmit PDO elapsed.
    TpdoEvent(u8),
    /// The inhibit window of a transmit PDO elapsed.
    TpdoInhibit(u8),
    /// Emit one SYNC frame.
    SyncPeriod,
    /// An SDO client transfer ran into its timeout.
    CsdoTimeout(u8),
    /// An application timer elapsed.
    App(u16),
}

/// Handle referencing a live timer action.
pub type TmrHandle = u16;

const NIL: u16 = u16::MAX;

#[derive(Debug, Clone, Copy)]
struct Action {
    live: bool,
    delta: u32,
    period: u32,
    event: TimerAction,
    next: u16,
}

const FREE: Action = Action {
    live: false,
    delta: 0,
    period: 0,
    event: TimerAction::HbProduce,
    next: NIL,
};

/// The delta-list scheduler over a bounded action pool.
pub struct Timer {
    freq: u32,
    pool: Vec<Action>,
    head: u16,
    due: VecDeque<TimerAction>,
}

impl Timer {
    /// Creates a scheduler driven with `freq` ticks per second and room
    /// for `max` concurrent actions.
    pub fn new(freq: u32, max: usize) -> Self {
        let mut pool = Vec::with_capacity(max);
        pool.resize(max, FREE);
        Self {
            freq,
            pool,
            head: NIL,
            due: VecDeque::with_capacity(max),
        }
    }

    /// Number of action slots in the pool.
    pub fn max(&self) -> usize {
        self.pool.len()
    }

    /// Converts a user time into internal ticks, truncating toward zero.
    pub fn get_ticks(&self, time: u32, unit: TmrUnit) -> u32 {
        ((time as u64 * self.freq as u64) / unit.per_second()) as u32
    }

    /// Smallest user time (in the given unit) representable as at least
    /// one tick.
    pub fn get_min_time(&self, unit: TmrUnit) -> u32 {
        let div = unit.per_second();
        div.div_ceil(self.freq as u64) as u32
    }

    /// Schedules an action. `start` is the delay in ticks until the
    /// first firing; when zero, a periodic action first fires after its
    /// `period`. A zero `period` makes the action one-shot.
    pub fn create(
        &mut self,
        start: u32,
        period: u32,
        event: TimerAction,
    ) -> Result<TmrHandle, CoError> {
        let ticks = if start > 0 { start } else { period };
        if ticks == 0 {
            return Err(CoError::TmrCreate);
        }
        let idx = self
            .pool
            .iter()
            .position(|a| !a.live)
            .ok_or(CoError::TmrNoAct)? as u16;
        self.pool[idx as usize] = Action {
            live: true,
            delta: 0,
            period,
            event,
            next: NIL,
        };
        self.insert(idx, ticks);
        Ok(idx)
    }

    /// Removes a live action from the schedule.
    pub fn delete(&mut self, handle: TmrHandle) -> Result<(), CoError> {
        let idx = handle as usize;
        if idx >= self.pool.len() || !self.pool[idx].live {
            return Err(CoError::TmrDelete);
        }
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            if cur == handle {
                let next = self.pool[idx].next;
                if next != NIL {
                    // keep successor deadlines unchanged
                    self.pool[next as usize].delta += self.pool[idx].delta;
                }
                if prev == NIL {
                    self.head = next;
                } else {
                    self.pool[prev as usize].next = next;
                }
                self.pool[idx] = FREE;
                return Ok(());
            }
            prev = cur;
            cur = self.pool[cur as usize].next;
        }
        Err(CoError::TmrDelete)
    }

    /// Drops every action and reinitializes the pool.
    pub fn reset(&mut self) {
        for a in self.pool.iter_mut() {
            *a = FREE;
        }
        self.head = NIL;
        self.due.clear();
    }

    /// Advances the schedule by one tick. Every due action is moved to
    /// the internal queue (drained with [`Timer::pop_due`]); periodic
    /// actions are rescheduled with their period.
    pub fn update(&mut self) {
        if self.head == NIL {
            return;
        }
        let head = self.head as usize;
        self.pool[head].delta = self.pool[head].delta.saturating_sub(1);
        while self.head != NIL && self.pool[self.head as usize].delta == 0 {
            let idx = self.head;
            let action = self.pool[idx as usize];
            self.head = action.next;
            self.pool[idx as usize] = FREE;
            self.due.push_back(action.event);
            if action.period > 0 {
                // reuse the slot for the next cycle
                self.pool[idx as usize] = Action {
                    live: true,
                    delta: 0,
                    period: action.period,
                    event: action.event,
                    next: NIL,
                };
                self.insert(idx, action.period);
            }
        }
    }

    /// Pops the next due action, if any.
    pub fn pop_due(&mut self) -> Option<TimerAction> {
        self.due.pop_front()
    }

    fn insert(&mut self, idx: u16, mut ticks: u32) {
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            let cur_delta = self.pool[cur as usize].delta;
            if ticks < cur_delta {
                self.pool[cur as usize].delta = cur_delta - ticks;
                break;
            }
            ticks -= cur_delta;
            prev = cur;
            cur = self.pool[cur as usize].next;
        }
        self.pool[idx as usize].delta = ticks;
        self.pool[idx as usize].next = cur;
        if prev == NIL {
            self.head = idx;
        } else {
            self.pool[prev as usize].next = idx;
        }
    }
}
