//! Heartbeat consumer monitoring.
//!
//! Each dictionary sub-entry of 0x1016 owns one consumer slot. Active
//! slots are threaded into a singly linked list over slot indices; a
//! slot is active exactly when it is a member of that chain.

use crate::hal::CoError;
use crate::nmt::NmtMode;
use crate::timer::{TimerAction, TmrHandle, TmrUnit, Timer};
use alloc::vec::Vec;

/// One heartbeat consumer slot.
#[derive(Debug, Clone, Copy)]
pub struct HbCons {
    /// Monitored producer node-id (0 is allowed for the master).
    pub node_id: u8,
    /// Expected heartbeat period in milliseconds; zero disables.
    pub time: u16,
    /// Missed-window counter, saturating at 0xFF.
    pub event: u8,
    /// Last received NMT state of the monitored node.
    pub state: NmtMode,
    /// Running monitor timeout, armed after the first heartbeat.
    pub tmr: Option<TmrHandle>,
    /// Next active slot in the chain.
    pub next: Option<u8>,
}

impl HbCons {
    fn new() -> Self {
        Self {
            node_id: 0,
            time: 0,
            event: 0,
            state: NmtMode::Invalid,
            tmr: None,
            next: None,
        }
    }
}

/// Bounded pool of consumer slots plus the active chain head.
#[derive(Debug, Default)]
pub struct HbConsPool {
    pub(crate) slots: Vec<HbCons>,
    pub(crate) head: Option<u8>,
}

impl HbConsPool {
    pub fn new(count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize(count, HbCons::new());
        Self { slots, head: None }
    }

    /// Walks the active chain for the slot monitoring `node_id`.
    pub fn find_active(&self, node_id: u8) -> Option<u8> {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let slot = &self.slots[idx as usize];
            if slot.node_id == node_id {
                return Some(idx);
            }
            cur = slot.next;
        }
        None
    }

    fn unlink(&mut self, idx: u8) {
        if self.head == Some(idx) {
            self.head = self.slots[idx as usize].next;
        } else {
            let mut cur = self.head;
            while let Some(p) = cur {
                if self.slots[p as usize].next == Some(idx) {
                    self.slots[p as usize].next = self.slots[idx as usize].next;
                    break;
                }
                cur = self.slots[p as usize].next;
            }
        }
        self.slots[idx as usize].next = None;
    }

    /// Activates, reconfigures or deactivates a consumer slot.
    ///
    /// A slot whose node-id is already monitored refuses a new non-zero
    /// time while active; writing time zero is the accepted disable
    /// path. Fresh activations are pushed to the chain front.
    pub fn activate(
        &mut self,
        tmr: &mut Timer,
        idx: u8,
        time: u16,
        node_id: u8,
    ) -> Result<(), CoError> {
        if idx as usize >= self.slots.len() {
            return Err(CoError::Cfg1016);
        }
        let active = self.find_active(node_id);
        if let Some(act) = active {
            if time > 0 {
                return Err(CoError::ObjIncompatible);
            }
            // disable the running monitor
            if let Some(handle) = self.slots[act as usize].tmr {
                tmr.delete(handle).map_err(|_| CoError::TmrDelete)?;
            }
            self.unlink(act);
            let slot = &mut self.slots[idx as usize];
            slot.time = time;
            slot.node_id = node_id;
            slot.tmr = None;
            slot.event = 0;
            slot.state = NmtMode::Invalid;
            slot.next = None;
        } else {
            let head = self.head;
            let slot = &mut self.slots[idx as usize];
            slot.time = time;
            slot.node_id = node_id;
            slot.tmr = None;
            slot.event = 0;
            slot.state = NmtMode::Invalid;
            if time > 0 {
                slot.next = head;
                self.head = Some(idx);
            } else {
                slot.next = None;
            }
        }
        Ok(())
    }

    /// Consumes a heartbeat frame of producer `node_id`: restarts the
    /// monitor window and records the received state. Returns the slot
    /// and the previous state when the frame was consumed.
    pub fn consume(
        &mut self,
        tmr: &mut Timer,
        node_id: u8,
        raw_state: u8,
    ) -> Option<(u8, NmtMode, NmtMode)> {
        let idx = self.find_active(node_id)?;
        let slot = &mut self.slots[idx as usize];
        if let Some(handle) = slot.tmr.take() {
            let _ = tmr.delete(handle);
        }
        let ticks = tmr.get_ticks(slot.time as u32, TmrUnit::Ms1);
        slot.tmr = tmr
            .create(ticks, 0, TimerAction::HbConsMonitor(idx))
            .ok();
        let old = slot.state;
        let state = NmtMode::decode(raw_state);
        slot.state = state;
        Some((idx, old, state))
    }

    /// Handles an elapsed monitor window: counts the event (saturating)
    /// and re-arms the timeout.
    pub fn monitor_elapsed(&mut self, tmr: &mut Timer, idx: u8) -> Result<u8, CoError> {
        let slot = &mut self.slots[idx as usize];
        let ticks = tmr.get_ticks(slot.time as u32, TmrUnit::Ms1);
        slot.tmr = Some(tmr.create(ticks, 0, TimerAction::HbConsMonitor(idx))?);
        if slot.event < 0xFF {
            slot.event += 1;
        }
        Ok(slot.node_id)
    }

    /// Returns and clears the event counter for a monitored node-id.
    pub fn events(&mut self, node_id: u8) -> Option<u8> {
        let idx = self.find_active(node_id)?;
        let slot = &mut self.slots[idx as usize];
        let events = slot.event;
        slot.event = 0;
        Some(events)
    }

    /// Last received NMT state of a monitored node-id.
    pub fn last_state(&self, node_id: u8) -> NmtMode {
        match self.find_active(node_id) {
            Some(idx) => self.slots[idx as usize].state,
            None => NmtMode::Invalid,
        }
    }

    /// Drops all monitors (communication reset path).
    pub fn clear(&mut self, tmr: &mut Timer) {
        for slot in self.slots.iter_mut() {
            if let Some(handle) = slot.tmr.take() {
                let _ = tmr.delete(handle);
            }
            *slot = HbCons::new();
        }
        self.head = None;
    }
}
