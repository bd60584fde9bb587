//! Emergency management: per-error state, the error register 0x1001 and
//! the pre-defined error field 0x1003 with its bounded history ring.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// One application error class: the bit it drives in the error register
/// and the emergency error code it transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyEntry {
    pub reg_bit: u8,
    pub code: u16,
}

/// Manufacturer-specific payload of an emergency message.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmcyUsr {
    /// Additional information stored in the history entry (upper 16
    /// bits of the 0x1003 value).
    pub hist: u16,
    /// The five manufacturer bytes of the EMCY frame.
    pub emcy: [u8; 5],
}

/// Emergency service state owned by the node.
#[derive(Debug, Default)]
pub struct Emcy {
    pub(crate) table: Vec<EmcyEntry>,
    pub(crate) active: Vec<bool>,
    pub(crate) hist: VecDeque<u32>,
    pub(crate) hist_cap: usize,
    pub(crate) cobid: u32,
}

impl Emcy {
    pub fn new(table: Vec<EmcyEntry>, hist_cap: usize) -> Self {
        let mut active = Vec::with_capacity(table.len());
        active.resize(table.len(), false);
        Self {
            table,
            active,
            hist: VecDeque::with_capacity(hist_cap),
            hist_cap,
            cobid: 0,
        }
    }

    /// True when the given error is currently set.
    pub fn get(&self, err: u8) -> bool {
        self.active.get(err as usize).copied().unwrap_or(false)
    }

    /// Number of distinct active errors.
    pub fn cnt(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    /// Error register value: the OR of the class bits of all active
    /// errors, plus the generic bit while any error is active.
    pub fn register(&self) -> u8 {
        let mut reg = 0u8;
        for (i, entry) in self.table.iter().enumerate() {
            if self.active[i] {
                reg |= 1 << entry.reg_bit;
                reg |= 0x01;
            }
        }
        reg
    }

    /// Records a history entry (newest at the front, bounded).
    pub(crate) fn push_history(&mut self, code: u16, hist: u16) {
        if self.hist_cap == 0 {
            return;
        }
        if self.hist.len() == self.hist_cap {
            self.hist.pop_back();
        }
        self.hist.push_front(((hist as u32) << 16) | code as u32);
    }

    /// Reads a history entry; sub-index 1 is the newest.
    pub fn history(&self, sub: u8) -> u32 {
        self.hist.get(sub as usize - 1).copied().unwrap_or(0)
    }

    /// Number of recorded history entries.
    pub fn history_len(&self) -> usize {
        self.hist.len()
    }

    /// Drops the history ring (write of zero to 0x1003:0).
    pub fn clear_history(&mut self) {
        self.hist.clear();
    }

    /// Drops all error states without emitting frames (reset path).
    pub(crate) fn clear_states(&mut self) {
        for a in self.active.iter_mut() {
            *a = false;
        }
    }
}

use crate::hal::{CanDriver, CanFrame, NodeEvents};
use crate::nmt::NmtMode;
use crate::node::Node;

const COBID_DISABLED: u32 = 1 << 31;

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// Registers an application error. The first registration emits an
    /// EMCY frame, updates the error register and records the error in
    /// the history ring; repetitions are silent.
    pub fn emcy_set(&mut self, err: u8, usr: Option<EmcyUsr>) {
        let idx = err as usize;
        if idx >= self.emcy.table.len() || self.emcy.active[idx] {
            return;
        }
        self.emcy.active[idx] = true;
        let entry = self.emcy.table[idx];
        let usr = usr.unwrap_or_default();
        self.emcy.push_history(entry.code, usr.hist);
        self.emcy_send(entry.code, usr.emcy);
    }

    /// Clears an application error, emitting an EMCY frame with error
    /// code zero and the updated register.
    pub fn emcy_clr(&mut self, err: u8) {
        let idx = err as usize;
        if idx >= self.emcy.table.len() || !self.emcy.active[idx] {
            return;
        }
        self.emcy.active[idx] = false;
        self.emcy_send(0, [0; 5]);
    }

    /// Clears every active error, emitting one EMCY frame per cleared
    /// error.
    pub fn emcy_reset(&mut self) {
        for idx in 0..self.emcy.active.len() {
            if self.emcy.active[idx] {
                self.emcy_clr(idx as u8);
            }
        }
    }

    /// True when the given error is currently registered.
    pub fn emcy_get(&self, err: u8) -> bool {
        self.emcy.get(err)
    }

    /// Number of distinct active errors.
    pub fn emcy_cnt(&self) -> usize {
        self.emcy.cnt()
    }

    fn emcy_send(&mut self, code: u16, usr: [u8; 5]) {
        match self.nmt.mode {
            NmtMode::PreOp | NmtMode::Op => {}
            _ => return,
        }
        if self.emcy.cobid & COBID_DISABLED != 0 {
            return;
        }
        let reg = self.emcy.register();
        let mut payload = [0u8; 8];
        payload[..2].copy_from_slice(&code.to_le_bytes());
        payload[2] = reg;
        payload[3..8].copy_from_slice(&usr);
        let frame = CanFrame::new(self.emcy.cobid & 0x7FF, &payload);
        self.send_frame(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn table() -> Vec<EmcyEntry> {
        vec![
            EmcyEntry { reg_bit: 0, code: 0x1000 },
            EmcyEntry { reg_bit: 1, code: 0x2000 },
            EmcyEntry { reg_bit: 2, code: 0x3000 },
            EmcyEntry { reg_bit: 3, code: 0x4000 },
        ]
    }

    #[test]
    fn test_register_composition() {
        let mut emcy = Emcy::new(table(), 4);
        emcy.active[1] = true;
        assert_eq!(emcy.register(), 0x03);
        emcy.active[2] = true;
        assert_eq!(emcy.register(), 0x07);
        emcy.active[1] = false;
        assert_eq!(emcy.register(), 0x05);
        emcy.active[2] = false;
        assert_eq!(emcy.register(), 0x00);
    }

    #[test]
    fn test_history_ring_newest_first() {
        let mut emcy = Emcy::new(table(), 2);
        emcy.push_history(0x2000, 0);
        emcy.push_history(0x3000, 0);
        assert_eq!(emcy.history(1), 0x3000);
        assert_eq!(emcy.history(2), 0x2000);
        // bounded: the oldest entry falls out
        emcy.push_history(0x4000, 0);
        assert_eq!(emcy.history_len(), 2);
        assert_eq!(emcy.history(1), 0x4000);
        assert_eq!(emcy.history(2), 0x3000);
    }

    #[test]
    fn test_count_active() {
        let mut emcy = Emcy::new(table(), 4);
        assert_eq!(emcy.cnt(), 0);
        emcy.active[1] = true;
        emcy.active[2] = true;
        assert_eq!(emcy.cnt(), 2);
    }
}
