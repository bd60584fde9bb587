//! Transmit PDO engine: scheduled and event-driven process-data
//! producer with mapping, inhibit time, event timer and SYNC coupling.

use crate::hal::{CanDriver, CanFrame, CoError, NodeEvents};
use crate::nmt::NmtMode;
use crate::node::Node;
use crate::od::ObjKey;
use crate::pdo::mapping::PdoMapEntry;
use crate::timer::{TimerAction, TmrHandle, TmrUnit};

const COBID_INVALID: u32 = 1 << 31;

/// State of one transmit PDO slot.
#[derive(Debug, Default)]
pub struct Tpdo {
    pub(crate) active: bool,
    pub(crate) id: u32,
    pub(crate) ttype: u8,
    pub(crate) inhibit_ticks: u32,
    pub(crate) event_ticks: u32,
    pub(crate) map: [PdoMapEntry; 8],
    pub(crate) map_num: u8,
    pub(crate) size: usize,
    pub(crate) sync_cnt: u8,
    pub(crate) pending: bool,
    pub(crate) inhibited: bool,
    pub(crate) tmr_event: Option<TmrHandle>,
    pub(crate) tmr_inhibit: Option<TmrHandle>,
}

impl Tpdo {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_async(&self) -> bool {
        self.ttype >= 254
    }
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// Loads every transmit PDO slot from the dictionary and arms the
    /// event timers. Called when the node enters operational mode.
    pub(crate) fn tpdo_init_all(&mut self) {
        for slot in 0..self.tpdo.len() {
            self.tpdo_load(slot);
        }
    }

    /// Stops every transmit PDO slot (leaving operational mode or a
    /// communication reset).
    pub(crate) fn tpdo_clear_all(&mut self) {
        for slot in 0..self.tpdo.len() {
            self.tpdo_stop(slot);
            self.tpdo[slot].active = false;
        }
    }

    fn tpdo_stop(&mut self, slot: usize) {
        if let Some(h) = self.tpdo[slot].tmr_event.take() {
            let _ = self.tmr.delete(h);
        }
        if let Some(h) = self.tpdo[slot].tmr_inhibit.take() {
            let _ = self.tmr.delete(h);
        }
        self.tpdo[slot].pending = false;
        self.tpdo[slot].inhibited = false;
        self.tpdo[slot].sync_cnt = 0;
    }

    /// (Re)loads one slot from its communication and mapping records.
    pub(crate) fn tpdo_load(&mut self, slot: usize) {
        if slot >= self.tpdo.len() {
            return;
        }
        self.tpdo_stop(slot);
        let base = 0x1800 + slot as u16;
        let cobid = match self.od_value_with_nid(ObjKey::new(base, 1)) {
            Ok(v) => v,
            Err(_) => {
                self.tpdo[slot].active = false;
                return;
            }
        };
        let ttype = self.dict.value(ObjKey::new(base, 2)).unwrap_or(0) as u8;
        let inhibit = self.dict.value(ObjKey::new(base, 3)).unwrap_or(0);
        let evtime = self.dict.value(ObjKey::new(base, 5)).unwrap_or(0);

        let map_base = 0x1A00 + slot as u16;
        let map_num = self.dict.value(ObjKey::new(map_base, 0)).unwrap_or(0) as usize;
        let mut map = [PdoMapEntry::default(); 8];
        let mut size = 0usize;
        for i in 0..map_num.min(8) {
            let raw = match self.dict.value(ObjKey::new(map_base, (i + 1) as u8)) {
                Ok(v) => v,
                Err(_) => {
                    self.set_error(CoError::ObjInit);
                    self.tpdo[slot].active = false;
                    return;
                }
            };
            map[i] = PdoMapEntry::from_u32(raw);
            size += map[i].len();
        }
        if size > 8 {
            self.set_error(CoError::ObjMapLen);
            self.tpdo[slot].active = false;
            return;
        }

        let pdo = &mut self.tpdo[slot];
        pdo.id = cobid & 0x7FF;
        pdo.ttype = ttype;
        pdo.map = map;
        pdo.map_num = map_num.min(8) as u8;
        pdo.size = size;
        pdo.active = cobid & COBID_INVALID == 0;
        let inhibit_ticks = self.tmr.get_ticks(inhibit, TmrUnit::Us100);
        let event_ticks = self.tmr.get_ticks(evtime, TmrUnit::Ms1);
        self.tpdo[slot].inhibit_ticks = inhibit_ticks;
        self.tpdo[slot].event_ticks = event_ticks;
        if self.tpdo[slot].active && self.nmt.mode == NmtMode::Op {
            self.tpdo_rearm_event(slot);
        }
    }

    /// Restarts the event timer of a slot, re-reading the period from
    /// the dictionary.
    pub(crate) fn tpdo_rearm_event(&mut self, slot: usize) {
        if slot >= self.tpdo.len() {
            return;
        }
        if let Some(h) = self.tpdo[slot].tmr_event.take() {
            let _ = self.tmr.delete(h);
        }
        let evtime = self
            .dict
            .value(ObjKey::new(0x1800 + slot as u16, 5))
            .unwrap_or(0);
        let ticks = self.tmr.get_ticks(evtime, TmrUnit::Ms1);
        self.tpdo[slot].event_ticks = ticks;
        if ticks == 0 || !self.tpdo[slot].active {
            return;
        }
        match self
            .tmr
            .create(ticks, 0, TimerAction::TpdoEvent(slot as u8))
        {
            Ok(h) => self.tpdo[slot].tmr_event = Some(h),
            Err(e) => self.set_error(e),
        }
    }

    /// Application-driven transmission request by PDO number.
    pub fn tpdo_trig_pdo(&mut self, num: usize) {
        if self.nmt.mode != NmtMode::Op || num >= self.tpdo.len() || !self.tpdo[num].active {
            return;
        }
        if self.tpdo[num].is_async() {
            self.tpdo_tx(num);
        } else {
            // synchronous slots transmit at the next SYNC boundary
            self.tpdo[num].pending = true;
        }
    }

    /// Transmission trigger through a written object entry: every
    /// active slot mapping the entry is requested.
    pub fn tpdo_trig_obj(&mut self, key: ObjKey) {
        for slot in 0..self.tpdo.len() {
            let pdo = &self.tpdo[slot];
            if !pdo.active {
                continue;
            }
            let mapped = pdo.map[..pdo.map_num as usize]
                .iter()
                .any(|m| m.key() == key);
            if mapped {
                self.tpdo_trig_pdo(slot);
            }
        }
    }

    /// Asynchronous transmission attempt, honoring the inhibit window.
    pub(crate) fn tpdo_tx(&mut self, slot: usize) {
        if !self.tpdo[slot].active {
            return;
        }
        if self.tpdo[slot].inhibited {
            self.tpdo[slot].pending = true;
            return;
        }
        self.tpdo_send(slot);
    }

    /// Packs the mapped entries and puts the frame on the bus; arms the
    /// inhibit window and restarts the event timer.
    pub(crate) fn tpdo_send(&mut self, slot: usize) {
        let map_num = self.tpdo[slot].map_num as usize;
        let size = self.tpdo[slot].size;
        let map = self.tpdo[slot].map;
        let mut data = [0u8; 8];
        let mut pos = 0usize;
        for m in map[..map_num].iter() {
            let n = m.len();
            if let Ok(entry) = self.dict.entry(m.key()) {
                entry.read_window(0, &mut data[pos..pos + n]);
            }
            pos += n;
        }
        let frame = CanFrame::new(self.tpdo[slot].id, &data[..size]);
        self.send_frame(&frame);
        self.tpdo[slot].pending = false;

        let inhibit = self.tpdo[slot].inhibit_ticks;
        if inhibit > 0 {
            match self
                .tmr
                .create(inhibit, 0, TimerAction::TpdoInhibit(slot as u8))
            {
                Ok(h) => {
                    self.tpdo[slot].tmr_inhibit = Some(h);
                    self.tpdo[slot].inhibited = true;
                }
                Err(e) => self.set_error(e),
            }
        }
        if self.tpdo[slot].event_ticks > 0 {
            self.tpdo_rearm_event(slot);
        }
    }

    /// Event timer expiry: chain the next window and transmit.
    pub(crate) fn tpdo_event_elapsed(&mut self, slot: usize) {
        if slot >= self.tpdo.len() {
            return;
        }
        self.tpdo[slot].tmr_event = None;
        if self.nmt.mode != NmtMode::Op || !self.tpdo[slot].active {
            return;
        }
        self.tpdo_rearm_event(slot);
        self.tpdo_tx(slot);
    }

    /// Inhibit window expiry: a deferred transmission goes out now.
    pub(crate) fn tpdo_inhibit_elapsed(&mut self, slot: usize) {
        if slot >= self.tpdo.len() {
            return;
        }
        self.tpdo[slot].tmr_inhibit = None;
        self.tpdo[slot].inhibited = false;
        if self.tpdo[slot].pending && self.nmt.mode == NmtMode::Op && self.tpdo[slot].active {
            self.tpdo_send(slot);
        }
    }

    /// SYNC boundary: cyclic slots count down, acyclic slots transmit
    /// when triggered; pending flags reset afterwards.
    pub(crate) fn tpdo_on_sync(&mut self) {
        for slot in 0..self.tpdo.len() {
            if !self.tpdo[slot].active || self.tpdo[slot].ttype > 240 {
                continue;
            }
            if self.tpdo[slot].ttype == 0 {
                if self.tpdo[slot].pending {
                    self.tpdo_send(slot);
                }
            } else {
                self.tpdo[slot].sync_cnt += 1;
                if self.tpdo[slot].sync_cnt >= self.tpdo[slot].ttype {
                    self.tpdo[slot].sync_cnt = 0;
                    self.tpdo_send(slot);
                }
            }
            self.tpdo[slot].pending = false;
        }
    }
}
