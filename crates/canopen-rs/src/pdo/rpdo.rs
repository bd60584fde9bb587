//! Receive PDO engine: distributes received process data into the
//! mapped dictionary entries, deferring the commit to the next SYNC for
//! synchronous transmission types.

use crate::hal::{CanDriver, CanFrame, CoError, NodeEvents};
use crate::node::Node;
use crate::od::ObjKey;
use crate::pdo::mapping::PdoMapEntry;

const COBID_INVALID: u32 = 1 << 31;

/// State of one receive PDO slot.
#[derive(Debug, Default)]
pub struct Rpdo {
    pub(crate) active: bool,
    pub(crate) id: u32,
    pub(crate) sync: bool,
    pub(crate) map: [PdoMapEntry; 8],
    pub(crate) map_num: u8,
    pub(crate) size: usize,
    pub(crate) pending: Option<[u8; 8]>,
}

impl Rpdo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    pub(crate) fn rpdo_init_all(&mut self) {
        for slot in 0..self.rpdo.len() {
            self.rpdo_load(slot);
        }
    }

    pub(crate) fn rpdo_clear_all(&mut self) {
        for slot in 0..self.rpdo.len() {
            self.rpdo[slot].active = false;
            self.rpdo[slot].pending = None;
        }
    }

    /// (Re)loads one slot from its communication and mapping records.
    pub(crate) fn rpdo_load(&mut self, slot: usize) {
        if slot >= self.rpdo.len() {
            return;
        }
        let base = 0x1400 + slot as u16;
        let cobid = match self.od_value_with_nid(ObjKey::new(base, 1)) {
            Ok(v) => v,
            Err(_) => {
                self.rpdo[slot].active = false;
                return;
            }
        };
        let ttype = self.dict.value(ObjKey::new(base, 2)).unwrap_or(0) as u8;

        let map_base = 0x1600 + slot as u16;
        let map_num = self.dict.value(ObjKey::new(map_base, 0)).unwrap_or(0) as usize;
        let mut map = [PdoMapEntry::default(); 8];
        let mut size = 0usize;
        for i in 0..map_num.min(8) {
            let raw = match self.dict.value(ObjKey::new(map_base, (i + 1) as u8)) {
                Ok(v) => v,
                Err(_) => {
                    self.set_error(CoError::ObjInit);
                    self.rpdo[slot].active = false;
                    return;
                }
            };
            map[i] = PdoMapEntry::from_u32(raw);
            size += map[i].len();
        }
        if size > 8 {
            self.set_error(CoError::ObjMapLen);
            self.rpdo[slot].active = false;
            return;
        }

        let pdo = &mut self.rpdo[slot];
        pdo.id = cobid & 0x7FF;
        pdo.sync = ttype <= 240;
        pdo.map = map;
        pdo.map_num = map_num.min(8) as u8;
        pdo.size = size;
        pdo.pending = None;
        pdo.active = cobid & COBID_INVALID == 0;
    }

    /// Handles a received frame for an active slot: synchronous types
    /// buffer until the next SYNC, asynchronous types commit now.
    pub(crate) fn rpdo_receive(&mut self, slot: usize, frm: &CanFrame) {
        if (frm.dlc as usize) < self.rpdo[slot].size {
            return;
        }
        if self.rpdo[slot].sync {
            self.rpdo[slot].pending = Some(frm.data);
        } else {
            self.rpdo_commit(slot, frm.data);
        }
    }

    /// SYNC boundary: distribute every deferred frame.
    pub(crate) fn rpdo_on_sync(&mut self) {
        for slot in 0..self.rpdo.len() {
            if let Some(data) = self.rpdo[slot].pending.take() {
                self.rpdo_commit(slot, data);
            }
        }
    }

    /// Distributes the payload bytes into the mapped entries. Mapped
    /// values narrower than their target zero-extend (a 24-bit mapping
    /// clears the top byte of a 32-bit entry).
    fn rpdo_commit(&mut self, slot: usize, data: [u8; 8]) {
        let map = self.rpdo[slot].map;
        let map_num = self.rpdo[slot].map_num as usize;
        let mut pos = 0usize;
        for m in map[..map_num].iter() {
            let n = m.len();
            let mut value = 0u32;
            for (i, byte) in data[pos..pos + n].iter().enumerate() {
                value |= (*byte as u32) << (8 * i);
            }
            if let Ok(entry) = self.dict.entry_mut(m.key()) {
                let _ = entry.set_u32(value);
            }
            pos += n;
        }
    }
}
