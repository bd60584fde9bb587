//! Typed dictionary access with service routing.
//!
//! The dictionary itself is a plain typed store; the behavior of the
//! communication-profile entries (heartbeat consumer slots, SYNC and
//! EMCY identifiers, PDO parameters, the error history) is realized
//! here by dispatching on well-known index ranges before a raw value
//! reaches the entry storage. Every SDO transfer and every application
//! access goes through this layer.

use crate::hal::{CanDriver, CoError, NodeEvents};
use crate::nmt::NmtMode;
use crate::node::Node;
use crate::od::{ObjFlags, ObjKey};

/// Signature of the store-parameters command ("save", little-endian).
const PARA_STORE_SIG: u32 = 0x6576_6173;
/// Signature of the restore-parameters command ("load", little-endian).
const PARA_RESTORE_SIG: u32 = 0x6461_6F6C;

const COBID_INVALID: u32 = 1 << 31;
const COBID_NO_RTR: u32 = 1 << 30;
const COBID_EXTENDED: u32 = 1 << 29;

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    // --- Typed read API ---

    pub fn od_rd_u8(&self, key: ObjKey) -> Result<u8, CoError> {
        let (value, width) = self.od_read_value(key)?;
        if width != 1 {
            return Err(CoError::ObjRead);
        }
        Ok(value as u8)
    }

    pub fn od_rd_u16(&self, key: ObjKey) -> Result<u16, CoError> {
        let (value, width) = self.od_read_value(key)?;
        if width != 2 {
            return Err(CoError::ObjRead);
        }
        Ok(value as u16)
    }

    pub fn od_rd_u32(&self, key: ObjKey) -> Result<u32, CoError> {
        let (value, width) = self.od_read_value(key)?;
        if width != 4 {
            return Err(CoError::ObjRead);
        }
        Ok(value)
    }

    /// Reads up to `buf.len()` payload bytes of an entry; returns the
    /// copied count.
    pub fn od_rd_buffer(&self, key: ObjKey, buf: &mut [u8]) -> Result<usize, CoError> {
        self.od_read_window(key, 0, buf)
    }

    /// Verifies that the entry exists and is readable; returns its
    /// payload size.
    pub(crate) fn od_rd_check(&self, key: ObjKey) -> Result<usize, CoError> {
        let entry = self.dict.entry(key)?;
        if !entry.flags.contains(ObjFlags::RD) {
            return Err(CoError::ObjWriteOnly);
        }
        Ok(entry.size())
    }

    /// Copies payload bytes starting at `offset` into `out`, applying
    /// the routed read behavior for special entries.
    pub(crate) fn od_read_window(
        &self,
        key: ObjKey,
        offset: usize,
        out: &mut [u8],
    ) -> Result<usize, CoError> {
        let entry = self.dict.entry(key)?;
        if !entry.flags.contains(ObjFlags::RD) {
            return Err(CoError::ObjWriteOnly);
        }
        if self.read_is_routed(key, entry.flags) {
            let (value, width) = self.od_read_value(key)?;
            let bytes = value.to_le_bytes();
            if offset >= width {
                return Ok(0);
            }
            let n = (width - offset).min(out.len());
            out[..n].copy_from_slice(&bytes[offset..offset + n]);
            Ok(n)
        } else {
            Ok(entry.read_window(offset, out))
        }
    }

    fn read_is_routed(&self, key: ObjKey, flags: ObjFlags) -> bool {
        flags.contains(ObjFlags::NODE_ID)
            || key.index == 0x1001
            || key.index == 0x1003
            || (key.index == 0x1016 && key.sub > 0)
    }

    /// Reads a scalar value with routing; returns value and width.
    fn od_read_value(&self, key: ObjKey) -> Result<(u32, usize), CoError> {
        let entry = self.dict.entry(key)?;
        if !entry.flags.contains(ObjFlags::RD) {
            return Err(CoError::ObjWriteOnly);
        }
        let width = entry.size();
        match key.index {
            0x1001 => return Ok((self.emcy.register() as u32, 1)),
            0x1003 => {
                return if key.sub == 0 {
                    Ok((self.emcy.history_len() as u32, 1))
                } else {
                    Ok((self.emcy.history(key.sub), 4))
                };
            }
            0x1016 if key.sub > 0 => {
                let slot = self
                    .hbc
                    .slots
                    .get((key.sub - 1) as usize)
                    .ok_or(CoError::ObjRead)?;
                let value = (slot.time as u32) | ((slot.node_id as u32) << 16);
                return Ok((value, 4));
            }
            _ => {}
        }
        let mut value = entry.as_u32().ok_or(CoError::ObjRead)?;
        if entry.flags.contains(ObjFlags::NODE_ID) {
            value = value.wrapping_add(self.id.0 as u32);
        }
        Ok((value, width))
    }

    /// Raw value with the node-id offset applied; no access checks.
    /// Used while loading communication parameters.
    pub(crate) fn od_value_with_nid(&self, key: ObjKey) -> Result<u32, CoError> {
        let entry = self.dict.entry(key)?;
        let mut value = entry.as_u32().ok_or(CoError::ObjRead)?;
        if entry.flags.contains(ObjFlags::NODE_ID) {
            value = value.wrapping_add(self.id.0 as u32);
        }
        Ok(value)
    }

    // --- Typed write API ---

    pub fn od_wr_u8(&mut self, key: ObjKey, value: u8) -> Result<(), CoError> {
        self.od_write(key, &[value])
    }

    pub fn od_wr_u16(&mut self, key: ObjKey, value: u16) -> Result<(), CoError> {
        self.od_write(key, &value.to_le_bytes())
    }

    pub fn od_wr_u32(&mut self, key: ObjKey, value: u32) -> Result<(), CoError> {
        self.od_write(key, &value.to_le_bytes())
    }

    /// Verifies that the entry exists and accepts a write in the
    /// current mode; returns its payload capacity.
    pub(crate) fn od_wr_check(&self, key: ObjKey) -> Result<usize, CoError> {
        let entry = self.dict.entry(key)?;
        if !entry.flags.contains(ObjFlags::WR) {
            return Err(CoError::ObjReadOnly);
        }
        if entry.flags.contains(ObjFlags::PREOP) && self.nmt.mode == NmtMode::Op {
            return Err(CoError::ObjAcc);
        }
        Ok(entry.size())
    }

    /// Raw windowed write into a domain entry, bypassing routing. Used
    /// by the SDO server to flush block-transfer buffers.
    pub(crate) fn od_write_window_raw(
        &mut self,
        key: ObjKey,
        offset: usize,
        data: &[u8],
    ) -> Result<(), CoError> {
        self.dict.entry_mut(key)?.write_window(offset, data)
    }

    /// The central routed write. `data` holds the new payload in wire
    /// representation (scalars little-endian, exact width).
    pub fn od_write(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        self.od_wr_check(key)?;
        if key.index >= 0x2000 {
            if let Some(res) = self.events.app_write(key, data) {
                res.map_err(CoError::UserAbort)?;
                return Ok(());
            }
        }
        match key.index {
            0x1003 => return self.wr_err_history(key, data),
            0x1005 => return self.wr_sync_cobid(key, data),
            0x1006 => {
                self.store_raw(key, data)?;
                self.sync_load();
                return Ok(());
            }
            0x1010 => return self.wr_para_cmd(key, data, PARA_STORE_SIG),
            0x1011 => return self.wr_para_cmd(key, data, PARA_RESTORE_SIG),
            0x1014 => return self.wr_emcy_cobid(key, data),
            0x1016 if key.sub > 0 => return self.wr_hbcons(key, data),
            0x1017 => {
                self.store_raw(key, data)?;
                self.hb_prod_load();
                return Ok(());
            }
            0x1200..=0x127F => return self.wr_sdo_id(key, data),
            0x1280..=0x12FF => {
                self.store_raw(key, data)?;
                self.csdo_load_ids();
                return Ok(());
            }
            0x1400..=0x15FF => return self.wr_pdo_com(key, data, false),
            0x1600..=0x17FF => return self.wr_pdo_map(key, data, false),
            0x1800..=0x19FF => return self.wr_pdo_com(key, data, true),
            0x1A00..=0x1BFF => return self.wr_pdo_map(key, data, true),
            _ => {}
        }
        self.store_raw(key, data)?;
        // a write to an async-flagged entry triggers the transmit PDOs
        // mapping it
        let flags = self.dict.entry(key).map(|e| e.flags).unwrap_or_default();
        if flags.contains(ObjFlags::ASYNC) && self.nmt.mode == NmtMode::Op {
            self.tpdo_trig_obj(key);
        }
        Ok(())
    }

    /// Stores raw payload bytes into the entry, removing the node-id
    /// offset on flagged scalars.
    fn store_raw(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        let nid = self.id.0 as u32;
        let entry = self.dict.entry_mut(key)?;
        if entry.flags.contains(ObjFlags::NODE_ID) {
            let value = scalar_from(data).ok_or(CoError::ObjWrite)?;
            if data.len() != entry.size() {
                return Err(CoError::ObjWrite);
            }
            return entry.set_u32(value.wrapping_sub(nid));
        }
        entry.write_window(0, data)
    }

    // --- Routed writes per service ---

    fn wr_err_history(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        if key.sub != 0 {
            return Err(CoError::ObjReadOnly);
        }
        if scalar_from(data) != Some(0) {
            return Err(CoError::ObjRange);
        }
        self.emcy.clear_history();
        Ok(())
    }

    fn wr_sync_cobid(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        let new = u32_from(data)?;
        let old = self.dict.value(key)?;
        let was_on = old & COBID_NO_RTR != 0;
        let is_on = new & COBID_NO_RTR != 0;
        if was_on && is_on {
            // the identifier of an active producer is frozen
            return Err(CoError::ObjRange);
        }
        self.dict.set_value(key, new)?;
        self.sync_load();
        Ok(())
    }

    fn wr_para_cmd(&mut self, key: ObjKey, data: &[u8], sig: u32) -> Result<(), CoError> {
        if u32_from(data)? != sig {
            return Err(CoError::ObjRange);
        }
        if sig == PARA_STORE_SIG {
            self.events.store_parameters(key.sub)
        } else {
            self.events.restore_parameters(key.sub)
        }
    }

    fn wr_emcy_cobid(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        let new = u32_from(data)?;
        if new & 0x7FF < 0x80 {
            return Err(CoError::ObjRange);
        }
        let old = self.od_value_with_nid(key)?;
        let old_active = old & COBID_INVALID == 0;
        let new_active = new & COBID_INVALID == 0;
        if old_active && new_active {
            return Err(CoError::ObjRange);
        }
        self.store_raw(key, data)?;
        self.emcy.cobid = new;
        Ok(())
    }

    fn wr_hbcons(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        let value = u32_from(data)?;
        let time = value as u16;
        let node_id = (value >> 16) as u8;
        self.hbc
            .activate(&mut self.tmr, key.sub - 1, time, node_id)?;
        self.dict.set_value(key, value)
    }

    fn wr_sdo_id(&mut self, key: ObjKey, data: &[u8]) -> Result<(), CoError> {
        if key.sub == 1 || key.sub == 2 {
            let new = u32_from(data)?;
            let old = self.od_value_with_nid(key)?;
            if old & COBID_INVALID == 0 && new & COBID_INVALID == 0 {
                return Err(CoError::ObjRange);
            }
        }
        self.store_raw(key, data)?;
        self.sdo_load_ids();
        Ok(())
    }

    fn wr_pdo_com(&mut self, key: ObjKey, data: &[u8], tx: bool) -> Result<(), CoError> {
        let base = if tx { 0x1800 } else { 0x1400 };
        let slot = (key.index - base) as usize;
        match key.sub {
            1 => {
                let new = u32_from(data)?;
                let old = self.od_value_with_nid(key)?;
                pdo_cobid_check(old, new)?;
                self.store_raw(key, data)?;
                if self.nmt.mode == NmtMode::Op {
                    if tx {
                        self.tpdo_load(slot);
                    } else {
                        self.rpdo_load(slot);
                    }
                }
                Ok(())
            }
            2 | 3 => {
                // type and inhibit are frozen while the PDO is valid
                let cobid = self.dict.value(ObjKey::new(key.index, 1))?;
                if cobid & COBID_INVALID == 0 {
                    return Err(CoError::ObjRange);
                }
                self.store_raw(key, data)
            }
            5 => {
                self.store_raw(key, data)?;
                if tx && self.nmt.mode == NmtMode::Op {
                    self.tpdo_rearm_event(slot);
                }
                Ok(())
            }
            _ => self.store_raw(key, data),
        }
    }

    fn wr_pdo_map(&mut self, key: ObjKey, data: &[u8], tx: bool) -> Result<(), CoError> {
        let com_index = key.index - 0x200;
        let cobid = self.dict.value(ObjKey::new(com_index, 1))?;
        if cobid & COBID_INVALID == 0 {
            return Err(CoError::ObjAcc);
        }
        if key.sub == 0 {
            let count = *data.first().ok_or(CoError::ObjWrite)? as usize;
            if count > 8 {
                return Err(CoError::ObjMapLen);
            }
            let mut bits = 0usize;
            for sub in 1..=count {
                let raw = self.dict.value(ObjKey::new(key.index, sub as u8))?;
                bits += (raw & 0xFF) as usize;
                self.check_map_target(raw, tx)?;
            }
            if bits > 64 {
                return Err(CoError::ObjMapLen);
            }
            self.store_raw(key, data)
        } else {
            let count = self.dict.value(ObjKey::new(key.index, 0))?;
            if count != 0 {
                return Err(CoError::ObjAcc);
            }
            let raw = u32_from(data)?;
            self.check_map_target(raw, tx)?;
            self.store_raw(key, data)
        }
    }

    /// Validates one packed mapping value against its target entry.
    fn check_map_target(&self, raw: u32, tx: bool) -> Result<(), CoError> {
        let bits = raw & 0xFF;
        if bits == 0 || bits > 32 || bits % 8 != 0 {
            return Err(CoError::ObjMapType);
        }
        let key = ObjKey::new((raw >> 16) as u16, (raw >> 8) as u8);
        let entry = self.dict.entry(key).map_err(|_| CoError::ObjMapType)?;
        if !entry.flags.contains(ObjFlags::PDO_MAP) {
            return Err(CoError::ObjMapType);
        }
        let dir = if tx { ObjFlags::RD } else { ObjFlags::WR };
        if !entry.flags.contains(dir) {
            return Err(CoError::ObjMapType);
        }
        Ok(())
    }
}

/// COB-ID transition rules shared by all PDO communication parameters.
fn pdo_cobid_check(old: u32, new: u32) -> Result<(), CoError> {
    if new & COBID_EXTENDED != 0 {
        return Err(CoError::ObjRange);
    }
    if new & COBID_NO_RTR == 0 {
        return Err(CoError::ObjRange);
    }
    let old_valid = old & COBID_INVALID == 0;
    let new_valid = new & COBID_INVALID == 0;
    if old_valid && new_valid {
        return Err(CoError::ObjRange);
    }
    Ok(())
}

fn scalar_from(data: &[u8]) -> Option<u32> {
    match data.len() {
        1 => Some(data[0] as u32),
        2 => Some(u16::from_le_bytes([data[0], data[1]]) as u32),
        4 => Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        _ => None,
    }
}

fn u32_from(data: &[u8]) -> Result<u32, CoError> {
    if data.len() != 4 {
        return Err(CoError::ObjWrite);
    }
    Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}
