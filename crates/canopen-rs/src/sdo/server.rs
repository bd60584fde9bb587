//! SDO server: point-to-point dictionary access with expedited,
//! segmented and block transfer modes (including go-back-N flow
//! control in block mode).

use crate::hal::{CanDriver, CanFrame, NodeEvents};
use crate::node::Node;
use crate::od::{ObjData, ObjKey};
use crate::sdo::abort::*;
use alloc::vec::Vec;

/// Per-slot transfer state. Exactly one transfer is in flight per
/// server slot; a new init while busy aborts the old transfer first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SrvState {
    Idle,
    SegDown,
    SegUp,
    BlkDownSeg,
    BlkDownEnd,
    BlkUpStart,
    BlkUpAck,
    BlkUpEnd,
}

/// One SDO server slot with its transfer state machine record.
pub struct SdoServer {
    pub(crate) rx_id: u32,
    pub(crate) tx_id: u32,
    pub(crate) state: SrvState,
    key: ObjKey,
    toggle: u8,
    /// Indicated total size of a download, zero while streaming.
    size: usize,
    /// Destination capacity resolved at init.
    cap: usize,
    scalar: bool,
    /// Bytes committed to the entry (down) or confirmed sent (up).
    transferred: usize,
    buf: Vec<u8>,
    buf_size: usize,
    blksize: u8,
    seq: u8,
    last_flag: bool,
    use_crc: bool,
    crc: u16,
}

impl SdoServer {
    pub fn new(buf_size: usize) -> Self {
        Self {
            rx_id: u32::MAX,
            tx_id: u32::MAX,
            state: SrvState::Idle,
            key: ObjKey::new(0, 0),
            toggle: 0,
            size: 0,
            cap: 0,
            scalar: false,
            transferred: 0,
            buf: Vec::with_capacity(buf_size),
            buf_size,
            blksize: 0,
            seq: 0,
            last_flag: false,
            use_crc: false,
            crc: 0,
        }
    }

    /// Returns the transfer to idle, dropping all transient state.
    pub(crate) fn release(&mut self) {
        self.state = SrvState::Idle;
        self.buf.clear();
        self.toggle = 0;
        self.size = 0;
        self.transferred = 0;
        self.seq = 0;
        self.last_flag = false;
        self.use_crc = false;
        self.crc = 0;
    }

    /// The block size advertised at block transfer setup.
    fn block_capacity(&self) -> u8 {
        (self.buf_size / 7).min(127) as u8
    }
}

fn frame_key(frm: &CanFrame) -> ObjKey {
    ObjKey::new(frm.word(1), frm.data[3])
}

fn is_init_cmd(cmd: u8) -> bool {
    match cmd >> 5 {
        1 | 2 => true,
        5 => cmd & 0x03 == 0,
        6 => cmd & 0x01 == 0,
        _ => false,
    }
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// Feeds a request frame into a server slot.
    pub(crate) fn sdo_srv_process(&mut self, slot: usize, frm: &CanFrame) {
        if frm.dlc != 8 {
            return;
        }
        let cmd = frm.data[0];
        match self.sdo[slot].state {
            SrvState::Idle => self.sdo_idle(slot, frm),
            SrvState::BlkDownSeg => self.sdo_blk_down_seg(slot, frm),
            state => {
                if cmd == 0x80 {
                    // client abort: terminate without a response
                    self.sdo[slot].release();
                    return;
                }
                let expected = match state {
                    SrvState::SegDown => cmd >> 5 == 0,
                    SrvState::SegUp => cmd >> 5 == 3,
                    SrvState::BlkDownEnd => cmd >> 5 == 6 && cmd & 0x01 == 1,
                    SrvState::BlkUpStart => cmd == 0xA3,
                    SrvState::BlkUpAck => cmd >> 5 == 5 && cmd & 0x03 == 2,
                    SrvState::BlkUpEnd => cmd == 0xA1,
                    _ => false,
                };
                if expected {
                    match state {
                        SrvState::SegDown => self.sdo_seg_down(slot, frm),
                        SrvState::SegUp => self.sdo_seg_up(slot, frm),
                        SrvState::BlkDownEnd => self.sdo_blk_down_end(slot, frm),
                        SrvState::BlkUpStart => self.sdo_blk_up_stream(slot),
                        SrvState::BlkUpAck => self.sdo_blk_up_ack(slot, frm),
                        SrvState::BlkUpEnd => self.sdo[slot].release(),
                        _ => {}
                    }
                } else if is_init_cmd(cmd) {
                    // a fresh init supersedes the active transfer
                    let key = self.sdo[slot].key;
                    self.sdo_abort(slot, key, ABORT_CMD);
                    self.sdo[slot].release();
                    self.sdo_idle(slot, frm);
                } else {
                    let key = self.sdo[slot].key;
                    self.sdo_abort(slot, key, ABORT_CMD);
                    self.sdo[slot].release();
                }
            }
        }
    }

    fn sdo_idle(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        match cmd >> 5 {
            1 => self.sdo_init_download(slot, frm),
            2 => self.sdo_init_upload(slot, frm),
            4 => {} // stray abort, ignored
            5 if cmd & 0x03 == 0 => self.sdo_blk_up_init(slot, frm),
            6 if cmd & 0x01 == 0 => self.sdo_blk_down_init(slot, frm),
            _ => self.sdo_abort(slot, frame_key(frm), ABORT_CMD),
        }
    }

    fn sdo_resp(&mut self, slot: usize, data: [u8; 8]) {
        let frame = CanFrame {
            id: self.sdo[slot].tx_id,
            dlc: 8,
            data,
        };
        self.send_frame(&frame);
    }

    fn sdo_resp_mltpx(&mut self, slot: usize, cmd: u8, key: ObjKey, value: u32) {
        let mut data = [0u8; 8];
        data[0] = cmd;
        data[1..3].copy_from_slice(&key.index.to_le_bytes());
        data[3] = key.sub;
        data[4..8].copy_from_slice(&value.to_le_bytes());
        self.sdo_resp(slot, data);
    }

    pub(crate) fn sdo_abort(&mut self, slot: usize, key: ObjKey, code: u32) {
        self.sdo_resp_mltpx(slot, 0x80, key, code);
    }

    /// Resolves the destination of a download init; aborts on failure.
    fn sdo_down_target(&mut self, slot: usize, key: ObjKey) -> Option<(usize, bool)> {
        match self.od_wr_check(key) {
            Ok(cap) => {
                let scalar = matches!(
                    self.dict.entry(key).map(|e| &e.data),
                    Ok(ObjData::Byte(_)) | Ok(ObjData::Word(_)) | Ok(ObjData::Long(_))
                );
                Some((cap, scalar))
            }
            Err(err) => {
                self.sdo_abort(slot, key, abort_code(err));
                None
            }
        }
    }

    /// Checks an announced download size against the destination.
    fn sdo_down_size_ok(&mut self, slot: usize, key: ObjKey, size: usize, cap: usize, scalar: bool) -> bool {
        if size > cap {
            self.sdo_abort(slot, key, ABORT_LEN_TOO_HIGH);
            return false;
        }
        if scalar && size < cap {
            self.sdo_abort(slot, key, ABORT_LEN_TOO_LOW);
            return false;
        }
        true
    }

    // --- Expedited / segmented download ---

    fn sdo_init_download(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let key = frame_key(frm);
        let expedited = cmd & 0x02 != 0;
        let size_ind = cmd & 0x01 != 0;
        let Some((cap, scalar)) = self.sdo_down_target(slot, key) else {
            return;
        };
        if expedited {
            let n = if size_ind {
                4 - ((cmd >> 2) & 0x03) as usize
            } else {
                cap.min(4)
            };
            if !self.sdo_down_size_ok(slot, key, n, cap, scalar) {
                return;
            }
            match self.od_write(key, &frm.data[4..4 + n]) {
                Ok(()) => self.sdo_resp_mltpx(slot, 0x60, key, 0),
                Err(err) => self.sdo_abort(slot, key, abort_code(err)),
            }
        } else {
            let size = if size_ind { frm.long(4) as usize } else { 0 };
            if size > 0 && !self.sdo_down_size_ok(slot, key, size, cap, scalar) {
                return;
            }
            let srv = &mut self.sdo[slot];
            srv.state = SrvState::SegDown;
            srv.key = key;
            srv.toggle = 0;
            srv.size = size;
            srv.cap = cap;
            srv.scalar = scalar;
            srv.transferred = 0;
            srv.buf.clear();
            self.sdo_resp_mltpx(slot, 0x60, key, 0);
        }
    }

    fn sdo_seg_down(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let key = self.sdo[slot].key;
        if cmd & 0x10 != self.sdo[slot].toggle {
            self.sdo_abort(slot, key, ABORT_TOGGLE);
            self.sdo[slot].release();
            return;
        }
        let valid = 7 - ((cmd >> 1) & 0x07) as usize;
        let last = cmd & 0x01 != 0;
        let (size, cap, filled) = {
            let srv = &self.sdo[slot];
            (srv.size, srv.cap, srv.buf.len())
        };
        // excess bytes beyond an indicated size are padding
        let n = if size > 0 {
            valid.min(size - filled)
        } else {
            valid
        };
        if size == 0 && filled + n > cap {
            self.sdo_abort(slot, key, ABORT_LEN_TOO_HIGH);
            self.sdo[slot].release();
            return;
        }
        self.sdo[slot].buf.extend_from_slice(&frm.data[1..1 + n]);
        if size > 0 && self.sdo[slot].buf.len() == size && !last {
            self.sdo_abort(slot, key, ABORT_GENERAL);
            self.sdo[slot].release();
            return;
        }
        let tgl = self.sdo[slot].toggle;
        self.sdo[slot].toggle ^= 0x10;
        if last {
            match self.sdo_commit_download(slot) {
                Ok(()) => {
                    let mut data = [0u8; 8];
                    data[0] = 0x20 | tgl;
                    self.sdo_resp(slot, data);
                }
                Err(code) => self.sdo_abort(slot, key, code),
            }
            self.sdo[slot].release();
        } else {
            let mut data = [0u8; 8];
            data[0] = 0x20 | tgl;
            self.sdo_resp(slot, data);
        }
    }

    /// Final commit of a buffered download into the dictionary.
    fn sdo_commit_download(&mut self, slot: usize) -> Result<(), u32> {
        let key = self.sdo[slot].key;
        let scalar = self.sdo[slot].scalar;
        let cap = self.sdo[slot].cap;
        let offset = self.sdo[slot].transferred;
        let data = core::mem::take(&mut self.sdo[slot].buf);
        let res = if scalar {
            if data.len() > cap {
                Err(ABORT_LEN_TOO_HIGH)
            } else if data.len() < cap {
                Err(ABORT_LEN_TOO_LOW)
            } else {
                self.od_write(key, &data).map_err(abort_code)
            }
        } else if offset == 0 {
            self.od_write(key, &data).map_err(abort_code)
        } else {
            self.od_write_window_raw(key, offset, &data)
                .map_err(abort_code)
        };
        self.sdo[slot].buf = data;
        self.sdo[slot].buf.clear();
        res
    }

    // --- Expedited / segmented upload ---

    fn sdo_init_upload(&mut self, slot: usize, frm: &CanFrame) {
        let key = frame_key(frm);
        let size = match self.od_rd_check(key) {
            Ok(size) => size,
            Err(err) => {
                self.sdo_abort(slot, key, abort_code(err));
                return;
            }
        };
        if size <= 4 {
            let mut value = [0u8; 4];
            if self.od_read_window(key, 0, &mut value[..size]).is_err() {
                self.sdo_abort(slot, key, ABORT_DATA_TRANSFER);
                return;
            }
            let cmd = 0x43 | (((4 - size) as u8) << 2);
            self.sdo_resp_mltpx(slot, cmd, key, u32::from_le_bytes(value));
        } else {
            let srv = &mut self.sdo[slot];
            srv.state = SrvState::SegUp;
            srv.key = key;
            srv.toggle = 0;
            srv.size = size;
            srv.transferred = 0;
            self.sdo_resp_mltpx(slot, 0x41, key, size as u32);
        }
    }

    fn sdo_seg_up(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let key = self.sdo[slot].key;
        if cmd & 0x10 != self.sdo[slot].toggle {
            self.sdo_abort(slot, key, ABORT_TOGGLE);
            self.sdo[slot].release();
            return;
        }
        let offset = self.sdo[slot].transferred;
        let size = self.sdo[slot].size;
        let mut data = [0u8; 8];
        let n = match self.od_read_window(key, offset, &mut data[1..8]) {
            Ok(n) => n,
            Err(_) => {
                self.sdo_abort(slot, key, ABORT_DATA_TRANSFER);
                self.sdo[slot].release();
                return;
            }
        };
        let last = offset + n >= size;
        let tgl = self.sdo[slot].toggle;
        data[0] = tgl | (((7 - n) as u8) << 1) | last as u8;
        self.sdo_resp(slot, data);
        self.sdo[slot].transferred = offset + n;
        self.sdo[slot].toggle ^= 0x10;
        if last {
            self.sdo[slot].release();
        }
    }

    // --- Block download ---

    fn sdo_blk_down_init(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let key = frame_key(frm);
        let use_crc = cmd & 0x04 != 0;
        let size_ind = cmd & 0x02 != 0;
        let Some((cap, scalar)) = self.sdo_down_target(slot, key) else {
            return;
        };
        let size = if size_ind { frm.long(4) as usize } else { 0 };
        if size > 0 && !self.sdo_down_size_ok(slot, key, size, cap, scalar) {
            return;
        }
        let blksize = self.sdo[slot].block_capacity();
        let srv = &mut self.sdo[slot];
        srv.state = SrvState::BlkDownSeg;
        srv.key = key;
        srv.size = size;
        srv.cap = cap;
        srv.scalar = scalar;
        srv.transferred = 0;
        srv.buf.clear();
        srv.blksize = blksize;
        srv.seq = 0;
        srv.last_flag = false;
        srv.use_crc = use_crc;
        srv.crc = 0;
        let mut data = [0u8; 8];
        data[0] = 0xA0 | if use_crc { 0x04 } else { 0 };
        data[1..3].copy_from_slice(&key.index.to_le_bytes());
        data[3] = key.sub;
        data[4] = blksize;
        self.sdo_resp(slot, data);
    }

    fn sdo_blk_down_seg(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let seqno = cmd & 0x7F;
        let last = cmd & 0x80 != 0;
        if seqno == self.sdo[slot].seq + 1 {
            self.sdo[slot].seq = seqno;
            let bytes = [
                frm.data[1], frm.data[2], frm.data[3], frm.data[4], frm.data[5], frm.data[6],
                frm.data[7],
            ];
            self.sdo[slot].buf.extend_from_slice(&bytes);
            if last {
                self.sdo[slot].last_flag = true;
            }
        }
        if seqno == self.sdo[slot].blksize || last {
            self.sdo_blk_down_ack(slot);
        }
    }

    fn sdo_blk_down_ack(&mut self, slot: usize) {
        let key = self.sdo[slot].key;
        let (last_flag, seq, blksize) = {
            let srv = &self.sdo[slot];
            (srv.last_flag, srv.seq, srv.blksize)
        };
        // final segments may pad with up to six bytes
        let pad = if last_flag { 6 } else { 0 };
        let min_final = self.sdo[slot].transferred + self.sdo[slot].buf.len().saturating_sub(pad);
        if min_final > self.sdo[slot].cap {
            self.sdo_abort(slot, key, ABORT_LEN_TOO_HIGH);
            self.sdo[slot].release();
            return;
        }
        let mut data = [0u8; 8];
        data[0] = 0xA2;
        data[1] = seq;
        data[2] = blksize;
        self.sdo_resp(slot, data);
        if last_flag {
            self.sdo[slot].state = SrvState::BlkDownEnd;
        } else if !self.sdo[slot].scalar && !self.sdo[slot].buf.is_empty() {
            // write-through of completed blocks keeps the buffer bounded
            let offset = self.sdo[slot].transferred;
            let buf = core::mem::take(&mut self.sdo[slot].buf);
            self.sdo[slot].crc = crc16_ccitt(self.sdo[slot].crc, &buf);
            if self.od_write_window_raw(key, offset, &buf).is_err() {
                self.sdo_abort(slot, key, ABORT_DATA_TRANSFER);
                self.sdo[slot].buf = buf;
                self.sdo[slot].release();
                return;
            }
            self.sdo[slot].transferred = offset + buf.len();
            self.sdo[slot].buf = buf;
            self.sdo[slot].buf.clear();
        }
        self.sdo[slot].seq = 0;
    }

    fn sdo_blk_down_end(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let key = self.sdo[slot].key;
        let n = ((cmd >> 2) & 0x07) as usize;
        let len = self.sdo[slot].buf.len();
        self.sdo[slot].buf.truncate(len.saturating_sub(n));
        if self.sdo[slot].use_crc {
            let crc = crc16_ccitt(self.sdo[slot].crc, &self.sdo[slot].buf);
            if crc != frm.word(1) {
                self.sdo_abort(slot, key, ABORT_BLK_CRC);
                self.sdo[slot].release();
                return;
            }
        }
        match self.sdo_commit_download(slot) {
            Ok(()) => {
                let mut data = [0u8; 8];
                data[0] = 0xA1;
                self.sdo_resp(slot, data);
            }
            Err(code) => self.sdo_abort(slot, key, code),
        }
        self.sdo[slot].release();
    }

    // --- Block upload ---

    fn sdo_blk_up_init(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        let key = frame_key(frm);
        let blksize = frm.data[4];
        if !(1..=127).contains(&blksize) {
            self.sdo_abort(slot, key, ABORT_BLK_SIZE);
            return;
        }
        let size = match self.od_rd_check(key) {
            Ok(size) => size,
            Err(err) => {
                self.sdo_abort(slot, key, abort_code(err));
                return;
            }
        };
        let use_crc = cmd & 0x04 != 0;
        let srv = &mut self.sdo[slot];
        srv.state = SrvState::BlkUpStart;
        srv.key = key;
        srv.size = size;
        srv.transferred = 0;
        srv.blksize = blksize;
        srv.use_crc = use_crc;
        let resp = 0xC2 | if use_crc { 0x04 } else { 0 };
        self.sdo_resp_mltpx(slot, resp, key, size as u32);
    }

    /// Streams one block of segments starting at the confirmed offset.
    fn sdo_blk_up_stream(&mut self, slot: usize) {
        let key = self.sdo[slot].key;
        let size = self.sdo[slot].size;
        let blksize = self.sdo[slot].blksize;
        let mut offset = self.sdo[slot].transferred;
        let mut seq = 0u8;
        while seq < blksize && offset < size {
            seq += 1;
            let mut data = [0u8; 8];
            let n = self
                .od_read_window(key, offset, &mut data[1..8])
                .unwrap_or(0);
            offset += n;
            let last = offset >= size;
            data[0] = seq | if last { 0x80 } else { 0 };
            self.sdo_resp(slot, data);
            if last {
                break;
            }
        }
        self.sdo[slot].seq = seq;
        self.sdo[slot].state = SrvState::BlkUpAck;
    }

    fn sdo_blk_up_ack(&mut self, slot: usize, frm: &CanFrame) {
        let key = self.sdo[slot].key;
        let ackseq = frm.data[1];
        let nblk = frm.data[2];
        if ackseq > 127 {
            self.sdo_abort(slot, key, ABORT_BLK_SEQ);
            self.sdo[slot].release();
            return;
        }
        if !(1..=127).contains(&nblk) {
            self.sdo_abort(slot, key, ABORT_BLK_SIZE);
            self.sdo[slot].release();
            return;
        }
        let confirmed = ackseq.min(self.sdo[slot].seq) as usize;
        let size = self.sdo[slot].size;
        let transferred = (self.sdo[slot].transferred + confirmed * 7).min(size);
        self.sdo[slot].transferred = transferred;
        self.sdo[slot].blksize = nblk;
        if transferred >= size {
            let valid = if size % 7 == 0 { 7 } else { size % 7 };
            let mut data = [0u8; 8];
            data[0] = 0xC1 | (((7 - valid) as u8) << 2);
            if self.sdo[slot].use_crc {
                let crc = self.sdo_blk_up_crc(slot);
                data[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            self.sdo_resp(slot, data);
            self.sdo[slot].state = SrvState::BlkUpEnd;
        } else {
            self.sdo_blk_up_stream(slot);
        }
    }

    fn sdo_blk_up_crc(&mut self, slot: usize) -> u16 {
        let key = self.sdo[slot].key;
        let size = self.sdo[slot].size;
        let mut crc = 0u16;
        let mut offset = 0usize;
        let mut chunk = [0u8; 32];
        while offset < size {
            let n = self
                .od_read_window(key, offset, &mut chunk)
                .unwrap_or(0);
            if n == 0 {
                break;
            }
            crc = crc16_ccitt(crc, &chunk[..n]);
            offset += n;
        }
        crc
    }
}
