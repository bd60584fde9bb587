//! SDO client: initiator counterpart of the server with expedited,
//! segmented and block download transfers plus timeout handling.
//!
//! Requests return immediately; completion arrives through
//! [`crate::hal::NodeEvents::csdo_finished`] with an abort code of zero
//! on success.

use crate::hal::{CanDriver, CanFrame, CoError, NodeEvents};
use crate::nmt::NmtMode;
use crate::node::Node;
use crate::od::ObjKey;
use crate::sdo::abort::*;
use crate::timer::{TimerAction, TmrHandle, TmrUnit};
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CliState {
    Idle,
    UpInit,
    SegUp,
    DownInit,
    SegDown,
    BlkDownInit,
    BlkDownAck,
    BlkDownEnd,
}

/// One SDO client slot.
pub struct SdoClient {
    pub(crate) rx_id: u32,
    pub(crate) tx_id: u32,
    pub(crate) server: u8,
    state: CliState,
    key: ObjKey,
    toggle: u8,
    buf: Vec<u8>,
    size: usize,
    cursor: usize,
    timeout_ticks: u32,
    tmo: Option<TmrHandle>,
    blksize: u8,
    seq: u8,
    expedited: bool,
}

impl SdoClient {
    pub fn new(buf_size: usize) -> Self {
        Self {
            rx_id: u32::MAX,
            tx_id: u32::MAX,
            server: 0,
            state: CliState::Idle,
            key: ObjKey::new(0, 0),
            toggle: 0,
            buf: Vec::with_capacity(buf_size),
            size: 0,
            cursor: 0,
            timeout_ticks: 0,
            tmo: None,
            blksize: 0,
            seq: 0,
            expedited: false,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state != CliState::Idle
    }
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// Requests an upload (read from the remote dictionary) of exactly
    /// `len` bytes into the client buffer.
    pub fn csdo_request_upload(
        &mut self,
        slot: usize,
        key: ObjKey,
        len: usize,
        timeout_ms: u32,
    ) -> Result<(), CoError> {
        self.csdo_request_check(slot)?;
        {
            let cli = &mut self.csdo[slot];
            cli.state = CliState::UpInit;
            cli.key = key;
            cli.size = len;
            cli.cursor = 0;
            cli.toggle = 0;
            cli.buf.clear();
        }
        self.csdo_arm_timeout(slot, timeout_ms);
        self.csdo_send_mltpx(slot, 0x40, key, 0);
        Ok(())
    }

    /// Requests a download (write to the remote dictionary) of the
    /// given bytes, expedited for up to four bytes and segmented above.
    pub fn csdo_request_download(
        &mut self,
        slot: usize,
        key: ObjKey,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), CoError> {
        self.csdo_request_check(slot)?;
        if data.is_empty() {
            return Err(CoError::ObjWrite);
        }
        let expedited = data.len() <= 4;
        {
            let cli = &mut self.csdo[slot];
            cli.state = CliState::DownInit;
            cli.key = key;
            cli.size = data.len();
            cli.cursor = 0;
            cli.toggle = 0;
            cli.expedited = expedited;
            cli.buf.clear();
            cli.buf.extend_from_slice(data);
        }
        self.csdo_arm_timeout(slot, timeout_ms);
        if expedited {
            let n = data.len();
            let cmd = 0x23 | (((4 - n) as u8) << 2);
            let mut value = [0u8; 4];
            value[..n].copy_from_slice(data);
            self.csdo_send_mltpx(slot, cmd, key, u32::from_le_bytes(value));
        } else {
            self.csdo_send_mltpx(slot, 0x21, key, data.len() as u32);
        }
        Ok(())
    }

    /// Requests a block download of the given bytes.
    pub fn csdo_request_download_block(
        &mut self,
        slot: usize,
        key: ObjKey,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), CoError> {
        self.csdo_request_check(slot)?;
        if data.is_empty() {
            return Err(CoError::ObjWrite);
        }
        {
            let cli = &mut self.csdo[slot];
            cli.state = CliState::BlkDownInit;
            cli.key = key;
            cli.size = data.len();
            cli.cursor = 0;
            cli.buf.clear();
            cli.buf.extend_from_slice(data);
        }
        self.csdo_arm_timeout(slot, timeout_ms);
        self.csdo_send_mltpx(slot, 0xC2, key, data.len() as u32);
        Ok(())
    }

    fn csdo_request_check(&mut self, slot: usize) -> Result<(), CoError> {
        if slot >= self.csdo.len() || self.csdo[slot].tx_id == u32::MAX {
            return Err(CoError::ObjInit);
        }
        match self.nmt.mode {
            NmtMode::PreOp | NmtMode::Op => {}
            _ => return Err(CoError::NmtMode),
        }
        if self.csdo[slot].is_busy() {
            return Err(CoError::SdoBusy);
        }
        Ok(())
    }

    /// Handles a response frame of the addressed server.
    pub(crate) fn csdo_response(&mut self, slot: usize, frm: &CanFrame) {
        if frm.dlc != 8 {
            return;
        }
        let cmd = frm.data[0];
        if cmd == 0x80 {
            self.csdo_finish(slot, frm.long(4));
            return;
        }
        match self.csdo[slot].state {
            CliState::UpInit => self.csdo_up_init_resp(slot, frm),
            CliState::SegUp => self.csdo_seg_up_resp(slot, frm),
            CliState::DownInit => {
                if cmd >> 5 == 3 {
                    if self.csdo[slot].expedited {
                        self.csdo_finish(slot, 0);
                    } else {
                        self.csdo_seg_down_send(slot);
                    }
                }
            }
            CliState::SegDown => self.csdo_seg_down_resp(slot, frm),
            CliState::BlkDownInit => self.csdo_blk_init_resp(slot, frm),
            CliState::BlkDownAck => self.csdo_blk_ack_resp(slot, frm),
            CliState::BlkDownEnd => {
                if cmd == 0xA1 {
                    self.csdo_finish(slot, 0);
                }
            }
            CliState::Idle => {}
        }
    }

    fn csdo_up_init_resp(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        if cmd >> 5 != 2 {
            return;
        }
        if cmd & 0x02 != 0 {
            // expedited response
            let n = if cmd & 0x01 != 0 {
                4 - ((cmd >> 2) & 0x03) as usize
            } else {
                self.csdo[slot].size.min(4)
            };
            let bytes = [frm.data[4], frm.data[5], frm.data[6], frm.data[7]];
            self.csdo[slot].buf.extend_from_slice(&bytes[..n]);
            self.csdo_finish(slot, 0);
        } else {
            // segmented: the announced size must match the caller buffer
            let announced = frm.long(4) as usize;
            if announced != self.csdo[slot].size {
                self.csdo_send_abort(slot, ABORT_LEN_MISMATCH);
                self.csdo_finish(slot, ABORT_LEN_MISMATCH);
                return;
            }
            self.csdo[slot].state = CliState::SegUp;
            self.csdo[slot].toggle = 0;
            self.csdo_rearm_timeout(slot);
            self.csdo_send_cmd(slot, 0x60);
        }
    }

    fn csdo_seg_up_resp(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        if cmd >> 5 != 0 {
            return;
        }
        if cmd & 0x10 != self.csdo[slot].toggle {
            self.csdo_send_abort(slot, ABORT_TOGGLE);
            self.csdo_finish(slot, ABORT_TOGGLE);
            return;
        }
        let valid = 7 - ((cmd >> 1) & 0x07) as usize;
        let remaining = self.csdo[slot].size - self.csdo[slot].buf.len();
        let n = valid.min(remaining);
        self.csdo[slot].buf.extend_from_slice(&frm.data[1..1 + n]);
        if cmd & 0x01 != 0 {
            self.csdo_finish(slot, 0);
        } else {
            self.csdo[slot].toggle ^= 0x10;
            let cmd = 0x60 | self.csdo[slot].toggle;
            self.csdo_rearm_timeout(slot);
            self.csdo_send_cmd(slot, cmd);
        }
    }

    fn csdo_seg_down_send(&mut self, slot: usize) {
        let cursor = self.csdo[slot].cursor;
        let remaining = self.csdo[slot].size - cursor;
        let n = remaining.min(7);
        let last = remaining <= 7;
        let mut data = [0u8; 8];
        data[0] = self.csdo[slot].toggle | (((7 - n) as u8) << 1) | last as u8;
        for i in 0..n {
            data[1 + i] = self.csdo[slot].buf[cursor + i];
        }
        self.csdo[slot].cursor = cursor + n;
        self.csdo[slot].state = CliState::SegDown;
        self.csdo_rearm_timeout(slot);
        self.csdo_send(slot, data);
    }

    fn csdo_seg_down_resp(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        if cmd >> 5 != 1 {
            return;
        }
        if cmd & 0x10 != self.csdo[slot].toggle {
            self.csdo_send_abort(slot, ABORT_TOGGLE);
            self.csdo_finish(slot, ABORT_TOGGLE);
            return;
        }
        if self.csdo[slot].cursor >= self.csdo[slot].size {
            self.csdo_finish(slot, 0);
        } else {
            self.csdo[slot].toggle ^= 0x10;
            self.csdo_seg_down_send(slot);
        }
    }

    fn csdo_blk_init_resp(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        if cmd >> 5 != 5 || cmd & 0x03 != 0 {
            return;
        }
        let blksize = frm.data[4];
        if !(1..=127).contains(&blksize) {
            self.csdo_send_abort(slot, ABORT_BLK_SIZE);
            self.csdo_finish(slot, ABORT_BLK_SIZE);
            return;
        }
        self.csdo[slot].blksize = blksize;
        self.csdo_blk_stream(slot);
    }

    /// Sends one block of segments starting at the confirmed offset.
    fn csdo_blk_stream(&mut self, slot: usize) {
        let blksize = self.csdo[slot].blksize;
        let size = self.csdo[slot].size;
        let mut offset = self.csdo[slot].cursor;
        let mut seq = 0u8;
        while seq < blksize && offset < size {
            seq += 1;
            let n = (size - offset).min(7);
            let mut data = [0u8; 8];
            let last = offset + n >= size;
            data[0] = seq | if last { 0x80 } else { 0 };
            for i in 0..n {
                data[1 + i] = self.csdo[slot].buf[offset + i];
            }
            self.csdo_send(slot, data);
            offset += n;
            if last {
                break;
            }
        }
        self.csdo[slot].seq = seq;
        self.csdo[slot].state = CliState::BlkDownAck;
        self.csdo_rearm_timeout(slot);
    }

    fn csdo_blk_ack_resp(&mut self, slot: usize, frm: &CanFrame) {
        let cmd = frm.data[0];
        if cmd >> 5 != 5 || cmd & 0x03 != 2 {
            return;
        }
        let ackseq = frm.data[1];
        let nblk = frm.data[2];
        if ackseq > 127 {
            self.csdo_send_abort(slot, ABORT_BLK_SEQ);
            self.csdo_finish(slot, ABORT_BLK_SEQ);
            return;
        }
        if !(1..=127).contains(&nblk) {
            self.csdo_send_abort(slot, ABORT_BLK_SIZE);
            self.csdo_finish(slot, ABORT_BLK_SIZE);
            return;
        }
        let confirmed = ackseq.min(self.csdo[slot].seq) as usize;
        let size = self.csdo[slot].size;
        self.csdo[slot].cursor = (self.csdo[slot].cursor + confirmed * 7).min(size);
        self.csdo[slot].blksize = nblk;
        if self.csdo[slot].cursor >= size {
            let valid = if size % 7 == 0 { 7 } else { size % 7 };
            let mut data = [0u8; 8];
            data[0] = 0xC1 | (((7 - valid) as u8) << 2);
            self.csdo[slot].state = CliState::BlkDownEnd;
            self.csdo_rearm_timeout(slot);
            self.csdo_send(slot, data);
        } else {
            self.csdo_blk_stream(slot);
        }
    }

    // --- Timeout and teardown ---

    fn csdo_arm_timeout(&mut self, slot: usize, timeout_ms: u32) {
        let ticks = self.tmr.get_ticks(timeout_ms, TmrUnit::Ms1).max(1);
        self.csdo[slot].timeout_ticks = ticks;
        self.csdo_rearm_timeout(slot);
    }

    /// One timer action, re-armed at every outbound frame.
    fn csdo_rearm_timeout(&mut self, slot: usize) {
        if let Some(h) = self.csdo[slot].tmo.take() {
            let _ = self.tmr.delete(h);
        }
        let ticks = self.csdo[slot].timeout_ticks;
        match self
            .tmr
            .create(ticks, 0, TimerAction::CsdoTimeout(slot as u8))
        {
            Ok(h) => self.csdo[slot].tmo = Some(h),
            Err(e) => self.set_error(e),
        }
    }

    pub(crate) fn csdo_timeout(&mut self, slot: usize) {
        if slot >= self.csdo.len() {
            return;
        }
        self.csdo[slot].tmo = None;
        if !self.csdo[slot].is_busy() {
            return;
        }
        self.csdo_send_abort(slot, ABORT_TIMEOUT);
        self.csdo_finish(slot, ABORT_TIMEOUT);
    }

    /// Ends the transfer and reports the outcome to the application.
    fn csdo_finish(&mut self, slot: usize, code: u32) {
        if let Some(h) = self.csdo[slot].tmo.take() {
            let _ = self.tmr.delete(h);
        }
        let key = self.csdo[slot].key;
        let buf = core::mem::take(&mut self.csdo[slot].buf);
        self.csdo[slot].state = CliState::Idle;
        self.events.csdo_finished(slot as u8, key, code, &buf);
        self.csdo[slot].buf = buf;
        self.csdo[slot].buf.clear();
    }

    /// Silent teardown during a communication reset.
    pub(crate) fn csdo_release(&mut self, slot: usize) {
        if let Some(h) = self.csdo[slot].tmo.take() {
            let _ = self.tmr.delete(h);
        }
        self.csdo[slot].state = CliState::Idle;
        self.csdo[slot].buf.clear();
    }

    fn csdo_send(&mut self, slot: usize, data: [u8; 8]) {
        let frame = CanFrame {
            id: self.csdo[slot].tx_id,
            dlc: 8,
            data,
        };
        self.send_frame(&frame);
    }

    fn csdo_send_cmd(&mut self, slot: usize, cmd: u8) {
        let mut data = [0u8; 8];
        data[0] = cmd;
        self.csdo_send(slot, data);
    }

    fn csdo_send_mltpx(&mut self, slot: usize, cmd: u8, key: ObjKey, value: u32) {
        let mut data = [0u8; 8];
        data[0] = cmd;
        data[1..3].copy_from_slice(&key.index.to_le_bytes());
        data[3] = key.sub;
        data[4..8].copy_from_slice(&value.to_le_bytes());
        self.csdo_send(slot, data);
    }

    fn csdo_send_abort(&mut self, slot: usize, code: u32) {
        let key = self.csdo[slot].key;
        self.csdo_send_mltpx(slot, 0x80, key, code);
    }
}
