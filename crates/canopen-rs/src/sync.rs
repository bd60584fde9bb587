//! SYNC service: couples the synchronous PDO paths to received SYNC
//! frames and optionally produces SYNC itself (0x1005 bit 30 with the
//! cycle period from 0x1006).

use crate::hal::{CanDriver, CanFrame, NodeEvents};
use crate::nmt::NmtMode;
use crate::node::Node;
use crate::od::ObjKey;
use crate::timer::{TimerAction, TmrHandle, TmrUnit};
use crate::types::COBID_SYNC;

/// Bit 30 of 0x1005: this node generates SYNC.
pub const SYNC_COBID_PRODUCE: u32 = 1 << 30;

/// SYNC service state owned by the node.
#[derive(Debug)]
pub struct SyncSvc {
    pub(crate) cobid: u32,
    pub(crate) tmr: Option<TmrHandle>,
}

impl SyncSvc {
    pub fn new() -> Self {
        Self {
            cobid: COBID_SYNC,
            tmr: None,
        }
    }

    /// True when the identifier addresses the SYNC service.
    pub fn is_sync_frame(&self, id: u32) -> bool {
        id == self.cobid & 0x7FF
    }
}

impl Default for SyncSvc {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// (Re)reads 0x1005/0x1006 and re-arms the producer timer.
    pub(crate) fn sync_load(&mut self) {
        if let Some(h) = self.sync.tmr.take() {
            let _ = self.tmr.delete(h);
        }
        self.sync.cobid = self.dict.value(ObjKey::new(0x1005, 0)).unwrap_or(COBID_SYNC);
        let period_us = self.dict.value(ObjKey::new(0x1006, 0)).unwrap_or(0);
        if self.sync.cobid & SYNC_COBID_PRODUCE == 0 || period_us == 0 {
            return;
        }
        let ticks = self.tmr.get_ticks(period_us, TmrUnit::Us1);
        if ticks == 0 {
            return;
        }
        match self.tmr.create(ticks, ticks, TimerAction::SyncPeriod) {
            Ok(h) => self.sync.tmr = Some(h),
            Err(e) => self.set_error(e),
        }
    }

    /// Producer timer expiry: emit one SYNC frame. Production stops in
    /// the stopped mode (only NMT and heartbeat stay active there).
    pub(crate) fn sync_produce(&mut self) {
        match self.nmt.mode {
            NmtMode::PreOp | NmtMode::Op => {}
            _ => return,
        }
        let frame = CanFrame::new(self.sync.cobid & 0x7FF, &[]);
        self.send_frame(&frame);
    }

    /// A SYNC frame arrived: commit deferred receive PDOs, then emit
    /// the due synchronous transmit PDOs in ascending number.
    pub(crate) fn sync_receive(&mut self) {
        if self.nmt.mode != NmtMode::Op {
            return;
        }
        self.rpdo_on_sync();
        self.tpdo_on_sync();
    }
}
