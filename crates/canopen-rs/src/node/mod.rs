//! The node façade: owns the dictionary, the timer and every service,
//! and exposes the two entry points of the stack, `process_frame` and
//! `tick`.

pub mod access;

use crate::emcy::{Emcy, EmcyEntry};
use crate::hal::{CanDriver, CanFrame, CoError, NodeEvents};
use crate::log::my_debug;
use crate::lss::LssSlave;
use crate::nmt::hbcons::HbConsPool;
use crate::nmt::{Nmt, NmtMode, ResetKind};
use crate::od::{ObjKey, ObjectDictionary};
use crate::pdo::rpdo::Rpdo;
use crate::pdo::tpdo::Tpdo;
use crate::sdo::client::SdoClient;
use crate::sdo::server::SdoServer;
use crate::sync::SyncSvc;
use crate::timer::{TimerAction, TmrHandle, TmrUnit, Timer};
use crate::types::{
    NodeId, COBID_HB_BASE, COBID_LSS_RX, COBID_NMT, COBID_SDO_RX_BASE, COBID_SDO_TX_BASE,
    NMT_CMD_ENTER_PREOP, NMT_CMD_RESET_COM, NMT_CMD_RESET_NODE, NMT_CMD_START, NMT_CMD_STOP,
};
use alloc::vec::Vec;

/// Compile-time-sized construction parameters of a node.
pub struct NodeSpec {
    /// Node-id in 1..=127, or 0xFF for an unconfigured LSS slave.
    pub node_id: u8,
    /// Frequency of the `tick()` source in Hz.
    pub timer_freq: u32,
    /// Capacity of the timer action pool.
    pub tmr_max: usize,
    /// Capacity of the SDO transfer buffer per server slot. The block
    /// size advertised in block mode is this value divided by seven.
    pub sdo_buf_size: usize,
    /// Application error classes for the emergency service.
    pub emcy_table: Vec<EmcyEntry>,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            node_id: 1,
            timer_freq: 1_000,
            tmr_max: 16,
            sdo_buf_size: 890,
            emcy_table: Vec::new(),
        }
    }
}

/// A CANopen slave node.
///
/// Single-threaded cooperative: all state mutations happen inside
/// [`Node::process_frame`] and [`Node::tick`]; user callbacks run on
/// the same stack.
pub struct Node<D: CanDriver, E: NodeEvents> {
    pub(crate) id: NodeId,
    pub(crate) pending_id: Option<u8>,
    pub dict: ObjectDictionary,
    pub(crate) tmr: Timer,
    pub(crate) nmt: Nmt,
    pub(crate) hbc: HbConsPool,
    pub(crate) emcy: Emcy,
    pub(crate) sync: SyncSvc,
    pub(crate) sdo: Vec<SdoServer>,
    pub(crate) csdo: Vec<SdoClient>,
    pub(crate) tpdo: Vec<Tpdo>,
    pub(crate) rpdo: Vec<Rpdo>,
    pub(crate) lss: LssSlave,
    pub(crate) driver: D,
    pub(crate) events: E,
    pub(crate) error: Option<CoError>,
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    /// Builds a node over a populated dictionary. Every pool is sized
    /// here; no allocation happens afterwards. The node starts in the
    /// transient `Init` mode and joins the bus with [`Node::start`].
    pub fn new(spec: NodeSpec, dict: ObjectDictionary, driver: D, events: E) -> Self {
        let id = NodeId::try_from(spec.node_id).unwrap_or(NodeId::UNCONFIGURED);
        let hist_len = dict.sub_count(0x1003);
        let hbc_len = dict.sub_count(0x1016);
        let sdo_count = count_slots(&dict, 0x1200, 1).max(1);
        let csdo_count = count_slots(&dict, 0x1280, 1);
        let tpdo_count = count_slots(&dict, 0x1800, 1);
        let rpdo_count = count_slots(&dict, 0x1400, 1);

        let mut sdo = Vec::with_capacity(sdo_count);
        for _ in 0..sdo_count {
            sdo.push(SdoServer::new(spec.sdo_buf_size));
        }
        let mut csdo = Vec::with_capacity(csdo_count);
        for _ in 0..csdo_count {
            csdo.push(SdoClient::new(spec.sdo_buf_size));
        }
        let mut tpdo = Vec::with_capacity(tpdo_count);
        tpdo.resize_with(tpdo_count, Tpdo::new);
        let mut rpdo = Vec::with_capacity(rpdo_count);
        rpdo.resize_with(rpdo_count, Rpdo::new);

        let mut node = Self {
            id,
            pending_id: None,
            dict,
            tmr: Timer::new(spec.timer_freq, spec.tmr_max),
            nmt: Nmt::new(),
            hbc: HbConsPool::new(hbc_len),
            emcy: Emcy::new(spec.emcy_table, hist_len),
            sync: SyncSvc::new(),
            sdo,
            csdo,
            tpdo,
            rpdo,
            lss: LssSlave::new(),
            driver,
            events,
            error: None,
        };
        node.comm_load();
        node
    }

    /// Starts communication: leaves `Init`, emits the boot-up frame and
    /// enters pre-operational mode.
    pub fn start(&mut self) {
        if self.nmt.mode != NmtMode::Init {
            return;
        }
        self.nmt.mode = NmtMode::PreOp;
        self.send_bootup();
    }

    /// Processes every frame currently pending in the CAN driver.
    pub fn process(&mut self) {
        while let Some(frm) = self.driver.receive() {
            self.process_frame(&frm);
        }
    }

    /// Processes a single received CAN frame.
    pub fn process_frame(&mut self, frm: &CanFrame) {
        if self.nmt.mode == NmtMode::Init {
            return;
        }
        if frm.id == COBID_LSS_RX {
            self.lss_process(frm);
            return;
        }
        if frm.id == COBID_NMT {
            self.nmt_command(frm);
            return;
        }
        if self.sync.is_sync_frame(frm.id) {
            self.sync_receive();
            return;
        }
        if (COBID_HB_BASE..=COBID_HB_BASE + 127).contains(&frm.id) {
            self.hbcons_check(frm);
            return;
        }
        if self.nmt.mode != NmtMode::Stop {
            for slot in 0..self.sdo.len() {
                if self.sdo[slot].rx_id == frm.id {
                    self.sdo_srv_process(slot, frm);
                    return;
                }
            }
            for slot in 0..self.csdo.len() {
                if self.csdo[slot].rx_id == frm.id && self.csdo[slot].is_busy() {
                    self.csdo_response(slot, frm);
                    return;
                }
            }
        }
        if self.nmt.mode == NmtMode::Op {
            for slot in 0..self.rpdo.len() {
                if self.rpdo[slot].active && self.rpdo[slot].id == frm.id {
                    self.rpdo_receive(slot, frm);
                    return;
                }
            }
        }
    }

    /// Advances the timer service by one tick and dispatches every due
    /// action.
    pub fn tick(&mut self) {
        self.tmr.update();
        while let Some(action) = self.tmr.pop_due() {
            match action {
                TimerAction::HbProduce => self.hb_produce(),
                TimerAction::HbConsMonitor(idx) => self.hbcons_elapsed(idx),
                TimerAction::TpdoEvent(num) => self.tpdo_event_elapsed(num as usize),
                TimerAction::TpdoInhibit(num) => self.tpdo_inhibit_elapsed(num as usize),
                TimerAction::SyncPeriod => self.sync_produce(),
                TimerAction::CsdoTimeout(slot) => self.csdo_timeout(slot as usize),
                TimerAction::App(id) => self.events.app_timer(id),
            }
        }
    }

    // --- NMT ---

    fn nmt_command(&mut self, frm: &CanFrame) {
        if frm.dlc < 2 {
            return;
        }
        let target = frm.data[1];
        if target != 0 && target != self.id.0 {
            return;
        }
        match frm.data[0] {
            NMT_CMD_START => self.set_mode(NmtMode::Op),
            NMT_CMD_STOP => self.set_mode(NmtMode::Stop),
            NMT_CMD_ENTER_PREOP => self.set_mode(NmtMode::PreOp),
            NMT_CMD_RESET_NODE => self.reset(ResetKind::Node),
            NMT_CMD_RESET_COM => self.reset(ResetKind::Com),
            _ => {}
        }
    }

    /// Applies an NMT mode among pre-operational, operational and
    /// stopped. Entering operational (re)loads the PDO configuration.
    pub(crate) fn set_mode(&mut self, mode: NmtMode) {
        let old = self.nmt.mode;
        if old == NmtMode::Init || old == NmtMode::Invalid {
            return;
        }
        if old == NmtMode::Op && mode != NmtMode::Op {
            self.pdo_clear();
        }
        self.nmt.mode = mode;
        if mode == NmtMode::Op {
            // also on an Op-to-Op request: restart the PDO timing
            self.pdo_clear();
            self.pdo_init();
        }
        my_debug!("NMT mode change: {:?} -> {:?}", old, mode);
    }

    /// Executes an NMT reset service.
    pub fn reset(&mut self, kind: ResetKind) {
        self.events.nmt_reset_request(kind);
        self.comm_clear();
        self.comm_load();
        if self.nmt.mode != NmtMode::Init {
            self.nmt.mode = NmtMode::PreOp;
            self.send_bootup();
        }
    }

    fn send_bootup(&mut self) {
        if self.id.is_unconfigured() {
            return;
        }
        let id = COBID_HB_BASE + self.id.0 as u32;
        self.send_frame(&CanFrame::new(id, &[0]));
    }

    pub(crate) fn hb_produce(&mut self) {
        if self.nmt.mode == NmtMode::Init || self.id.is_unconfigured() {
            return;
        }
        let id = COBID_HB_BASE + self.id.0 as u32;
        let state = self.nmt.mode.encode();
        self.send_frame(&CanFrame::new(id, &[state]));
    }

    // --- Heartbeat consumer glue ---

    fn hbcons_check(&mut self, frm: &CanFrame) {
        if frm.dlc < 1 {
            return;
        }
        let producer = (frm.id - COBID_HB_BASE) as u8;
        if let Some((_, old, new)) = self.hbc.consume(&mut self.tmr, producer, frm.data[0]) {
            if old != new {
                self.events.hb_consumer_change(producer, new);
            }
        }
    }

    fn hbcons_elapsed(&mut self, idx: u8) {
        match self.hbc.monitor_elapsed(&mut self.tmr, idx) {
            Ok(node_id) => self.events.hb_consumer_event(node_id),
            Err(_) => self.set_error(CoError::TmrCreate),
        }
    }

    /// Number of heartbeat events counted for a monitored node since
    /// the last call; `None` when the node-id is not monitored.
    pub fn hb_events(&mut self, node_id: u8) -> Option<u8> {
        self.hbc.events(node_id)
    }

    /// Last received NMT state of a monitored node.
    pub fn last_hb_state(&self, node_id: u8) -> NmtMode {
        self.hbc.last_state(node_id)
    }

    // --- Communication parameter loading ---

    /// Deletes every service timer and drops transient service state.
    /// Application timers survive.
    fn comm_clear(&mut self) {
        if let Some(h) = self.nmt.hb_tmr.take() {
            let _ = self.tmr.delete(h);
        }
        if let Some(h) = self.sync.tmr.take() {
            let _ = self.tmr.delete(h);
        }
        self.pdo_clear();
        self.hbc.clear(&mut self.tmr);
        for srv in self.sdo.iter_mut() {
            srv.release();
        }
        for slot in 0..self.csdo.len() {
            if self.csdo[slot].is_busy() {
                self.csdo_release(slot);
            }
        }
        self.emcy.clear_states();
    }

    /// (Re)reads every communication parameter from the dictionary and
    /// arms the service timers. Used at construction and by the reset
    /// services.
    fn comm_load(&mut self) {
        if let Some(nid) = self.pending_id.take() {
            self.id = NodeId::try_from(nid).unwrap_or(NodeId::UNCONFIGURED);
        }
        self.sdo_load_ids();
        self.csdo_load_ids();
        self.sync_load();
        self.emcy.cobid = self
            .od_value_with_nid(ObjKey::new(0x1014, 0))
            .unwrap_or(0x80 + self.id.0 as u32);
        self.hb_prod_load();
        self.hbcons_load();
    }

    pub(crate) fn hb_prod_load(&mut self) {
        if let Some(h) = self.nmt.hb_tmr.take() {
            let _ = self.tmr.delete(h);
        }
        let time = match self.dict.value(ObjKey::new(0x1017, 0)) {
            Ok(v) => v as u16,
            Err(_) => return,
        };
        if time == 0 {
            return;
        }
        let ticks = self.tmr.get_ticks(time as u32, TmrUnit::Ms1);
        match self.tmr.create(ticks, ticks, TimerAction::HbProduce) {
            Ok(h) => self.nmt.hb_tmr = Some(h),
            Err(e) => self.set_error(e),
        }
    }

    fn hbcons_load(&mut self) {
        let count_key = ObjKey::new(0x1016, 0);
        if !self.dict.contains(count_key) {
            return;
        }
        let num = match self.dict.value(count_key) {
            Ok(v) if v >= 1 => v as usize,
            _ => {
                self.set_error(CoError::Cfg1016);
                return;
            }
        };
        for sub in 1..=num {
            let raw = match self.dict.value(ObjKey::new(0x1016, sub as u8)) {
                Ok(v) => v,
                Err(_) => {
                    self.set_error(CoError::Cfg1016);
                    break;
                }
            };
            let time = raw as u16;
            let node_id = (raw >> 16) as u8;
            if let Err(e) = self
                .hbc
                .activate(&mut self.tmr, (sub - 1) as u8, time, node_id)
            {
                self.set_error(e);
            }
        }
    }

    fn sdo_load_ids(&mut self) {
        for slot in 0..self.sdo.len() {
            let (rx, tx) = if self.id.is_unconfigured() {
                (u32::MAX, u32::MAX)
            } else {
                let def_rx = COBID_SDO_RX_BASE + self.id.0 as u32;
                let def_tx = COBID_SDO_TX_BASE + self.id.0 as u32;
                let base = 0x1200 + slot as u16;
                let rx = self
                    .od_value_with_nid(ObjKey::new(base, 1))
                    .unwrap_or(def_rx);
                let tx = self
                    .od_value_with_nid(ObjKey::new(base, 2))
                    .unwrap_or(def_tx);
                (rx & 0x7FF, tx & 0x7FF)
            };
            self.sdo[slot].rx_id = rx;
            self.sdo[slot].tx_id = tx;
        }
    }

    fn csdo_load_ids(&mut self) {
        for slot in 0..self.csdo.len() {
            let base = 0x1280 + slot as u16;
            let server = self
                .dict
                .value(ObjKey::new(base, 3))
                .unwrap_or(0) as u8;
            if server == 0 {
                self.csdo[slot].tx_id = u32::MAX;
                self.csdo[slot].rx_id = u32::MAX;
                continue;
            }
            let tx = self
                .od_value_with_nid(ObjKey::new(base, 1))
                .unwrap_or(COBID_SDO_RX_BASE + server as u32);
            let rx = self
                .od_value_with_nid(ObjKey::new(base, 2))
                .unwrap_or(COBID_SDO_TX_BASE + server as u32);
            self.csdo[slot].tx_id = tx & 0x7FF;
            self.csdo[slot].rx_id = rx & 0x7FF;
            self.csdo[slot].server = server;
        }
    }

    // --- Misc API ---

    /// The configured node-id.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Changes the node-id. Refused while operational.
    pub fn set_node_id(&mut self, node_id: u8) -> Result<(), CoError> {
        if self.nmt.mode == NmtMode::Op {
            self.set_error(CoError::NmtMode);
            return Err(CoError::NmtMode);
        }
        self.id = NodeId::try_from(node_id)?;
        self.sdo_load_ids();
        Ok(())
    }

    /// Current NMT mode.
    pub fn mode(&self) -> NmtMode {
        self.nmt.mode
    }

    /// Reads and clears the node error latch.
    pub fn last_error(&mut self) -> Option<CoError> {
        self.error.take()
    }

    pub(crate) fn set_error(&mut self, err: CoError) {
        self.error = Some(err);
    }

    /// Sends a frame through the CAN driver; a refused frame latches
    /// [`CoError::IfSend`].
    pub(crate) fn send_frame(&mut self, frm: &CanFrame) {
        if self.driver.send(frm).is_err() {
            self.set_error(CoError::IfSend);
        }
    }

    /// Creates an application timer; `start`/`period` are in timer
    /// ticks, the id is reported through [`NodeEvents::app_timer`].
    pub fn app_timer_create(
        &mut self,
        start: u32,
        period: u32,
        id: u16,
    ) -> Result<TmrHandle, CoError> {
        let res = self.tmr.create(start, period, TimerAction::App(id));
        if let Err(e) = res {
            self.set_error(e);
        }
        res
    }

    /// Deletes an application timer.
    pub fn app_timer_delete(&mut self, handle: TmrHandle) -> Result<(), CoError> {
        self.tmr.delete(handle)
    }

    /// Access to the timer unit conversion.
    pub fn get_ticks(&self, time: u32, unit: TmrUnit) -> u32 {
        self.tmr.get_ticks(time, unit)
    }

    /// Smallest representable time in the given unit.
    pub fn get_min_time(&self, unit: TmrUnit) -> u32 {
        self.tmr.get_min_time(unit)
    }
}

/// Counts contiguous service slots by probing `(base + n, sub)` keys.
fn count_slots(dict: &ObjectDictionary, base: u16, sub: u8) -> usize {
    let mut n = 0usize;
    while n < 512 && dict.contains(ObjKey::new(base + n as u16, sub)) {
        n += 1;
    }
    n
}
