//! LSS slave (CiA 305): switch-mode services, node-id and bit-timing
//! configuration, identity inquiry and fast-scan.

use crate::hal::{CanDriver, CanFrame, NodeEvents};
use crate::node::Node;
use crate::od::ObjKey;
use crate::types::COBID_LSS_TX;

// command specifiers
const CS_SWITCH_GLOBAL: u8 = 4;
const CS_CFG_NODE_ID: u8 = 17;
const CS_CFG_BIT_TIMING: u8 = 19;
const CS_CFG_ACTIVATE: u8 = 21;
const CS_CFG_STORE: u8 = 23;
const CS_SWITCH_SEL_VENDOR: u8 = 64;
const CS_SWITCH_SEL_PRODUCT: u8 = 65;
const CS_SWITCH_SEL_REVISION: u8 = 66;
const CS_SWITCH_SEL_SERIAL: u8 = 67;
const CS_SWITCH_SEL_RESPONSE: u8 = 68;
const CS_FASTSCAN: u8 = 81;
const CS_FASTSCAN_RESPONSE: u8 = 79;
const CS_INQUIRE_VENDOR: u8 = 90;
const CS_INQUIRE_PRODUCT: u8 = 91;
const CS_INQUIRE_REVISION: u8 = 92;
const CS_INQUIRE_SERIAL: u8 = 93;
const CS_INQUIRE_NODE_ID: u8 = 94;

const FASTSCAN_CONFIRM: u8 = 128;
const FASTSCAN_BIT_MAX: u8 = 31;
const FASTSCAN_SERIAL: u8 = 3;

/// Standard bit timing table indices (CiA 305, Table 1) in bit/s.
const BAUD_TABLE: [u32; 10] = [
    1_000_000, 800_000, 500_000, 250_000, 125_000, 0, 50_000, 20_000, 10_000, 0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LssMode {
    Waiting,
    Config,
}

/// LSS slave state owned by the node.
pub struct LssSlave {
    pub(crate) mode: LssMode,
    sel_flags: u8,
    pub(crate) baudrate: Option<u32>,
}

impl LssSlave {
    pub fn new() -> Self {
        Self {
            mode: LssMode::Waiting,
            sel_flags: 0,
            baudrate: None,
        }
    }
}

impl Default for LssSlave {
    fn default() -> Self {
        Self::new()
    }
}

/// Masks out the unchecked least significant bits of a fast-scan
/// comparison. `bit_check` zero compares the full identity word.
fn fastscan_mask(bit_check: u8) -> u32 {
    if bit_check == 0 {
        u32::MAX
    } else {
        u32::MAX << bit_check
    }
}

impl<D: CanDriver, E: NodeEvents> Node<D, E> {
    pub(crate) fn lss_process(&mut self, frm: &CanFrame) {
        if frm.dlc != 8 {
            return;
        }
        match frm.data[0] {
            CS_SWITCH_GLOBAL => {
                self.lss.mode = if frm.data[1] == 1 {
                    LssMode::Config
                } else {
                    LssMode::Waiting
                };
            }
            CS_SWITCH_SEL_VENDOR => self.lss_selective(frm, 0),
            CS_SWITCH_SEL_PRODUCT => self.lss_selective(frm, 1),
            CS_SWITCH_SEL_REVISION => self.lss_selective(frm, 2),
            CS_SWITCH_SEL_SERIAL => self.lss_selective(frm, 3),
            CS_FASTSCAN => self.lss_fastscan(frm),
            cs if self.lss.mode == LssMode::Config => self.lss_config_cmd(cs, frm),
            _ => {}
        }
    }

    fn lss_identity(&self, field: u8) -> Option<u32> {
        self.dict.value(ObjKey::new(0x1018, field + 1)).ok()
    }

    fn lss_respond(&mut self, payload: [u8; 8]) {
        let frame = CanFrame {
            id: COBID_LSS_TX,
            dlc: 8,
            data: payload,
        };
        self.send_frame(&frame);
    }

    /// Selective switch: the four identity values arrive one octet
    /// group at a time; only a full match answers and enters the
    /// configuration mode.
    fn lss_selective(&mut self, frm: &CanFrame, field: u8) {
        let matches = self
            .lss_identity(field)
            .map(|value| value == frm.long(1))
            .unwrap_or(false);
        if !matches {
            self.lss.sel_flags = 0;
            return;
        }
        if field < 3 {
            // the stages must arrive in order
            if field == 0 || self.lss.sel_flags == (1 << field) - 1 {
                self.lss.sel_flags |= 1 << field;
            } else {
                self.lss.sel_flags = 0;
            }
            return;
        }
        if self.lss.sel_flags == 0x07 {
            self.lss.sel_flags = 0;
            self.lss.mode = LssMode::Config;
            let mut resp = [0u8; 8];
            resp[0] = CS_SWITCH_SEL_RESPONSE;
            self.lss_respond(resp);
        }
    }

    /// Fast-scan: bit-partitioned match over the identity fields; only
    /// an unconfigured slave participates. Out-of-range parameters are
    /// rejected silently.
    fn lss_fastscan(&mut self, frm: &CanFrame) {
        if !self.id.is_unconfigured() {
            return;
        }
        let bit_check = frm.data[5];
        let sub = frm.data[6];
        let next = frm.data[7];
        if bit_check == FASTSCAN_CONFIRM {
            let mut resp = [0u8; 8];
            resp[0] = CS_FASTSCAN_RESPONSE;
            self.lss_respond(resp);
            return;
        }
        if bit_check > FASTSCAN_BIT_MAX || sub > FASTSCAN_SERIAL || next > FASTSCAN_SERIAL {
            return;
        }
        let Some(field) = self.lss_identity(sub) else {
            return;
        };
        let mask = fastscan_mask(bit_check);
        if field & mask != frm.long(1) & mask {
            return;
        }
        if sub == FASTSCAN_SERIAL && next == FASTSCAN_SERIAL && bit_check == 0 {
            self.lss.mode = LssMode::Config;
        }
        let mut resp = [0u8; 8];
        resp[0] = CS_FASTSCAN_RESPONSE;
        self.lss_respond(resp);
    }

    /// Commands only served in configuration mode.
    fn lss_config_cmd(&mut self, cs: u8, frm: &CanFrame) {
        match cs {
            CS_CFG_NODE_ID => {
                let nid = frm.data[1];
                let valid = (1..=127).contains(&nid) || nid == 0xFF;
                if valid {
                    // picked up at the next communication reset
                    self.pending_id = Some(nid);
                }
                let mut resp = [0u8; 8];
                resp[0] = CS_CFG_NODE_ID;
                resp[1] = if valid { 0 } else { 1 };
                self.lss_respond(resp);
            }
            CS_CFG_BIT_TIMING => {
                let index = frm.data[2] as usize;
                let rate = BAUD_TABLE.get(index).copied().unwrap_or(0);
                let valid = frm.data[1] == 0 && rate != 0;
                if valid {
                    self.lss.baudrate = Some(rate);
                }
                let mut resp = [0u8; 8];
                resp[0] = CS_CFG_BIT_TIMING;
                resp[1] = if valid { 0 } else { 1 };
                self.lss_respond(resp);
            }
            CS_CFG_ACTIVATE => {
                // bit timing switchover is a driver concern; the delay
                // in bytes 1..3 is not interpreted here
            }
            CS_CFG_STORE => {
                let nid = self.pending_id.unwrap_or(self.id.0);
                let rate = self.lss.baudrate.unwrap_or(0);
                self.events.lss_store(nid, rate);
                let mut resp = [0u8; 8];
                resp[0] = CS_CFG_STORE;
                self.lss_respond(resp);
            }
            CS_INQUIRE_VENDOR | CS_INQUIRE_PRODUCT | CS_INQUIRE_REVISION | CS_INQUIRE_SERIAL => {
                let value = self.lss_identity(cs - CS_INQUIRE_VENDOR).unwrap_or(0);
                let mut resp = [0u8; 8];
                resp[0] = cs;
                resp[1..5].copy_from_slice(&value.to_le_bytes());
                self.lss_respond(resp);
            }
            CS_INQUIRE_NODE_ID => {
                let mut resp = [0u8; 8];
                resp[0] = CS_INQUIRE_NODE_ID;
                resp[1] = self.id.0;
                self.lss_respond(resp);
            }
            _ => {}
        }
    }
}
