//! Virtual-bus harness for driving a full node in tests.
#![allow(dead_code)]

use canopen_rs::{
    CanDriver, CanFrame, CoError, EmcyEntry, Node, NodeEvents, NodeSpec, ObjData, ObjFlags, ObjKey,
    ObjectDictionary, ObjectEntry, ResetKind,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared frame queues of the simulated bus.
#[derive(Default)]
pub struct BusState {
    pub tx: VecDeque<CanFrame>,
}

/// CAN driver backed by the shared bus state.
#[derive(Clone, Default)]
pub struct SimCan(pub Rc<RefCell<BusState>>);

impl CanDriver for SimCan {
    fn send(&mut self, frame: &CanFrame) -> Result<(), CoError> {
        self.0.borrow_mut().tx.push_back(*frame);
        Ok(())
    }

    fn receive(&mut self) -> Option<CanFrame> {
        None
    }
}

/// Records every application callback for assertions.
#[derive(Default)]
pub struct EventLog {
    pub resets: Vec<ResetKind>,
    pub hb_events: Vec<u8>,
    pub lss_store: Vec<(u8, u32)>,
    pub csdo: Vec<(u8, ObjKey, u32, Vec<u8>)>,
    pub app_timers: Vec<u16>,
    /// When set, application writes to the manufacturer area are
    /// refused with this abort code.
    pub app_write_abort: Option<u32>,
}

#[derive(Clone, Default)]
pub struct SimEvents(pub Rc<RefCell<EventLog>>);

impl NodeEvents for SimEvents {
    fn nmt_reset_request(&mut self, kind: ResetKind) {
        self.0.borrow_mut().resets.push(kind);
    }

    fn hb_consumer_event(&mut self, node_id: u8) {
        self.0.borrow_mut().hb_events.push(node_id);
    }

    fn lss_store(&mut self, node_id: u8, baudrate: u32) {
        self.0.borrow_mut().lss_store.push((node_id, baudrate));
    }

    fn csdo_finished(&mut self, slot: u8, key: ObjKey, abort_code: u32, data: &[u8]) {
        self.0
            .borrow_mut()
            .csdo
            .push((slot, key, abort_code, data.to_vec()));
    }

    fn app_timer(&mut self, id: u16) {
        self.0.borrow_mut().app_timers.push(id);
    }

    fn app_write(&mut self, _key: ObjKey, _data: &[u8]) -> Option<Result<(), u32>> {
        self.0.borrow().app_write_abort.map(Err)
    }
}

pub struct Harness {
    pub node: Node<SimCan, SimEvents>,
    pub bus: Rc<RefCell<BusState>>,
    pub events: Rc<RefCell<EventLog>>,
}

impl Harness {
    /// Builds and starts a node over the given dictionary with node-id
    /// 1 and a 1 kHz tick. The boot-up frame is consumed.
    pub fn started(dict: ObjectDictionary) -> Self {
        let mut h = Self::with_spec(NodeSpec::default(), dict);
        h.node.start();
        let boot = h.expect_frame();
        assert_eq!(boot.id, 0x701);
        h
    }

    pub fn with_spec(spec: NodeSpec, dict: ObjectDictionary) -> Self {
        let bus = Rc::new(RefCell::new(BusState::default()));
        let events = Rc::new(RefCell::new(EventLog::default()));
        let node = Node::new(
            spec,
            dict,
            SimCan(bus.clone()),
            SimEvents(events.clone()),
        );
        Self { node, bus, events }
    }

    /// Advances the node by `ms` milliseconds (one tick per ms).
    pub fn wait(&mut self, ms: u32) {
        for _ in 0..ms {
            self.node.tick();
        }
    }

    pub fn recv(&mut self) -> Option<CanFrame> {
        self.bus.borrow_mut().tx.pop_front()
    }

    pub fn expect_frame(&mut self) -> CanFrame {
        self.recv().expect("expected a transmitted CAN frame")
    }

    pub fn expect_none(&mut self) {
        let frame = self.recv();
        assert!(frame.is_none(), "unexpected CAN frame: {:?}", frame);
    }

    pub fn flush(&mut self) {
        self.bus.borrow_mut().tx.clear();
    }

    pub fn feed(&mut self, id: u32, payload: &[u8]) {
        self.node.process_frame(&CanFrame::new(id, payload));
    }

    /// Sends an SDO request to server slot 0 of node 1.
    pub fn sdo_send(&mut self, cmd: u8, index: u16, sub: u8, value: u32) {
        let mut data = [0u8; 8];
        data[0] = cmd;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        data[4..8].copy_from_slice(&value.to_le_bytes());
        self.feed(0x601, &data);
    }

    /// Sends a raw SDO segment frame to server slot 0.
    pub fn seg_send(&mut self, cmd: u8, payload: &[u8; 7]) {
        let mut data = [0u8; 8];
        data[0] = cmd;
        data[1..8].copy_from_slice(payload);
        self.feed(0x601, &data);
    }

    /// Sends one block of download segments carrying the counting
    /// pattern, starting with the given data byte.
    pub fn blk_send(&mut self, start: u8, segnum: u8, last: bool, skip: u8) {
        let mut val = start;
        for seq in 1..=segnum {
            let mut data = [0u8; 8];
            data[0] = seq | if last && seq == segnum { 0x80 } else { 0 };
            for b in data[1..8].iter_mut() {
                *b = val;
                val = val.wrapping_add(1);
            }
            if seq != skip {
                self.feed(0x601, &data);
            }
        }
    }

    /// Checks the next frame to be the SDO response of slot 0 with the
    /// given command byte.
    pub fn chk_sdo(&mut self, cmd: u8) -> CanFrame {
        let frame = self.expect_frame();
        assert_eq!(frame.id, 0x581, "not an SDO response: {:?}", frame);
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.data[0], cmd, "unexpected SDO command byte");
        frame
    }

    /// Checks for a complete SDO OK response on a download.
    pub fn chk_sdo_ok(&mut self, index: u16, sub: u8) {
        let frame = self.chk_sdo(0x60);
        chk_mltpx(&frame, index, sub);
        assert_eq!(frame.long(4), 0);
    }

    /// Checks for an SDO abort with the given code.
    pub fn chk_sdo_err(&mut self, index: u16, sub: u8, code: u32) {
        let frame = self.chk_sdo(0x80);
        chk_mltpx(&frame, index, sub);
        assert_eq!(frame.long(4), code, "unexpected abort code");
    }

    pub fn nmt_send(&mut self, cmd: u8, target: u8) {
        self.feed(0x000, &[cmd, target]);
    }

    pub fn sync_send(&mut self) {
        self.feed(0x080, &[]);
    }

    pub fn hb_send(&mut self, node_id: u8, state: u8) {
        self.feed(0x700 + node_id as u32, &[state]);
    }

    pub fn lss_send(&mut self, cs: u8, payload: &[u8; 7]) {
        let mut data = [0u8; 8];
        data[0] = cs;
        data[1..8].copy_from_slice(payload);
        self.feed(0x7E5, &data);
    }

    pub fn lss_send_long(&mut self, cs: u8, value: u32) {
        let mut payload = [0u8; 7];
        payload[..4].copy_from_slice(&value.to_le_bytes());
        self.lss_send(cs, &payload);
    }
}

pub fn chk_mltpx(frame: &CanFrame, index: u16, sub: u8) {
    assert_eq!(frame.word(1), index, "unexpected multiplexer index");
    assert_eq!(frame.data[3], sub, "unexpected multiplexer sub-index");
}

/// The mandatory communication profile entries every test node carries.
pub fn mandatory_dict() -> ObjectDictionary {
    let mut od = ObjectDictionary::new();
    od.add(ObjectEntry::new(
        ObjKey::new(0x1000, 0),
        ObjFlags::RD,
        ObjData::Long(0x0000_0000),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x1001, 0),
        ObjFlags::RD,
        ObjData::Byte(0),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x1005, 0),
        ObjFlags::RW,
        ObjData::Long(0x80),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x1014, 0),
        ObjFlags::RW | ObjFlags::NODE_ID,
        ObjData::Long(0x80),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x1017, 0),
        ObjFlags::RW,
        ObjData::Word(0),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x1018, 0),
        ObjFlags::RD,
        ObjData::Byte(4),
    ));
    for sub in 1..=4 {
        od.add(ObjectEntry::new(
            ObjKey::new(0x1018, sub),
            ObjFlags::RD,
            ObjData::Long(0),
        ));
    }
    od
}

/// Adds the identity values used by the LSS scenarios.
pub fn add_identity(od: &mut ObjectDictionary, values: [u32; 4]) {
    for (i, value) in values.iter().enumerate() {
        od.add(ObjectEntry::new(
            ObjKey::new(0x1018, (i + 1) as u8),
            ObjFlags::RD,
            ObjData::Long(*value),
        ));
    }
}

/// Adds heartbeat consumer slots (0x1016).
pub fn add_hb_consumers(od: &mut ObjectDictionary, slots: &[(u8, u16)]) {
    od.add(ObjectEntry::new(
        ObjKey::new(0x1016, 0),
        ObjFlags::RD,
        ObjData::Byte(slots.len() as u8),
    ));
    for (i, (node_id, time)) in slots.iter().enumerate() {
        od.add(ObjectEntry::new(
            ObjKey::new(0x1016, (i + 1) as u8),
            ObjFlags::RW,
            ObjData::Long(((*node_id as u32) << 16) | *time as u32),
        ));
    }
}

/// Adds the error history array (0x1003) with `len` ring slots.
pub fn add_err_history(od: &mut ObjectDictionary, len: u8) {
    od.add(ObjectEntry::new(
        ObjKey::new(0x1003, 0),
        ObjFlags::RW,
        ObjData::Byte(0),
    ));
    for sub in 1..=len {
        od.add(ObjectEntry::new(
            ObjKey::new(0x1003, sub),
            ObjFlags::RD,
            ObjData::Long(0),
        ));
    }
}

/// The emergency table used by the EMCY scenarios: error `n` drives
/// register bit `n` with error code `0x1000 + n * 0x1000`.
pub fn emcy_table() -> Vec<EmcyEntry> {
    (0u8..=3)
        .map(|n| EmcyEntry {
            reg_bit: n,
            code: 0x1000 + n as u16 * 0x1000,
        })
        .collect()
}

/// Adds a transmit PDO communication and mapping record.
pub fn add_tpdo(
    od: &mut ObjectDictionary,
    num: u16,
    cobid: u32,
    ttype: u8,
    inhibit: u16,
    evtime: u16,
    links: &[u32],
) {
    let com = 0x1800 + num;
    od.add(ObjectEntry::new(
        ObjKey::new(com, 0),
        ObjFlags::RD,
        ObjData::Byte(5),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(com, 1),
        ObjFlags::RW | ObjFlags::NODE_ID,
        ObjData::Long(cobid),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(com, 2),
        ObjFlags::RW,
        ObjData::Byte(ttype),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(com, 3),
        ObjFlags::RW,
        ObjData::Word(inhibit),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(com, 5),
        ObjFlags::RW,
        ObjData::Word(evtime),
    ));
    add_mapping(od, 0x1A00 + num, links);
}

/// Adds a receive PDO communication and mapping record.
pub fn add_rpdo(od: &mut ObjectDictionary, num: u16, cobid: u32, ttype: u8, links: &[u32]) {
    let com = 0x1400 + num;
    od.add(ObjectEntry::new(
        ObjKey::new(com, 0),
        ObjFlags::RD,
        ObjData::Byte(2),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(com, 1),
        ObjFlags::RW | ObjFlags::NODE_ID,
        ObjData::Long(cobid),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(com, 2),
        ObjFlags::RW,
        ObjData::Byte(ttype),
    ));
    add_mapping(od, 0x1600 + num, links);
}

fn add_mapping(od: &mut ObjectDictionary, index: u16, links: &[u32]) {
    od.add(ObjectEntry::new(
        ObjKey::new(index, 0),
        ObjFlags::RW,
        ObjData::Byte(links.len() as u8),
    ));
    for sub in 1..=8u8 {
        let value = links.get(sub as usize - 1).copied().unwrap_or(0);
        od.add(ObjectEntry::new(
            ObjKey::new(index, sub),
            ObjFlags::RW,
            ObjData::Long(value),
        ));
    }
}

/// Adds an SDO client record addressing the given remote server.
pub fn add_csdo(od: &mut ObjectDictionary, num: u16, server: u8) {
    let base = 0x1280 + num;
    od.add(ObjectEntry::new(
        ObjKey::new(base, 0),
        ObjFlags::RD,
        ObjData::Byte(3),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(base, 1),
        ObjFlags::RW,
        ObjData::Long(0x600 + server as u32),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(base, 2),
        ObjFlags::RW,
        ObjData::Long(0x580 + server as u32),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(base, 3),
        ObjFlags::RW,
        ObjData::Byte(server),
    ));
}

/// Adds a read/write domain entry of the given size, filled with the
/// counting pattern.
pub fn add_domain(od: &mut ObjectDictionary, key: ObjKey, size: usize) {
    let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
    od.add(ObjectEntry::new(key, ObjFlags::RW, ObjData::Domain(data)));
}

/// Reads the raw domain bytes back out of the node dictionary.
pub fn domain_bytes(node: &Node<SimCan, SimEvents>, key: ObjKey) -> Vec<u8> {
    match &node.dict.entry(key).expect("domain entry").data {
        ObjData::Domain(d) => d.clone(),
        other => panic!("not a domain: {:?}", other),
    }
}
