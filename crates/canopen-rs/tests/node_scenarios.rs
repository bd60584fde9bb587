//! End-to-end scenarios for the node services over a virtual bus:
//! NMT lifecycle, heartbeat, EMCY, SYNC, PDO and LSS.

mod common;

use canopen_rs::{CoError, NmtMode, NodeSpec, ObjData, ObjFlags, ObjKey, ObjectEntry, ResetKind};
use common::*;

fn byte_entry(index: u16, sub: u8, flags: ObjFlags, value: u8) -> ObjectEntry {
    ObjectEntry::new(ObjKey::new(index, sub), flags, ObjData::Byte(value))
}

// --- NMT ---

#[test]
fn nmt_bootup_on_start() {
    let mut h = Harness::with_spec(NodeSpec::default(), mandatory_dict());
    h.expect_none();
    h.node.start();
    let boot = h.expect_frame();
    assert_eq!((boot.id, boot.dlc, boot.data[0]), (0x701, 1, 0));
    assert_eq!(h.node.mode(), NmtMode::PreOp);
}

#[test]
fn nmt_bootup_with_changed_node_id() {
    let mut h = Harness::with_spec(NodeSpec::default(), mandatory_dict());
    h.node.set_node_id(0x55).unwrap();
    h.node.start();
    assert_eq!(h.expect_frame().id, 0x755);
}

#[test]
fn nmt_no_traffic_in_init() {
    let mut h = Harness::with_spec(NodeSpec::default(), mandatory_dict());
    // SDO, NMT commands and EMCY are all silent before start()
    h.sdo_send(0x2F, 0x1017, 0, 0x20);
    h.expect_none();
    h.nmt_send(0x01, 1);
    h.expect_none();
    assert_eq!(h.node.mode(), NmtMode::Init);
    h.node.emcy_set(1, None);
    h.expect_none();
}

#[test]
fn nmt_reset_in_init_stays_silent() {
    let mut h = Harness::with_spec(NodeSpec::default(), mandatory_dict());
    h.node.reset(ResetKind::Node);
    h.expect_none();
    h.node.reset(ResetKind::Com);
    h.expect_none();
    assert_eq!(h.node.mode(), NmtMode::Init);
}

#[test]
fn nmt_reset_from_preop_repeats_bootup() {
    let mut h = Harness::started(mandatory_dict());
    h.nmt_send(129, 1);
    assert_eq!(h.expect_frame().id, 0x701);
    assert_eq!(h.node.mode(), NmtMode::PreOp);
    h.nmt_send(130, 1);
    assert_eq!(h.expect_frame().id, 0x701);
    assert_eq!(h.node.mode(), NmtMode::PreOp);
    assert_eq!(
        h.events.borrow().resets.as_slice(),
        &[ResetKind::Node, ResetKind::Com]
    );
}

#[test]
fn nmt_commands_address_target_or_broadcast() {
    let mut h = Harness::started(mandatory_dict());
    h.nmt_send(0x01, 2);
    assert_eq!(h.node.mode(), NmtMode::PreOp);
    h.nmt_send(0x01, 0);
    assert_eq!(h.node.mode(), NmtMode::Op);
    h.nmt_send(0x02, 1);
    assert_eq!(h.node.mode(), NmtMode::Stop);
    h.nmt_send(0x80, 1);
    assert_eq!(h.node.mode(), NmtMode::PreOp);
}

#[test]
fn nmt_no_sdo_in_stopped_mode() {
    let mut od = mandatory_dict();
    od.add(byte_entry(0x2510, 1, ObjFlags::RW, 0));
    let mut h = Harness::started(od);
    h.nmt_send(0x02, 1);
    h.sdo_send(0x2F, 0x2510, 1, 0x11);
    h.expect_none();
}

#[test]
fn app_timer_survives_communication_reset() {
    let mut h = Harness::started(mandatory_dict());
    h.node.app_timer_create(0, 100, 7).unwrap();
    h.wait(150);
    assert_eq!(h.events.borrow().app_timers.len(), 1);
    h.nmt_send(130, 1);
    h.flush();
    h.wait(100);
    assert_eq!(h.events.borrow().app_timers.len(), 2);
}

// --- Heartbeat producer ---

#[test]
fn hb_producer_disabled_with_time_zero() {
    let mut h = Harness::started(mandatory_dict());
    h.wait(1000);
    h.expect_none();
}

#[test]
fn hb_producer_encodes_the_mode() {
    let mut od = mandatory_dict();
    od.add(ObjectEntry::new(
        ObjKey::new(0x1017, 0),
        ObjFlags::RW,
        ObjData::Word(50),
    ));
    let mut h = Harness::started(od);
    h.wait(50);
    let frame = h.expect_frame();
    assert_eq!((frame.id, frame.data[0]), (0x701, 127));
    h.nmt_send(0x01, 1);
    h.wait(50);
    assert_eq!(h.expect_frame().data[0], 5);
}

#[test]
fn hb_producer_restarts_on_dictionary_write() {
    let mut h = Harness::started(mandatory_dict());
    h.sdo_send(0x2B, 0x1017, 0, 30);
    h.chk_sdo_ok(0x1017, 0);
    h.wait(30);
    assert_eq!(h.expect_frame().id, 0x701);
}

// --- Heartbeat consumer ---

fn consumer_node() -> Harness {
    let mut od = mandatory_dict();
    add_hb_consumers(&mut od, &[(10, 50)]);
    Harness::started(od)
}

#[test]
fn hb_consumer_entry_reads_packed() {
    let h = consumer_node();
    assert_eq!(h.node.od_rd_u32(ObjKey::new(0x1016, 1)).unwrap(), 0x000A_0032);
}

#[test]
fn hb_consumer_waits_for_first_heartbeat() {
    let mut h = consumer_node();
    h.wait(200);
    assert_eq!(h.node.hb_events(10), Some(0));
}

#[test]
fn hb_consumer_records_received_state() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    assert_eq!(h.node.last_hb_state(10), NmtMode::Op);
}

#[test]
fn hb_consumer_counts_miss_events() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    h.wait(60);
    assert_eq!(h.node.hb_events(10), Some(1));
    assert_eq!(h.events.borrow().hb_events.as_slice(), &[10]);
}

#[test]
fn hb_consumer_counts_every_missed_window() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    h.wait(500);
    assert_eq!(h.node.hb_events(10), Some(10));
}

#[test]
fn hb_consumer_in_time_heartbeats_are_quiet() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    h.wait(40);
    h.hb_send(10, 5);
    assert_eq!(h.node.hb_events(10), Some(0));
}

#[test]
fn hb_consumer_window_restarts_on_each_heartbeat() {
    let mut od = mandatory_dict();
    add_hb_consumers(&mut od, &[(10, 60)]);
    let mut h = Harness::started(od);
    h.hb_send(10, 5);
    h.wait(20);
    h.hb_send(10, 5);
    h.wait(20);
    h.hb_send(10, 5);
    h.wait(50);
    h.hb_send(10, 5);
    assert_eq!(h.node.hb_events(10), Some(0));
}

#[test]
fn hb_consumer_accepts_the_master_id() {
    let mut od = mandatory_dict();
    add_hb_consumers(&mut od, &[(0, 50)]);
    let mut h = Harness::started(od);
    for _ in 0..3 {
        h.hb_send(0, 5);
        h.wait(40);
    }
    h.hb_send(0, 5);
    assert_eq!(h.node.hb_events(0), Some(0));
}

#[test]
fn hb_consumer_unmonitored_id_reports_none() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    assert_eq!(h.node.hb_events(42), None);
    assert_eq!(h.node.last_hb_state(42), NmtMode::Invalid);
}

#[test]
fn hb_consumer_live_reconfiguration_aborts() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    h.wait(30);
    h.sdo_send(0x23, 0x1016, 1, 0x000A_0100);
    h.chk_sdo_err(0x1016, 1, 0x0604_0043);
    // the running monitor is unaffected
    h.wait(30);
    assert_eq!(h.node.hb_events(10), Some(1));
}

#[test]
fn hb_consumer_disable_while_active() {
    let mut h = consumer_node();
    h.hb_send(10, 5);
    h.wait(30);
    h.sdo_send(0x23, 0x1016, 1, 0x000A_0000);
    h.chk_sdo_ok(0x1016, 1);
    h.wait(100);
    assert_eq!(h.node.hb_events(10), None);
}

// --- Emergency ---

fn emcy_node() -> Harness {
    let mut od = mandatory_dict();
    add_err_history(&mut od, 4);
    let spec = NodeSpec {
        emcy_table: emcy_table(),
        ..NodeSpec::default()
    };
    let mut h = Harness::with_spec(spec, od);
    h.node.start();
    h.flush();
    h
}

#[test]
fn emcy_set_emits_code_and_register() {
    let mut h = emcy_node();
    h.node.emcy_set(1, None);
    let frame = h.expect_frame();
    assert_eq!(frame.id, 0x81);
    assert_eq!(frame.dlc, 8);
    assert_eq!(frame.word(0), 0x2000);
    assert_eq!(frame.data[2], 0x03);
    assert_eq!(&frame.data[3..8], &[0; 5]);
}

#[test]
fn emcy_user_data_rides_in_the_frame() {
    let mut h = emcy_node();
    h.node.emcy_set(
        1,
        Some(canopen_rs::EmcyUsr {
            hist: 0,
            emcy: [0x11, 0x12, 0x13, 0x14, 0x15],
        }),
    );
    let frame = h.expect_frame();
    assert_eq!(&frame.data[3..8], &[0x11, 0x12, 0x13, 0x14, 0x15]);
}

#[test]
fn emcy_repeated_set_is_silent() {
    let mut h = emcy_node();
    h.node.emcy_set(2, None);
    h.flush();
    h.node.emcy_set(2, None);
    h.expect_none();
    assert_eq!(h.node.emcy_cnt(), 1);
}

#[test]
fn emcy_clear_emits_zero_code() {
    let mut h = emcy_node();
    h.node.emcy_set(1, None);
    h.node.emcy_set(2, None);
    h.flush();
    h.node.emcy_clr(1);
    let frame = h.expect_frame();
    assert_eq!(frame.word(0), 0x0000);
    assert_eq!(frame.data[2], 0x05);
    h.node.emcy_clr(1);
    h.expect_none();
}

#[test]
fn emcy_reset_clears_every_error() {
    let mut h = emcy_node();
    h.node.emcy_set(1, None);
    h.node.emcy_set(3, None);
    h.flush();
    h.node.emcy_reset();
    let first = h.expect_frame();
    assert_eq!((first.word(0), first.data[2]), (0, 0x09));
    let second = h.expect_frame();
    assert_eq!((second.word(0), second.data[2]), (0, 0x00));
    assert_eq!(h.node.emcy_cnt(), 0);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1001, 0)).unwrap(), 0);
}

#[test]
fn emcy_register_composes_class_bits() {
    let mut h = emcy_node();
    h.node.emcy_set(1, None);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1001, 0)).unwrap(), 0x03);
    h.node.emcy_set(2, None);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1001, 0)).unwrap(), 0x07);
}

#[test]
fn emcy_history_keeps_newest_first() {
    let mut h = emcy_node();
    h.node.emcy_set(1, None);
    h.node.emcy_set(2, None);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1003, 0)).unwrap(), 2);
    assert_eq!(h.node.od_rd_u32(ObjKey::new(0x1003, 1)).unwrap(), 0x3000);
    assert_eq!(h.node.od_rd_u32(ObjKey::new(0x1003, 2)).unwrap(), 0x2000);
    // history survives clearing the error states
    h.node.emcy_reset();
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1003, 0)).unwrap(), 2);
}

#[test]
fn emcy_history_clears_on_zero_write_only() {
    let mut h = emcy_node();
    h.node.emcy_set(1, None);
    h.node.emcy_set(2, None);
    h.flush();
    h.sdo_send(0x2F, 0x1003, 0, 0x01);
    h.chk_sdo_err(0x1003, 0, 0x0609_0030);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1003, 0)).unwrap(), 2);
    h.sdo_send(0x2F, 0x1003, 0, 0x00);
    h.chk_sdo_ok(0x1003, 0);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x1003, 0)).unwrap(), 0);
    assert_eq!(h.node.od_rd_u32(ObjKey::new(0x1003, 1)).unwrap(), 0);
}

#[test]
fn emcy_cobid_is_frozen_while_active() {
    let mut h = emcy_node();
    h.sdo_send(0x23, 0x1014, 0, 0x70);
    h.chk_sdo_err(0x1014, 0, 0x0609_0030);
    h.sdo_send(0x23, 0x1014, 0, 0x101);
    h.chk_sdo_err(0x1014, 0, 0x0609_0030);
    // disable, then move
    h.sdo_send(0x23, 0x1014, 0, 0x8000_0081);
    h.chk_sdo_ok(0x1014, 0);
    h.sdo_send(0x23, 0x1014, 0, 0x101);
    h.chk_sdo_ok(0x1014, 0);
    h.node.emcy_set(1, None);
    assert_eq!(h.expect_frame().id, 0x101);
}

// --- SYNC producer ---

fn sync_node(cobid: u32, period_us: u32) -> Harness {
    let mut od = mandatory_dict();
    od.add(ObjectEntry::new(
        ObjKey::new(0x1005, 0),
        ObjFlags::RW,
        ObjData::Long(cobid),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x1006, 0),
        ObjFlags::RW,
        ObjData::Long(period_us),
    ));
    Harness::started(od)
}

#[test]
fn sync_producer_runs_in_preop() {
    let mut h = sync_node(0x4000_0080, 100_000);
    h.wait(50);
    h.expect_none();
    h.wait(50);
    let frame = h.expect_frame();
    assert_eq!((frame.id, frame.dlc), (0x80, 0));
}

#[test]
fn sync_producer_disabled_without_bit30() {
    let mut h = sync_node(0x80, 100_000);
    h.wait(300);
    h.expect_none();
}

#[test]
fn sync_producer_stops_in_stopped_mode() {
    let mut h = sync_node(0x4000_0080, 100_000);
    h.nmt_send(0x02, 1);
    h.wait(300);
    h.expect_none();
}

#[test]
fn sync_cobid_frozen_while_producing() {
    let mut h = sync_node(0x4000_0080, 100_000);
    h.sdo_send(0x23, 0x1005, 0, 0x4000_0088);
    h.chk_sdo_err(0x1005, 0, 0x0609_0030);
    h.sdo_send(0x23, 0x1005, 0, 0x80);
    h.chk_sdo_ok(0x1005, 0);
    h.sdo_send(0x23, 0x1005, 0, 0x4000_0088);
    h.chk_sdo_ok(0x1005, 0);
    h.wait(100);
    assert_eq!(h.expect_frame().id, 0x88);
}

#[test]
fn sync_period_change_rearms_the_producer() {
    let mut h = sync_node(0x4000_0080, 200_000);
    h.wait(200);
    h.expect_frame();
    h.sdo_send(0x23, 0x1006, 0, 100_000);
    h.chk_sdo_ok(0x1006, 0);
    h.wait(50);
    h.expect_none();
    h.wait(50);
    assert_eq!(h.expect_frame().id, 0x80);
}

// --- Transmit PDOs ---

fn mixed_tpdo_node(ttype: u8, inhibit: u16, evtime: u16) -> Harness {
    let mut od = mandatory_dict();
    od.add(byte_entry(
        0x2500,
        0x0B,
        ObjFlags::RW | ObjFlags::PDO_MAP | ObjFlags::ASYNC,
        0x91,
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x2500, 0x15),
        ObjFlags::RW | ObjFlags::PDO_MAP,
        ObjData::Word(0x8182),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x2500, 0x1F),
        ObjFlags::RW | ObjFlags::PDO_MAP,
        ObjData::Long(0x7172_7374),
    ));
    add_tpdo(
        &mut od,
        0,
        0x4000_0180,
        ttype,
        inhibit,
        evtime,
        &[0x2500_0B08, 0x2500_1510, 0x2500_1F20],
    );
    Harness::started(od)
}

#[test]
fn tpdo_mixed_mapping_transmits_on_sync() {
    let mut h = mixed_tpdo_node(1, 0, 0);
    h.nmt_send(0x01, 1);
    h.sync_send();
    let frame = h.expect_frame();
    assert_eq!((frame.id, frame.dlc), (0x181, 7));
    assert_eq!(
        &frame.data[..7],
        &[0x91, 0x82, 0x81, 0x74, 0x73, 0x72, 0x71]
    );
}

#[test]
fn tpdo_sync_types_count_cycles() {
    let mut h = mixed_tpdo_node(3, 0, 0);
    h.nmt_send(0x01, 1);
    h.sync_send();
    h.expect_none();
    h.sync_send();
    h.expect_none();
    h.sync_send();
    assert_eq!(h.expect_frame().id, 0x181);
}

#[test]
fn tpdo_suspended_outside_operational() {
    let mut h = mixed_tpdo_node(1, 0, 0);
    h.sync_send();
    h.expect_none();
    h.node.od_wr_u8(ObjKey::new(0x2500, 0x0B), 0x11).unwrap();
    h.expect_none();
}

#[test]
fn tpdo_async_triggers_on_object_write() {
    let mut h = mixed_tpdo_node(254, 0, 0);
    h.nmt_send(0x01, 1);
    for _ in 0..16 {
        h.sync_send();
        h.expect_none();
    }
    h.node.od_wr_u8(ObjKey::new(0x2500, 0x0B), 0x21).unwrap();
    let frame = h.expect_frame();
    assert_eq!(frame.id, 0x181);
    assert_eq!(frame.data[0], 0x21);
}

#[test]
fn tpdo_async_triggers_by_number() {
    let mut h = mixed_tpdo_node(255, 0, 0);
    h.nmt_send(0x01, 1);
    h.node.tpdo_trig_pdo(0);
    assert_eq!(h.expect_frame().id, 0x181);
}

#[test]
fn tpdo_event_timer_fires_periodically() {
    let mut h = mixed_tpdo_node(255, 0, 200);
    h.nmt_send(0x01, 1);
    h.wait(150);
    h.expect_none();
    h.wait(50);
    assert_eq!(h.expect_frame().id, 0x181);
    h.wait(200);
    assert_eq!(h.expect_frame().id, 0x181);
}

#[test]
fn tpdo_event_timer_restarts_after_application_trigger() {
    let mut h = mixed_tpdo_node(255, 0, 200);
    h.nmt_send(0x01, 1);
    h.wait(200);
    h.expect_frame();
    h.wait(50);
    h.node.tpdo_trig_pdo(0);
    h.expect_frame();
    h.wait(150);
    h.expect_none();
    h.wait(50);
    h.expect_frame();
}

#[test]
fn tpdo_inhibit_defers_triggered_sends() {
    // inhibit 100ms (1000 * 100us), event timer 200ms
    let mut h = mixed_tpdo_node(255, 1000, 200);
    h.nmt_send(0x01, 1);
    h.wait(200);
    h.expect_frame();
    h.wait(50);
    h.node.tpdo_trig_pdo(0);
    h.expect_none();
    h.wait(50);
    assert_eq!(h.expect_frame().id, 0x181);
}

#[test]
fn tpdo_event_time_write_takes_effect_in_operational() {
    let mut h = mixed_tpdo_node(255, 0, 0);
    h.sdo_send(0x2B, 0x1800, 5, 200);
    h.chk_sdo_ok(0x1800, 5);
    h.nmt_send(0x01, 1);
    h.wait(210);
    assert_eq!(h.expect_frame().id, 0x181);
    h.wait(200);
    assert_eq!(h.expect_frame().id, 0x181);
}

#[test]
fn tpdo_operational_reentry_restarts_the_event_timer() {
    let mut h = mixed_tpdo_node(255, 0, 200);
    h.nmt_send(0x01, 1);
    h.wait(200);
    h.expect_frame();
    h.wait(100);
    h.nmt_send(0x01, 1);
    h.wait(190);
    h.expect_none();
    h.wait(10);
    h.expect_frame();
}

#[test]
fn tpdo_event_timer_silent_after_communication_reset() {
    let mut h = mixed_tpdo_node(254, 0, 0);
    h.nmt_send(0x01, 1);
    h.sdo_send(0x2B, 0x1800, 5, 300);
    h.chk_sdo_ok(0x1800, 5);
    h.wait(330);
    h.expect_frame();
    h.nmt_send(130, 1);
    assert_eq!(h.expect_frame().id, 0x701);
    h.node.od_wr_u8(ObjKey::new(0x2500, 0x0B), 0x33).unwrap();
    h.expect_none();
    h.wait(400);
    h.expect_none();
}

// --- Receive PDOs ---

fn rpdo_bytes_node(ttype: u8) -> Harness {
    let mut od = mandatory_dict();
    for sub in 0x0B..=0x12u8 {
        od.add(byte_entry(
            0x2500,
            sub,
            ObjFlags::RW | ObjFlags::PDO_MAP,
            0x90 + (sub - 0x0A),
        ));
    }
    let links: Vec<u32> = (0x0B..=0x12u8)
        .map(|sub| 0x2500_0008 | ((sub as u32) << 8))
        .collect();
    add_rpdo(&mut od, 0, 0x4000_0200, ttype, &links);
    let mut h = Harness::started(od);
    h.nmt_send(0x01, 1);
    h
}

#[test]
fn rpdo_sync_type_commits_on_sync() {
    let mut h = rpdo_bytes_node(1);
    h.feed(0x201, &[0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58]);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x2500, 0x0B)).unwrap(), 0x91);
    h.sync_send();
    for (i, sub) in (0x0B..=0x12u8).enumerate() {
        assert_eq!(
            h.node.od_rd_u8(ObjKey::new(0x2500, sub)).unwrap(),
            0x51 + i as u8
        );
    }
}

#[test]
fn rpdo_async_types_commit_immediately() {
    let mut h = rpdo_bytes_node(254);
    h.feed(0x201, &[0x31, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x2500, 0x0B)).unwrap(), 0x31);
}

#[test]
fn rpdo_short_frames_are_dropped() {
    let mut h = rpdo_bytes_node(255);
    h.feed(0x201, &[0x31, 0x32]);
    assert_eq!(h.node.od_rd_u8(ObjKey::new(0x2500, 0x0B)).unwrap(), 0x91);
}

#[test]
fn rpdo_24_bit_mapping_zeroes_the_top_byte() {
    let mut od = mandatory_dict();
    od.add(ObjectEntry::new(
        ObjKey::new(0x2500, 0x0B),
        ObjFlags::RW | ObjFlags::PDO_MAP,
        ObjData::Long(0x9192_9394),
    ));
    od.add(ObjectEntry::new(
        ObjKey::new(0x2500, 0x15),
        ObjFlags::RW | ObjFlags::PDO_MAP,
        ObjData::Long(0x7172_7374),
    ));
    add_rpdo(&mut od, 0, 0x4000_0200, 1, &[0x2500_0B18, 0x2500_1520]);
    let mut h = Harness::started(od);
    h.nmt_send(0x01, 1);
    h.feed(0x201, &[0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0]);
    h.sync_send();
    assert_eq!(
        h.node.od_rd_u32(ObjKey::new(0x2500, 0x0B)).unwrap(),
        0x0023_2221
    );
    assert_eq!(
        h.node.od_rd_u32(ObjKey::new(0x2500, 0x15)).unwrap(),
        0x2726_2524
    );
}

// --- Dynamic PDO configuration ---

#[test]
fn pdo_cobid_toggles_between_valid_and_invalid() {
    let mut od = mandatory_dict();
    add_rpdo(&mut od, 0, 0x4000_0200, 1, &[]);
    let mut h = Harness::started(od);
    let key = ObjKey::new(0x1400, 1);
    assert!(h.node.od_wr_u32(key, 0xC000_0201).is_ok());
    assert!(h.node.od_wr_u32(key, 0x4000_0201).is_ok());
    // valid -> valid, extended and RTR-enabled writes are refused
    assert_eq!(h.node.od_wr_u32(key, 0x4000_0211), Err(CoError::ObjRange));
    assert_eq!(h.node.od_wr_u32(key, 0xE000_0201), Err(CoError::ObjRange));
    assert_eq!(h.node.od_wr_u32(key, 0x8000_0201), Err(CoError::ObjRange));
}

#[test]
fn pdo_mapping_reconfiguration_needs_invalid_cobid() {
    let mut od = mandatory_dict();
    od.add(byte_entry(0x2500, 31, ObjFlags::RW | ObjFlags::PDO_MAP, 0));
    od.add(byte_entry(0x2500, 32, ObjFlags::RW | ObjFlags::PDO_MAP, 0));
    add_rpdo(&mut od, 0, 0x4000_0200, 1, &[0x2500_1F08, 0x2500_2008, 0]);
    let mut h = Harness::started(od);
    let map = ObjKey::new(0x1600, 0);
    // frozen while the PDO is valid
    assert_eq!(h.node.od_wr_u8(map, 0), Err(CoError::ObjAcc));
    h.node.od_wr_u32(ObjKey::new(0x1400, 1), 0xC000_0201).unwrap();
    h.node.od_wr_u8(map, 0).unwrap();
    h.node
        .od_wr_u32(ObjKey::new(0x1600, 1), 0x2500_1F20)
        .unwrap();
    h.node
        .od_wr_u32(ObjKey::new(0x1600, 2), 0x2500_2020)
        .unwrap();
    h.node.od_wr_u8(map, 2).unwrap();
    h.node.od_wr_u32(ObjKey::new(0x1400, 1), 0x4000_0201).unwrap();
}

#[test]
fn pdo_mapping_count_and_length_limits() {
    let mut od = mandatory_dict();
    od.add(byte_entry(0x2500, 31, ObjFlags::RW | ObjFlags::PDO_MAP, 0));
    add_rpdo(&mut od, 0, 0xC000_0200, 1, &[]);
    let mut h = Harness::started(od);
    assert_eq!(
        h.node.od_wr_u8(ObjKey::new(0x1600, 0), 9),
        Err(CoError::ObjMapLen)
    );
    // a mapped entry must exist, be mappable and match the direction
    assert_eq!(
        h.node.od_wr_u32(ObjKey::new(0x1600, 1), 0x2700_0308),
        Err(CoError::ObjMapType)
    );
    assert_eq!(
        h.node.od_wr_u32(ObjKey::new(0x1600, 1), 0x1000_0020),
        Err(CoError::ObjMapType)
    );
    h.node
        .od_wr_u32(ObjKey::new(0x1600, 1), 0x2500_1F08)
        .unwrap();
    h.node.od_wr_u8(ObjKey::new(0x1600, 0), 1).unwrap();
}

#[test]
fn pdo_cobid_round_trip_keeps_the_mapping() {
    let mut h = mixed_tpdo_node(1, 0, 0);
    h.nmt_send(0x01, 1);
    h.node.od_wr_u32(ObjKey::new(0x1800, 1), 0xC000_0181).unwrap();
    h.sync_send();
    h.expect_none();
    h.node.od_wr_u32(ObjKey::new(0x1800, 1), 0x4000_0181).unwrap();
    h.sync_send();
    let frame = h.expect_frame();
    assert_eq!((frame.id, frame.dlc), (0x181, 7));
}

// --- LSS ---

const IDENTITY: [u32; 4] = [0x1100_0011, 0x2200_0022, 0x3300_0033, 0x4400_0044];

fn lss_node(node_id: u8) -> Harness {
    let mut od = mandatory_dict();
    add_identity(&mut od, IDENTITY);
    let spec = NodeSpec {
        node_id,
        ..NodeSpec::default()
    };
    let mut h = Harness::with_spec(spec, od);
    h.node.start();
    h.flush();
    h
}

#[test]
fn lss_requests_are_consumed_silently() {
    let mut h = lss_node(1);
    h.lss_send(4, &[0; 7]);
    h.expect_none();
}

#[test]
fn lss_selective_switch_answers_on_full_match() {
    let mut h = lss_node(1);
    h.lss_send_long(64, IDENTITY[0]);
    h.lss_send_long(65, IDENTITY[1]);
    h.lss_send_long(66, IDENTITY[2]);
    h.lss_send_long(67, IDENTITY[3]);
    let frame = h.expect_frame();
    assert_eq!((frame.id, frame.data[0]), (0x7E4, 68));
}

#[test]
fn lss_selective_switch_mismatch_is_silent() {
    for wrong in 0..4usize {
        let mut h = lss_node(1);
        for (i, value) in IDENTITY.iter().enumerate() {
            let value = if i == wrong { value + 1 } else { *value };
            h.lss_send_long(64 + i as u8, value);
        }
        h.expect_none();
    }
}

#[test]
fn lss_global_switch_and_node_id_configuration() {
    let mut h = lss_node(1);
    h.lss_send(4, &[1, 0, 0, 0, 0, 0, 0]);
    h.lss_send(17, &[11, 0, 0, 0, 0, 0, 0]);
    let resp = h.expect_frame();
    assert_eq!((resp.data[0], resp.data[1]), (17, 0));
    h.lss_send(23, &[0; 7]);
    let resp = h.expect_frame();
    assert_eq!(resp.data[0], 23);
    assert_eq!(h.events.borrow().lss_store.as_slice(), &[(11, 0)]);
    // the assignment is picked up at the next communication reset
    h.nmt_send(130, 1);
    assert_eq!(h.expect_frame().id, 0x70B);
}

#[test]
fn lss_fastscan_narrows_an_unconfigured_slave() {
    let mut h = lss_node(0xFF);
    for (sub, value) in IDENTITY.iter().enumerate() {
        let mut payload = [0u8; 7];
        payload[..4].copy_from_slice(&value.to_le_bytes());
        payload[4] = 0; // full compare
        payload[5] = sub as u8;
        payload[6] = sub as u8;
        h.lss_send(81, &payload);
        let frame = h.expect_frame();
        assert_eq!((frame.id, frame.data[0]), (0x7E4, 79));
    }
}

#[test]
fn lss_fastscan_ignores_configured_slaves() {
    let mut h = lss_node(1);
    let mut payload = [0u8; 7];
    payload[..4].copy_from_slice(&IDENTITY[0].to_le_bytes());
    h.lss_send(81, &payload);
    h.expect_none();
}

#[test]
fn lss_fastscan_rejects_bad_parameters_silently() {
    let mut h = lss_node(0xFF);
    let mut payload = [0u8; 7];
    payload[..4].copy_from_slice(&IDENTITY[0].to_le_bytes());
    payload[4] = 32; // bit check out of range
    h.lss_send(81, &payload);
    h.expect_none();
    payload[4] = 129;
    h.lss_send(81, &payload);
    h.expect_none();
    payload[4] = 0;
    payload[5] = 4; // lss-sub out of range
    h.lss_send(81, &payload);
    h.expect_none();
    payload[5] = 0;
    payload[6] = 4; // lss-next out of range
    h.lss_send(81, &payload);
    h.expect_none();
}

#[test]
fn lss_fastscan_mismatching_value_is_silent() {
    let mut h = lss_node(0xFF);
    let mut payload = [0u8; 7];
    payload[..4].copy_from_slice(&(IDENTITY[0] - 1).to_le_bytes());
    h.lss_send(81, &payload);
    h.expect_none();
}
