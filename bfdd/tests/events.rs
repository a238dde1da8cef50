//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::atomic;

use bfdd::config::Config;
use bfdd::master::{Master, ProtocolInputChannelsRx};
use bfdd::network::PacketInfo;
use bfdd::packet::{DiagnosticCode, Packet, PacketFlags};
use bfdd::sink::{EventSink, RECORD_LEN};
use bfdd::tasks::messages::ProtocolInputMsg;
use bfdd::tasks::messages::input::{
    DetectTimerMsg, ResetTimerMsg, TxFailureMsg, UdpRxPacketMsg,
};
use bfdd_utils::bfd::State;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

const CONFIG: &str = "
    bfd_instance peer1 {
        neighbor_ip 192.0.2.1
        min_rx 50
        min_tx 50
        multiplier 3
    }
";

const PEER_SRC: &str = "192.0.2.1:49152";
const PEER_DISCR: u32 = 0x1111;

//
// Helper functions.
//

fn new_master(
    config: &str,
) -> (Master, ProtocolInputChannelsRx, UnboundedReceiver<Bytes>) {
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (mut master, channels_rx) = Master::new(EventSink::new(sink_tx));
    master.load_config(Config::parse(config));
    (master, channels_rx, sink_rx)
}

fn packet(state: State, my_discr: u32, your_discr: u32) -> Packet {
    Packet {
        version: 1,
        diag: 0,
        state,
        flags: PacketFlags::empty(),
        detect_mult: 3,
        my_discr,
        your_discr,
        desired_min_tx: 50000,
        req_min_rx: 50000,
        req_min_echo_rx: 0,
    }
}

fn inject_packet(master: &mut Master, src: &str, packet: Packet) {
    let msg = UdpRxPacketMsg {
        packet_info: PacketInfo {
            src: src.parse().unwrap(),
            ttl: Some(255),
        },
        packet,
    };
    master.process_protocol_msg(ProtocolInputMsg::UdpRxPacket(msg));
}

// Walks the session through the three-way handshake and returns its local
// discriminator and ID.
fn bring_up(master: &mut Master) -> (u32, usize) {
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    let local_discr = sess.state.local_discr;
    let sess_id = sess.id;

    inject_packet(master, PEER_SRC, packet(State::Down, PEER_DISCR, 0));
    inject_packet(
        master,
        PEER_SRC,
        packet(State::Init, PEER_DISCR, local_discr),
    );
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Up);

    (local_discr, sess_id)
}

//
// Tests.
//

#[tokio::test]
async fn test_cold_bring_up() {
    let (mut master, _channels_rx, mut sink_rx) = new_master(CONFIG);

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    let local_discr = sess.state.local_discr;
    assert_eq!(sess.state.local_state, State::Down);
    // Sessions start at the idle transmission rate.
    assert_eq!(sess.state.local_tx_interval, 1000000);

    // The peer starts Down without knowing our discriminator.
    inject_packet(&mut master, PEER_SRC, packet(State::Down, PEER_DISCR, 0));
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Init);
    assert_eq!(sess.state.remote.as_ref().unwrap().discr, PEER_DISCR);
    // Not Up yet: the transmission rate stays idle.
    assert_eq!(sess.state.local_tx_interval, 1000000);
    // The detection time follows the peer's timing.
    assert_eq!(sess.state.local_detect_time, 3 * 50000);
    assert!(sess.timers.detection.is_some());

    let record = sink_rx.try_recv().unwrap();
    assert_eq!(record.len(), RECORD_LEN);
    assert_eq!(&record[..5], b"peer1");
    assert_eq!(record[5], 0);
    assert_eq!(record[32], State::Init as u8);

    // The peer echoes our discriminator from the Init state.
    inject_packet(
        &mut master,
        PEER_SRC,
        packet(State::Init, PEER_DISCR, local_discr),
    );
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Up);
    // Up unfreezes the negotiated rate: max(50 ms, peer's min rx 50 ms).
    assert_eq!(sess.state.local_tx_interval, 50000);
    assert_eq!(sess.state.local_detect_time, 3 * 50000);

    let record = sink_rx.try_recv().unwrap();
    assert_eq!(record[32], State::Up as u8);
}

#[tokio::test]
async fn test_down_to_up_is_illegal() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    let local_discr = sess.state.local_discr;

    // A direct Down -> Up transition must go through Init.
    inject_packet(
        &mut master,
        PEER_SRC,
        packet(State::Up, PEER_DISCR, local_discr),
    );
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
}

#[tokio::test]
async fn test_detection_time_expiry() {
    let (mut master, _channels_rx, mut sink_rx) = new_master(CONFIG);
    let (_, sess_id) = bring_up(&mut master);
    while sink_rx.try_recv().is_ok() {}

    let msg = DetectTimerMsg { sess_id };
    master.process_protocol_msg(ProtocolInputMsg::DetectTimer(msg));

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::TimeExpired);
    // The peer's discriminator is forgotten, the rest of its parameters
    // stick around.
    assert_eq!(sess.state.remote.as_ref().unwrap().discr, 0);
    // Fall actions: idle rate restored, detection cancelled, reset armed.
    assert_eq!(sess.state.local_tx_interval, 1000000);
    assert!(sess.timers.detection.is_none());
    assert!(sess.timers.reset.is_some());

    let record = sink_rx.try_recv().unwrap();
    assert_eq!(record[32], State::Down as u8);
}

#[tokio::test]
async fn test_session_reset() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (local_discr, sess_id) = bring_up(&mut master);

    let msg = DetectTimerMsg { sess_id };
    master.process_protocol_msg(ProtocolInputMsg::DetectTimer(msg));

    let msg = ResetTimerMsg { sess_id };
    master.process_protocol_msg(ProtocolInputMsg::ResetTimer(msg));

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    // Back to the initial protocol state, under a fresh discriminator.
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::Nothing);
    assert_ne!(sess.state.local_discr, local_discr);
    assert_ne!(sess.state.local_discr, 0);
    assert!(sess.state.remote.is_none());
    assert!(sess.timers.reset.is_none());
    assert_eq!(sess.state.local_detect_time, 0);
}

#[tokio::test]
async fn test_remote_admin_down() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (local_discr, _) = bring_up(&mut master);

    inject_packet(
        &mut master,
        PEER_SRC,
        packet(State::AdminDown, PEER_DISCR, local_discr),
    );

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::NbrDown);
}

#[tokio::test]
async fn test_tx_failure() {
    let (mut master, _channels_rx, mut sink_rx) = new_master(CONFIG);
    let (local_discr, sess_id) = bring_up(&mut master);
    while sink_rx.try_recv().is_ok() {}

    let msg = TxFailureMsg { sess_id };
    master.process_protocol_msg(ProtocolInputMsg::TxFailure(msg));

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::AdminDown);
    assert_eq!(sess.state.local_diag, DiagnosticCode::AdminDown);
    assert!(!sess.should_transmit());
    assert!(sess.timers.detection.is_none());
    assert!(sess.timers.reset.is_none());

    let record = sink_rx.try_recv().unwrap();
    assert_eq!(record[32], State::AdminDown as u8);

    // Inbound packets are discarded while administratively down.
    let rx_packet_count = sess.statistics.rx_packet_count;
    inject_packet(
        &mut master,
        PEER_SRC,
        packet(State::Down, PEER_DISCR, local_discr),
    );
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::AdminDown);
    assert_eq!(sess.statistics.rx_packet_count, rx_packet_count);
}

#[tokio::test]
async fn test_ttl_check() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);

    // A forwarded packet must be discarded.
    let msg = UdpRxPacketMsg {
        packet_info: PacketInfo {
            src: PEER_SRC.parse().unwrap(),
            ttl: Some(254),
        },
        packet: packet(State::Down, PEER_DISCR, 0),
    };
    master.process_protocol_msg(ProtocolInputMsg::UdpRxPacket(msg));
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert!(sess.state.remote.is_none());

    // Without an observable TTL the packet is accepted.
    let msg = UdpRxPacketMsg {
        packet_info: PacketInfo {
            src: PEER_SRC.parse().unwrap(),
            ttl: None,
        },
        packet: packet(State::Down, PEER_DISCR, 0),
    };
    master.process_protocol_msg(ProtocolInputMsg::UdpRxPacket(msg));
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Init);
}

#[tokio::test]
async fn test_session_no_match() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);

    // Unknown source address, no discriminator to go by.
    inject_packet(
        &mut master,
        "198.51.100.1:49152",
        packet(State::Down, PEER_DISCR, 0),
    );
    // Unknown discriminator.
    inject_packet(
        &mut master,
        PEER_SRC,
        packet(State::Down, PEER_DISCR, 0xdeadbeef),
    );

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert!(sess.state.remote.is_none());
}

#[tokio::test]
async fn test_poll_answered_with_final() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (local_discr, _) = bring_up(&mut master);

    // The peer starts a Poll Sequence, slowing its transmissions down.
    let mut poll = packet(State::Up, PEER_DISCR, local_discr);
    poll.flags = PacketFlags::P;
    poll.desired_min_tx = 200000;
    inject_packet(&mut master, PEER_SRC, poll);

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    // A Final is owed to the peer.
    assert!(sess.state.final_pending.load(atomic::Ordering::Relaxed));
    // The new timing is applied immediately, even though the session is Up.
    assert_eq!(sess.state.remote_tx_interval, 200000);
    assert_eq!(sess.state.local_detect_time, 3 * 200000);
}

#[tokio::test]
async fn test_final_terminates_poll() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (local_discr, _) = bring_up(&mut master);

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    sess.state
        .poll_active
        .store(true, atomic::Ordering::Relaxed);

    // While the session is Up, timing parameters are frozen without a Poll
    // Sequence.
    let mut plain = packet(State::Up, PEER_DISCR, local_discr);
    plain.req_min_rx = 300000;
    inject_packet(&mut master, PEER_SRC, plain);
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_tx_interval, 50000);

    // The peer's Final both ends the Poll Sequence and unfreezes them.
    let mut fin = packet(State::Up, PEER_DISCR, local_discr);
    fin.flags = PacketFlags::F;
    fin.req_min_rx = 300000;
    inject_packet(&mut master, PEER_SRC, fin);
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert!(!sess.state.poll_active.load(atomic::Ordering::Relaxed));
    assert_eq!(sess.state.local_tx_interval, 300000);
}

#[tokio::test]
async fn test_demand_mode_suppression() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (local_discr, _) = bring_up(&mut master);

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert!(sess.should_transmit());

    // The peer asserts Demand mode with both systems Up: periodic
    // transmission stops.
    let mut demand = packet(State::Up, PEER_DISCR, local_discr);
    demand.flags = PacketFlags::D;
    inject_packet(&mut master, PEER_SRC, demand);
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert!(!sess.should_transmit());

    // Clearing the Demand bit resumes it.
    inject_packet(
        &mut master,
        PEER_SRC,
        packet(State::Up, PEER_DISCR, local_discr),
    );
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert!(sess.should_transmit());
}

#[tokio::test]
async fn test_reload_preserves_state() {
    let (mut master, _channels_rx, mut sink_rx) = new_master(CONFIG);
    let (local_discr, sess_id) = bring_up(&mut master);
    while sink_rx.try_recv().is_ok() {}

    master.suspend();
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    // The armed detection timer is parked in its saved slot.
    assert!(sess.timers.detection.is_none());
    assert!(sess.timers.saved_detection.is_some());

    master.merge_config(Config::parse(CONFIG));

    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert_eq!(sess.state.local_state, State::Up);
    assert_eq!(sess.state.local_discr, local_discr);
    assert_eq!(sess.id, sess_id);
    assert!(sess.timers.saved_detection.is_some());
    // No spurious transition was notified.
    assert_eq!(sink_rx.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test]
async fn test_reload_removes_and_adds_sessions() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    bring_up(&mut master);

    master.suspend();
    master.merge_config(Config::parse(
        "
        bfd_instance peer2 {
            neighbor_ip 192.0.2.2
        }
        ",
    ));

    assert!(master.sessions.get_by_name("peer1").is_none());
    let (_, sess) = master.sessions.get_by_name("peer2").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
}

#[tokio::test]
async fn test_final_precedence_over_poll() {
    let (mut master, _channels_rx, _sink_rx) = new_master(CONFIG);
    let (local_discr, _) = bring_up(&mut master);

    // The peer's Poll leaves a Final pending (it cannot be flushed without
    // a socket).
    let mut poll = packet(State::Up, PEER_DISCR, local_discr);
    poll.flags = PacketFlags::P;
    inject_packet(&mut master, PEER_SRC, poll);

    // A reload changing the timing of an Up session normally starts a Poll
    // Sequence, but the pending Final takes precedence.
    master.suspend();
    master.merge_config(Config::parse(
        "
        bfd_instance peer1 {
            neighbor_ip 192.0.2.1
            min_rx 50
            min_tx 20
            multiplier 3
        }
        ",
    ));
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert!(!sess.state.poll_active.load(atomic::Ordering::Relaxed));

    // Once the Final is out of the way, the next change does start one.
    sess.state
        .final_pending
        .store(false, atomic::Ordering::Relaxed);
    master.suspend();
    master.merge_config(Config::parse(CONFIG));
    let (_, sess) = master.sessions.get_by_name("peer1").unwrap();
    assert!(sess.state.poll_active.load(atomic::Ordering::Relaxed));
}

#[tokio::test]
async fn test_duplicate_instances_disabled() {
    let (master, _channels_rx, _sink_rx) = new_master(
        "
        bfd_instance foo {
            neighbor_ip 192.0.2.1
        }
        bfd_instance foo {
            neighbor_ip 192.0.2.2
        }
        ",
    );

    let (_, sess) = master.sessions.get_by_name("foo").unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    let (_, sess) = master.sessions.get_by_name("<DUP-2>").unwrap();
    assert_eq!(sess.state.local_state, State::AdminDown);
    assert!(!sess.should_transmit());
}

#[tokio::test]
async fn test_discriminator_uniqueness() {
    let (master, _channels_rx, _sink_rx) = new_master(
        "
        bfd_instance peer1 { neighbor_ip 192.0.2.1 }
        bfd_instance peer2 { neighbor_ip 192.0.2.2 }
        bfd_instance peer3 { neighbor_ip 192.0.2.3 }
        ",
    );

    let discrs: std::collections::HashSet<_> = master
        .sessions
        .iter()
        .map(|sess| sess.state.local_discr)
        .collect();
    assert_eq!(discrs.len(), 3);
    assert!(!discrs.contains(&0));
}
