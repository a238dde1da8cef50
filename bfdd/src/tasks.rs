//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, atomic};
use std::time::Duration;

use bfdd_utils::Sender;
use bfdd_utils::socket::UdpSocket;
use bfdd_utils::task::{IntervalTask, Jitter, Task, TimeoutTask};
use tracing::Instrument;

use crate::network;
use crate::packet::PacketFlags;
use crate::session::{Session, SessionId};

//
// BFD tasks diagram:
//                                +--------------+
//                                |  supervisor  |
//                                +--------------+
//                                       ^
//                                       | (1x) event sink
//                                +--------------+
//                 udp_rx (1x) -> |              | -> (Nx) udp_tx_interval
//        detection_timer (Nx) -> |    master    | -> (Nx) udp_tx_final
//            reset_timer (Nx) -> |              |
//             tx_failure (Nx) -> |              |
//                                +--------------+
//

// Per-packet transmit jitter (RFC 5880, section 6.8.2: the interval between
// transmissions must be reduced to 75%-90% of the negotiated value).
const TX_JITTER: Jitter = Jitter::new(10, 25);

// BFD inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    use crate::network::PacketInfo;
    use crate::packet::Packet;
    use crate::session::SessionId;

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use super::*;

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            UdpRxPacket(UdpRxPacketMsg),
            DetectTimer(DetectTimerMsg),
            ResetTimer(ResetTimerMsg),
            TxFailure(TxFailureMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct UdpRxPacketMsg {
            pub packet_info: PacketInfo,
            pub packet: Packet,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct DetectTimerMsg {
            pub sess_id: SessionId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct ResetTimerMsg {
            pub sess_id: SessionId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TxFailureMsg {
            pub sess_id: SessionId,
        }
    }
}

// ===== BFD tasks =====

// UDP Rx task.
pub(crate) fn udp_rx(
    socket: Arc<UdpSocket>,
    udp_packet_rxp: &Sender<messages::input::UdpRxPacketMsg>,
) -> Task<()> {
    let udp_packet_rxp = udp_packet_rxp.clone();
    Task::spawn(
        async move {
            let _ = network::read_loop(socket, udp_packet_rxp).await;
        }
        .in_current_span(),
    )
}

// Sends periodic BFD control packets.
pub(crate) fn udp_tx_interval(
    sess: &Session,
    first_delay: Option<Duration>,
    socket: &Arc<UdpSocket>,
    sockaddr: SocketAddr,
    tx_failurep: &Sender<messages::input::TxFailureMsg>,
) -> IntervalTask {
    let interval =
        Duration::from_micros(sess.state.local_tx_interval as u64);
    let packet = sess.generate_packet();
    let sess_id = sess.id;

    // Clone reference-counted pointers.
    let socket = socket.clone();
    let poll_active = sess.state.poll_active.clone();
    let final_pending = sess.state.final_pending.clone();
    let tx_packet_count = sess.statistics.tx_packet_count.clone();
    let tx_error_count = sess.statistics.tx_error_count.clone();
    let tx_failurep = tx_failurep.clone();

    IntervalTask::new(interval, Some(TX_JITTER), first_delay, move || {
        // Clone reference-counted pointers.
        let socket = socket.clone();
        let tx_packet_count = tx_packet_count.clone();
        let tx_error_count = tx_error_count.clone();
        let tx_failurep = tx_failurep.clone();

        // Update the P/F bits as necessary.
        let mut packet = packet.clone();
        packet.flags = tx_flags(&poll_active, &final_pending);

        // Send packet.
        network::send_packet(
            socket,
            sockaddr,
            packet,
            sess_id,
            tx_packet_count,
            tx_error_count,
            tx_failurep,
        )
    })
}

// Sends a single BFD control packet answering a Poll, outside the periodic
// cadence.
pub(crate) fn udp_tx_final(
    sess: &Session,
    socket: &Arc<UdpSocket>,
    sockaddr: SocketAddr,
    tx_failurep: &Sender<messages::input::TxFailureMsg>,
) {
    let mut packet = sess.generate_packet();
    packet.flags = tx_flags(&sess.state.poll_active, &sess.state.final_pending);
    let sess_id = sess.id;

    // Clone reference-counted pointers.
    let socket = socket.clone();
    let tx_packet_count = sess.statistics.tx_packet_count.clone();
    let tx_error_count = sess.statistics.tx_error_count.clone();
    let tx_failurep = tx_failurep.clone();

    // Send the packet asynchronously.
    let mut task = Task::spawn(
        async move {
            network::send_packet(
                socket,
                sockaddr,
                packet,
                sess_id,
                tx_packet_count,
                tx_error_count,
                tx_failurep,
            )
            .await;
        }
        .in_current_span(),
    );
    task.detach();
}

// BFD session detection timer.
pub(crate) fn detection_timer(
    sess_id: SessionId,
    holdtime: Duration,
    detect_timerp: &Sender<messages::input::DetectTimerMsg>,
) -> TimeoutTask {
    let detect_timerp = detect_timerp.clone();
    TimeoutTask::new(holdtime, move || async move {
        let msg = messages::input::DetectTimerMsg { sess_id };
        let _ = detect_timerp.send(msg).await;
    })
}

// BFD session reset timer.
pub(crate) fn reset_timer(
    sess_id: SessionId,
    holdtime: Duration,
    reset_timerp: &Sender<messages::input::ResetTimerMsg>,
) -> TimeoutTask {
    let reset_timerp = reset_timerp.clone();
    TimeoutTask::new(holdtime, move || async move {
        let msg = messages::input::ResetTimerMsg { sess_id };
        let _ = reset_timerp.send(msg).await;
    })
}

// ===== helper functions =====

// Computes the flags of an outgoing packet. A pending Final answers the
// peer's Poll and wins over our own Poll bit, so a packet never carries
// both.
fn tx_flags(
    poll_active: &AtomicBool,
    final_pending: &AtomicBool,
) -> PacketFlags {
    if final_pending.swap(false, atomic::Ordering::Relaxed) {
        PacketFlags::F
    } else if poll_active.load(atomic::Ordering::Relaxed) {
        PacketFlags::P
    } else {
        PacketFlags::empty()
    }
}
