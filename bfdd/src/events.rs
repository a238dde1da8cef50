//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Instant;

use bfdd_utils::bfd::State;
use bfdd_utils::socket::TTL_MAX;
use tracing::trace;

use crate::debug::Debug;
use crate::error::Error;
use crate::master::Master;
use crate::network::PacketInfo;
use crate::packet::{DiagnosticCode, Packet, PacketFlags};
use crate::session::{SessionId, SessionRemoteInfo};

pub(crate) fn process_udp_packet(
    master: &mut Master,
    packet_info: PacketInfo,
    packet: Packet,
) -> Result<(), Error> {
    trace!(?packet_info, ?packet, "received packet");

    // GTSM (RFC 5881): when the TTL of the packet is observable, it must not
    // have been forwarded.
    if let Some(ttl) = packet_info.ttl
        && ttl != TTL_MAX
    {
        return Err(Error::UdpInvalidTtl(packet_info.src.ip(), ttl));
    }

    // Session lookup varies depending on whether the Your Discriminator field
    // is zero or not.
    let Some((_, sess)) = (match packet.your_discr {
        0 => master.sessions.get_mut_by_addr(&packet_info.src.ip()),
        _ => master.sessions.get_mut_by_discr(packet.your_discr),
    }) else {
        // Discard the packet.
        return Err(Error::SessionNoMatch(packet_info, packet.your_discr));
    };

    // Inbound packets are ignored while administratively down.
    if sess.state.local_state == State::AdminDown {
        return Ok(());
    }

    // Update packet counter.
    sess.statistics.rx_packet_count += 1;

    // Update the session's view of the remote system.
    sess.state.remote = Some(SessionRemoteInfo::new(
        packet.state,
        packet.my_discr,
        packet.diag,
        packet.detect_mult,
        packet.desired_min_tx,
        packet.req_min_rx,
        packet.flags.contains(PacketFlags::D),
    ));

    // If a Poll Sequence is being transmitted by the local system and the
    // Final (F) bit in the received packet is set, the Poll Sequence MUST be
    // terminated.
    if packet.flags.contains(PacketFlags::F) && sess.poll_sequence_is_active()
    {
        sess.poll_sequence_terminate();
    }

    // Update the effective intervals as described in section 6.8.2. They are
    // frozen while the session is Up, unless a Poll Sequence is in progress
    // on either side.
    let old_local_tx_interval = sess.state.local_tx_interval;
    if sess.state.local_state != State::Up
        || packet.flags.intersects(PacketFlags::P | PacketFlags::F)
    {
        sess.update_local_tx_interval();
        sess.update_remote_tx_interval();
    }
    sess.update_detection_times();

    // A lowered Tx interval is honored immediately; a raised one takes
    // effect on the next transmission.
    let mut resync_tx = sess.state.local_tx_interval < old_local_tx_interval;

    // Invoke FSM event.
    let next_state = match (sess.state.local_state, packet.state) {
        (State::Init | State::Up, State::AdminDown) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        (State::Down, State::Down) => {
            Some((State::Init, DiagnosticCode::Nothing))
        }
        (State::Down, State::Init) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Init, State::Init | State::Up) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Up, State::Down) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        _ => None,
    };
    match next_state {
        Some((state, diag)) => {
            // Effectively transition to the new FSM state. The entry actions
            // take care of resynchronizing the Tx task.
            sess.state_update(state, diag, &master.tx);
        }
        None => {
            // Demand mode of the remote system can suppress or resume the
            // periodic transmission without a state transition.
            if sess.should_transmit() != sess.timers.tx_interval.is_some() {
                resync_tx = true;
            }
            if resync_tx {
                sess.update_tx_interval(&master.tx.protocol_input.tx_failure);
            }
        }
    }

    // If the Poll (P) bit is set, send a BFD Control packet to the remote
    // system with the Poll (P) bit clear, and the Final (F) bit set.
    if packet.flags.contains(PacketFlags::P) {
        sess.send_tx_final(&master.tx.protocol_input.tx_failure);
    }

    // The packet proves the peer is alive.
    sess.state.last_seen = Some(Instant::now());
    if matches!(sess.state.local_state, State::Init | State::Up) {
        sess.update_detection_time(&master.tx.protocol_input.detect_timer);
    }

    Ok(())
}

pub(crate) fn process_detection_timer_expiry(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master.sessions.get_mut_by_id(sess_id)?;

    // A queued expiry can outlive the state it was armed in.
    if !matches!(sess.state.local_state, State::Init | State::Up) {
        Debug::StaleEvent(sess.name(), "detection timer").log();
        return Ok(());
    }

    Debug::DetectionTimeExpiry(sess.name()).log();

    // Forget the peer's discriminator before advertising the failure.
    if let Some(remote) = &mut sess.state.remote {
        remote.discr = 0;
    }

    // Transition to the "Down" state.
    sess.state_update(State::Down, DiagnosticCode::TimeExpired, &master.tx);

    Ok(())
}

pub(crate) fn process_reset_timer_expiry(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (sess_idx, sess) = master.sessions.get_mut_by_id(sess_id)?;

    // The reset only applies to a session still stuck in Down.
    if sess.state.local_state != State::Down {
        Debug::StaleEvent(sess.name(), "reset timer").log();
        return Ok(());
    }

    // Return the session to its initial protocol state, under a fresh
    // discriminator.
    let local_discr = master.sessions.reroll_discr(sess_idx);
    let sess = &mut master.sessions[sess_idx];
    sess.reset_state(local_discr);

    // Refresh the Tx task so outgoing packets carry the new discriminator.
    sess.update_tx_interval(&master.tx.protocol_input.tx_failure);

    Ok(())
}

pub(crate) fn process_tx_failure(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master.sessions.get_mut_by_id(sess_id)?;

    if sess.state.local_state == State::AdminDown {
        Debug::StaleEvent(sess.name(), "transmit failure").log();
        return Ok(());
    }

    // Take the session out of service until the operator intervenes.
    sess.state_update(State::AdminDown, DiagnosticCode::AdminDown, &master.tx);

    Ok(())
}
