//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bfdd_utils::bfd::State;
use bfdd_utils::ip::IpAddrExt;
use bfdd_utils::socket::UdpSocket;
use bfdd_utils::task::Task;
use bfdd_utils::{Receiver, Sender};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::packet::DiagnosticCode;
use crate::session::Sessions;
use crate::sink::EventSink;
use crate::tasks::messages::ProtocolInputMsg;
use crate::tasks::messages::input::{
    DetectTimerMsg, ResetTimerMsg, TxFailureMsg, UdpRxPacketMsg,
};
use crate::{events, network, tasks};

#[derive(Debug)]
pub struct Master {
    // BFD sessions.
    pub sessions: Sessions,
    // Shared Rx socket. It outlives reloads so peers never see a closed
    // port.
    socket_rx: Option<Arc<UdpSocket>>,
    // UDP Rx task.
    udp_rx_task: Option<Task<()>>,
    // Channels towards the main task and the supervisor.
    pub tx: InstanceChannelsTx,
}

// Output channels of the main task.
#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    pub protocol_input: ProtocolInputChannelsTx,
    pub sink: EventSink,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // UDP Rx event.
    pub udp_packet_rx: Sender<UdpRxPacketMsg>,
    // Detection timer.
    pub detect_timer: Sender<DetectTimerMsg>,
    // Reset timer.
    pub reset_timer: Sender<ResetTimerMsg>,
    // Transmit failure.
    pub tx_failure: Sender<TxFailureMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    // UDP Rx event.
    pub udp_packet_rx: Receiver<UdpRxPacketMsg>,
    // Detection timer.
    pub detect_timer: Receiver<DetectTimerMsg>,
    // Reset timer.
    pub reset_timer: Receiver<ResetTimerMsg>,
    // Transmit failure.
    pub tx_failure: Receiver<TxFailureMsg>,
}

// ===== impl Master =====

impl Master {
    // Creates the BFD master context and the input endpoints of its event
    // loop.
    pub fn new(sink: EventSink) -> (Master, ProtocolInputChannelsRx) {
        let (protocol_input_tx, protocol_input_rx) =
            Self::protocol_input_channels();

        let master = Master {
            sessions: Default::default(),
            socket_rx: None,
            udp_rx_task: None,
            tx: InstanceChannelsTx {
                protocol_input: protocol_input_tx,
                sink,
            },
        };

        (master, protocol_input_rx)
    }

    // Creates channels for all protocol input events.
    fn protocol_input_channels()
    -> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
        let (udp_packet_rxp, udp_packet_rxc) = mpsc::channel(4);
        let (detect_timerp, detect_timerc) = mpsc::channel(4);
        let (reset_timerp, reset_timerc) = mpsc::channel(4);
        let (tx_failurep, tx_failurec) = mpsc::channel(4);

        let tx = ProtocolInputChannelsTx {
            udp_packet_rx: udp_packet_rxp,
            detect_timer: detect_timerp,
            reset_timer: reset_timerp,
            tx_failure: tx_failurep,
        };
        let rx = ProtocolInputChannelsRx {
            udp_packet_rx: udp_packet_rxc,
            detect_timer: detect_timerc,
            reset_timer: reset_timerc,
            tx_failure: tx_failurec,
        };

        (tx, rx)
    }

    // Loads the initial configuration, creating one session per instance.
    pub fn load_config(&mut self, config: Config) {
        for instance in config.instances {
            self.sessions.insert(instance);
        }
    }

    // Starts (or resumes, after a reload) protocol operation: opens the
    // shared Rx socket if needed, spawns the Rx task, opens the per-session
    // Tx sockets and arms the timers.
    //
    // Failure to open the shared Rx socket is fatal. Failure to open a
    // session's Tx socket takes only that session out of service.
    pub fn start(&mut self) -> Result<(), Error> {
        Debug::DispatcherStart.log();

        if self.socket_rx.is_none() {
            let socket =
                network::socket_rx().map_err(IoError::UdpSocketError)?;
            self.socket_rx = Some(Arc::new(socket));
        }
        let socket_rx = self.socket_rx.clone().unwrap();
        self.udp_rx_task = Some(tasks::udp_rx(
            socket_rx,
            &self.tx.protocol_input.udp_packet_rx,
        ));

        for sess in self.sessions.iter_mut() {
            if sess.state.local_state == State::AdminDown {
                continue;
            }
            let Some(nbr_addr) = sess.config.nbr_addr else {
                continue;
            };

            let af = nbr_addr.address_family();
            let src_addr = sess
                .config
                .src_addr
                .unwrap_or_else(|| IpAddr::unspecified(af));
            match network::socket_tx(af, src_addr) {
                Ok(socket) => {
                    sess.state.socket_tx = Some(Arc::new(socket));
                    sess.state.sockaddr =
                        Some(SocketAddr::new(nbr_addr, network::PORT_DST));
                }
                Err(error) => {
                    IoError::UdpSocketError(error).log();
                    sess.state_update(
                        State::AdminDown,
                        DiagnosticCode::AdminDown,
                        &self.tx,
                    );
                    continue;
                }
            }

            sess.resume_timers(&self.tx.protocol_input);
        }

        Ok(())
    }

    // Releases the dispatcher ahead of a reload: stops the Rx task, parks
    // every armed timer in its saved slot and closes the per-session Tx
    // sockets. The shared Rx socket stays open.
    pub fn suspend(&mut self) {
        Debug::DispatcherSuspend.log();

        self.udp_rx_task = None;
        for sess in self.sessions.iter_mut() {
            sess.suspend_timers();
            sess.state.socket_tx = None;
            sess.state.sockaddr = None;
        }
    }

    // Applies a freshly parsed configuration. Sessions whose name matches a
    // pre-reload session keep their identity and protocol state, including
    // the saved timer deadlines. Call between suspend() and start().
    pub fn merge_config(&mut self, config: Config) {
        let mut old = std::mem::take(&mut self.sessions);
        let mut sessions = Sessions::default();

        // First pass: carry matching sessions forward.
        let mut fresh = Vec::new();
        for instance in config.instances {
            let Some(mut sess) = old.take_by_name(&instance.name) else {
                fresh.push(instance);
                continue;
            };

            // Changing the timing parameters of a running session calls for
            // a Poll Sequence.
            if sess.state.local_state == State::Up
                && (sess.config.min_tx != instance.min_tx
                    || sess.config.min_rx != instance.min_rx)
            {
                sess.poll_sequence_start();
            }

            let was_enabled = sess.config.enabled;
            sess.config = instance;
            if was_enabled
                && !sess.config.enabled
                && sess.state.local_state != State::AdminDown
            {
                sess.state_update(
                    State::AdminDown,
                    DiagnosticCode::AdminDown,
                    &self.tx,
                );
            } else if !was_enabled
                && sess.config.enabled
                && sess.state.local_state == State::AdminDown
            {
                // Taken back into service: restart from the bottom.
                sess.state_update(
                    State::Down,
                    DiagnosticCode::Nothing,
                    &self.tx,
                );
            }

            sessions.insert_existing(sess);
        }

        // Second pass: create the remaining sessions, drawing their
        // discriminators against the carried-over ones.
        for instance in fresh {
            sessions.insert(instance);
        }

        self.sessions = sessions;
        // Sessions removed from the configuration are dropped here, along
        // with their timers and sockets.
    }

    // Runs the event loop until all input channels are closed.
    pub async fn run(&mut self, mut rx: ProtocolInputChannelsRx) {
        while let Some(msg) = rx.recv().await {
            self.process_protocol_msg(msg);
        }
    }

    // Processes a single protocol input message.
    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        if let Err(error) = process_protocol_msg(self, msg) {
            error.log();
        }
    }

    // Stops protocol operation, closing all sockets and freeing all state.
    pub fn shutdown(mut self) {
        self.suspend();
        self.socket_rx = None;
        self.sessions = Default::default();
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    // Receives the next event from any of the input channels.
    pub async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            msg = self.udp_packet_rx.recv() => {
                msg.map(ProtocolInputMsg::UdpRxPacket)
            }
            msg = self.detect_timer.recv() => {
                msg.map(ProtocolInputMsg::DetectTimer)
            }
            msg = self.reset_timer.recv() => {
                msg.map(ProtocolInputMsg::ResetTimer)
            }
            msg = self.tx_failure.recv() => {
                msg.map(ProtocolInputMsg::TxFailure)
            }
        }
    }
}

// ===== helper functions =====

fn process_protocol_msg(
    master: &mut Master,
    msg: ProtocolInputMsg,
) -> Result<(), Error> {
    match msg {
        // Received UDP packet.
        ProtocolInputMsg::UdpRxPacket(msg) => {
            events::process_udp_packet(master, msg.packet_info, msg.packet)?;
        }
        // Session detection timer expired.
        ProtocolInputMsg::DetectTimer(msg) => {
            events::process_detection_timer_expiry(master, msg.sess_id)?;
        }
        // Session reset timer expired.
        ProtocolInputMsg::ResetTimer(msg) => {
            events::process_reset_timer_expiry(master, msg.sess_id)?;
        }
        // Session transmit failure.
        ProtocolInputMsg::TxFailure(msg) => {
            events::process_tx_failure(master, msg.sess_id)?;
        }
    }

    Ok(())
}
